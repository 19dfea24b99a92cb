use std::collections::HashMap;

use serde_json::Value;

use crate::error::NormalizeError;
use crate::schema::lookup_path;
use crate::types::{
    CanonicalEvent, CustomerId, EventId, EventMetadata, OriginalDelivery, RawDelivery, TenantId,
};

/// Declarative mapping from one source's payload shape into the
/// canonical event. Pure: same payload in, same event out (modulo a
/// generated id when the source supplies none).
///
/// Adding a source means adding a mapping; the router is untouched.
#[derive(Debug, Clone, Default)]
pub struct SourceMapping {
    /// Payload path of the platform-supplied event id. `None` generates
    /// a UUID, which also disables duplicate detection for that source.
    pub event_id_path: Option<String>,
    /// Payload path of the raw event type. Required.
    pub event_type_path: String,
    /// Exact raw-type to `verb.noun` overrides, consulted before the
    /// generic normalization.
    pub event_type_map: HashMap<String, String>,
    pub tenant_path: Option<String>,
    pub customer_path: Option<String>,
    /// `(canonical key, payload path)` projections into `data`.
    /// Empty projects the payload's top-level object fields verbatim.
    pub data_paths: Vec<(String, String)>,
}

impl SourceMapping {
    pub fn new(event_type_path: impl Into<String>) -> Self {
        Self {
            event_type_path: event_type_path.into(),
            ..Self::default()
        }
    }

    pub fn with_event_id_path(mut self, path: impl Into<String>) -> Self {
        self.event_id_path = Some(path.into());
        self
    }

    pub fn with_event_type_mapping(
        mut self,
        raw: impl Into<String>,
        canonical: impl Into<String>,
    ) -> Self {
        self.event_type_map.insert(raw.into(), canonical.into());
        self
    }

    pub fn with_tenant_path(mut self, path: impl Into<String>) -> Self {
        self.tenant_path = Some(path.into());
        self
    }

    pub fn with_customer_path(mut self, path: impl Into<String>) -> Self {
        self.customer_path = Some(path.into());
        self
    }

    pub fn with_data_field(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.data_paths.push((key.into(), path.into()));
        self
    }

    /// Extract (or generate) the idempotency key before normalization,
    /// so the replay guard can run ahead of the schema validator.
    pub fn extract_event_id(&self, payload: &Value) -> Result<EventId, NormalizeError> {
        match &self.event_id_path {
            None => Ok(EventId::generate()),
            Some(path) => match lookup_path(payload, path) {
                Some(Value::String(s)) if !s.is_empty() => Ok(EventId(s.clone())),
                Some(Value::Number(n)) => Ok(EventId(n.to_string())),
                Some(other) => Err(NormalizeError::UnexpectedShape(
                    path.clone(),
                    format!("expected a string id, got {other}"),
                )),
                None => Err(NormalizeError::MissingField(path.clone())),
            },
        }
    }

    /// Map a verified, schema-valid payload into a canonical event.
    ///
    /// The original headers and body are preserved verbatim under
    /// `original`. Mapping failures are permanent.
    pub fn normalize(
        &self,
        delivery: &RawDelivery,
        payload: &Value,
    ) -> Result<CanonicalEvent, NormalizeError> {
        if !payload.is_object() {
            return Err(NormalizeError::NotAnObject);
        }

        let event_id = self.extract_event_id(payload)?;

        let raw_type = match lookup_path(payload, &self.event_type_path) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(other) => {
                return Err(NormalizeError::UnexpectedShape(
                    self.event_type_path.clone(),
                    format!("expected a string event type, got {other}"),
                ))
            }
            None => return Err(NormalizeError::MissingField(self.event_type_path.clone())),
        };
        let event_type = self
            .event_type_map
            .get(&raw_type)
            .cloned()
            .unwrap_or_else(|| normalize_event_type(&raw_type));

        let tenant_id = self
            .extract_optional_string(payload, self.tenant_path.as_deref())?
            .map(TenantId);
        let customer_id = self
            .extract_optional_string(payload, self.customer_path.as_deref())?
            .map(CustomerId);

        let mut data = serde_json::Map::new();
        if self.data_paths.is_empty() {
            if let Some(object) = payload.as_object() {
                data = object.clone();
            }
        } else {
            for (key, path) in &self.data_paths {
                match lookup_path(payload, path) {
                    Some(value) => {
                        data.insert(key.clone(), value.clone());
                    }
                    None => {
                        return Err(NormalizeError::MissingField(path.clone()));
                    }
                }
            }
        }

        Ok(CanonicalEvent {
            event_id,
            source: delivery.source.clone(),
            event_type,
            received_at: delivery.received_at,
            processed_at: None,
            tenant_id,
            customer_id,
            data,
            original: OriginalDelivery::from_delivery(delivery),
            metadata: EventMetadata::default(),
        })
    }

    fn extract_optional_string(
        &self,
        payload: &Value,
        path: Option<&str>,
    ) -> Result<Option<String>, NormalizeError> {
        let Some(path) = path else { return Ok(None) };
        match lookup_path(payload, path) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
            Some(Value::String(_)) => Ok(None),
            Some(other) => Err(NormalizeError::UnexpectedShape(
                path.to_string(),
                format!("expected a string, got {other}"),
            )),
        }
    }
}

/// Fold an arbitrary raw event name into `verb.noun` style:
/// lowercased, camel-case boundaries and separators become dots.
/// `ContactCreate` -> `contact.create`, `INVOICE_PAID` -> `invoice.paid`.
pub fn normalize_event_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.chars() {
        if ch == '_' || ch == '-' || ch == ' ' || ch == '/' || ch == '.' {
            if !out.ends_with('.') && !out.is_empty() {
                out.push('.');
            }
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower && !out.ends_with('.') && !out.is_empty() {
                out.push('.');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out.trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ghl_mapping() -> SourceMapping {
        SourceMapping::new("type")
            .with_event_id_path("id")
            .with_event_type_mapping("ContactCreate", "contact.created")
            .with_tenant_path("locationId")
            .with_customer_path("contact.id")
            .with_data_field("email", "contact.email")
            .with_data_field("name", "contact.name")
    }

    #[test]
    fn maps_payload_into_canonical_event() {
        let delivery = RawDelivery::new("ghl", b"{}".to_vec());
        let payload = json!({
            "id": "evt_42",
            "type": "ContactCreate",
            "locationId": "loc_1",
            "contact": { "id": "c_9", "email": "a@example.com", "name": "Ada" }
        });

        let event = ghl_mapping().normalize(&delivery, &payload).unwrap();
        assert_eq!(event.event_id.0, "evt_42");
        assert_eq!(event.event_type, "contact.created");
        assert_eq!(event.tenant_id.as_ref().unwrap().0, "loc_1");
        assert_eq!(event.customer_id.as_ref().unwrap().0, "c_9");
        assert_eq!(event.data["email"], json!("a@example.com"));
        assert!(event.processed_at.is_none());
    }

    #[test]
    fn unmappable_nested_shape_is_an_error() {
        let delivery = RawDelivery::new("ghl", b"{}".to_vec());
        // `contact` is a string, so `contact.email` cannot be resolved.
        let payload = json!({ "id": "evt_1", "type": "ContactCreate", "contact": "oops" });
        let err = ghl_mapping().normalize(&delivery, &payload).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField(_)));
    }

    #[test]
    fn event_type_fallback_normalization() {
        assert_eq!(normalize_event_type("ContactCreate"), "contact.create");
        assert_eq!(normalize_event_type("INVOICE_PAID"), "invoice.paid");
        assert_eq!(normalize_event_type("order-shipped"), "order.shipped");
        assert_eq!(normalize_event_type("contact.created"), "contact.created");
    }

    #[test]
    fn generated_id_when_source_supplies_none() {
        let mapping = SourceMapping::new("type");
        let a = mapping.extract_event_id(&json!({"type": "x"})).unwrap();
        let b = mapping.extract_event_id(&json!({"type": "x"})).unwrap();
        assert_ne!(a, b);
    }
}
