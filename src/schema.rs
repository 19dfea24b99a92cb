use serde_json::Value;

use crate::error::SchemaViolation;

/// Expected shape of one payload field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    String,
    /// String containing an `@` with a dot somewhere after it.
    Email,
    /// RFC 3339 string or unix-epoch number.
    Timestamp,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// String drawn from a fixed set.
    Enumeration(Vec<String>),
}

/// One field requirement in a source schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Dotted path from the payload root, e.g. `contact.email`.
    pub path: String,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn required(path: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            path: path.into(),
            required: true,
            kind,
        }
    }

    pub fn optional(path: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            path: path.into(),
            required: false,
            kind,
        }
    }
}

/// Structural schema registered for one source.
///
/// Validation collects every violation rather than stopping at the
/// first; a schema failure is always permanent (retrying an unchanging
/// malformed payload cannot succeed).
#[derive(Debug, Clone, Default)]
pub struct SchemaDef {
    pub fields: Vec<FieldSpec>,
}

impl SchemaDef {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn validate(&self, payload: &Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();

        if !payload.is_object() {
            violations.push(SchemaViolation::new("$", "payload is not a JSON object"));
            return violations;
        }

        for spec in &self.fields {
            match lookup_path(payload, &spec.path) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations
                            .push(SchemaViolation::new(&spec.path, "required field is missing"));
                    }
                }
                Some(value) => {
                    if let Some(message) = check_kind(value, &spec.kind) {
                        violations.push(SchemaViolation::new(&spec.path, message));
                    }
                }
            }
        }

        violations
    }
}

fn check_kind(value: &Value, kind: &FieldKind) -> Option<String> {
    match kind {
        FieldKind::String => {
            if value.is_string() {
                None
            } else {
                Some("expected a string".to_string())
            }
        }
        FieldKind::Email => match value.as_str() {
            Some(s) if is_email_like(s) => None,
            Some(_) => Some("expected an email address".to_string()),
            None => Some("expected an email string".to_string()),
        },
        FieldKind::Timestamp => match value {
            Value::Number(_) => None,
            Value::String(s) => {
                if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
                    None
                } else {
                    Some("expected an RFC 3339 timestamp".to_string())
                }
            }
            _ => Some("expected a timestamp".to_string()),
        },
        FieldKind::Number => {
            if value.is_number() {
                None
            } else {
                Some("expected a number".to_string())
            }
        }
        FieldKind::Integer => {
            if value.is_i64() || value.is_u64() {
                None
            } else {
                Some("expected an integer".to_string())
            }
        }
        FieldKind::Boolean => {
            if value.is_boolean() {
                None
            } else {
                Some("expected a boolean".to_string())
            }
        }
        FieldKind::Object => {
            if value.is_object() {
                None
            } else {
                Some("expected an object".to_string())
            }
        }
        FieldKind::Array => {
            if value.is_array() {
                None
            } else {
                Some("expected an array".to_string())
            }
        }
        FieldKind::Enumeration(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => None,
            Some(s) => Some(format!("`{s}` is not one of {allowed:?}")),
            None => Some("expected an enumeration string".to_string()),
        },
    }
}

fn is_email_like(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

/// Resolve a dotted path (`a.b.c`) against a JSON value.
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact_schema() -> SchemaDef {
        SchemaDef::new(vec![
            FieldSpec::required("id", FieldKind::String),
            FieldSpec::required("type", FieldKind::Enumeration(vec!["ContactCreate".into()])),
            FieldSpec::required("contact.email", FieldKind::Email),
            FieldSpec::optional("contact.age", FieldKind::Integer),
        ])
    }

    #[test]
    fn valid_payload_has_no_violations() {
        let payload = json!({
            "id": "evt_1",
            "type": "ContactCreate",
            "contact": { "email": "a@example.com", "age": 30 }
        });
        assert!(contact_schema().validate(&payload).is_empty());
    }

    #[test]
    fn all_violations_are_collected() {
        let payload = json!({
            "type": "SomethingElse",
            "contact": { "email": "not-an-email", "age": "thirty" }
        });
        let violations = contact_schema().validate(&payload);
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(violations.len(), 4);
        assert!(fields.contains(&"id"));
        assert!(fields.contains(&"type"));
        assert!(fields.contains(&"contact.email"));
        assert!(fields.contains(&"contact.age"));
    }

    #[test]
    fn non_object_payload_is_rejected_outright() {
        let violations = contact_schema().validate(&json!([1, 2, 3]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "$");
    }
}
