use serde_json::json;

use webhook_ingress::{
    CanonicalEvent, DestinationSpec, EventId, PredicateOp, RawDelivery, RouteDecision,
    RoutingRule, RuleEngine, TenantId,
};

fn destination() -> DestinationSpec {
    DestinationSpec::ServiceCall {
        service: "crm".into(),
        method: "upsert".into(),
        params: serde_json::Map::new(),
    }
}

fn event(source: &str, event_type: &str, data: serde_json::Value) -> CanonicalEvent {
    let delivery = RawDelivery::new(source, b"{}".to_vec());
    let mut event = CanonicalEvent::skeletal(EventId::generate(), &delivery);
    event.event_type = event_type.to_string();
    event.data = data.as_object().cloned().unwrap_or_default();
    event
}

fn matched_id(decision: RouteDecision) -> Option<String> {
    match decision {
        RouteDecision::Matched(rule) => Some(rule.id.0.clone()),
        RouteDecision::NoMatch => None,
    }
}

#[tokio::test]
async fn lowest_priority_value_wins() {
    let engine = RuleEngine::new(vec![
        RoutingRule::new("catch-all", 100, destination()),
        RoutingRule::new("contacts", 10, destination())
            .with_event_types(vec!["contact.created"]),
    ]);

    let snapshot = engine.snapshot().await;
    let decision = snapshot.route(&event("ghl", "contact.created", json!({})));
    assert_eq!(matched_id(decision), Some("contacts".into()));

    let decision = snapshot.route(&event("ghl", "invoice.paid", json!({})));
    assert_eq!(matched_id(decision), Some("catch-all".into()));
}

#[tokio::test]
async fn priority_ties_keep_registration_order() {
    let engine = RuleEngine::new(vec![
        RoutingRule::new("first", 10, destination()),
        RoutingRule::new("second", 10, destination()),
    ]);

    let snapshot = engine.snapshot().await;
    let decision = snapshot.route(&event("ghl", "contact.created", json!({})));
    assert_eq!(matched_id(decision), Some("first".into()));
}

#[tokio::test]
async fn disabled_rules_are_skipped() {
    let engine = RuleEngine::new(vec![
        RoutingRule::new("primary", 10, destination()).disabled(),
        RoutingRule::new("fallback", 20, destination()),
    ]);

    let snapshot = engine.snapshot().await;
    let decision = snapshot.route(&event("ghl", "contact.created", json!({})));
    assert_eq!(matched_id(decision), Some("fallback".into()));
}

#[tokio::test]
async fn conditions_are_conjunctive() {
    let engine = RuleEngine::new(vec![RoutingRule::new("strict", 10, destination())
        .with_sources(vec!["ghl"])
        .with_event_types(vec!["contact.created"])
        .with_tenants(vec!["loc_1"])]);

    let snapshot = engine.snapshot().await;

    let mut matching = event("ghl", "contact.created", json!({}));
    matching.tenant_id = Some(TenantId("loc_1".into()));
    assert!(matched_id(snapshot.route(&matching)).is_some());

    // Same event from another tenant fails the tenant condition.
    let mut other_tenant = event("ghl", "contact.created", json!({}));
    other_tenant.tenant_id = Some(TenantId("loc_2".into()));
    assert!(matched_id(snapshot.route(&other_tenant)).is_none());

    // Missing tenant also fails a tenant-constrained rule.
    assert!(matched_id(snapshot.route(&event("ghl", "contact.created", json!({})))).is_none());

    assert!(matched_id(snapshot.route(&matching.clone())).is_some());
    let mut wrong_source = matching.clone();
    wrong_source.source = webhook_ingress::Source::new("stripe");
    assert!(matched_id(snapshot.route(&wrong_source)).is_none());
}

#[tokio::test]
async fn numeric_predicates_compare_numerically() {
    let engine = RuleEngine::new(vec![RoutingRule::new("big-invoices", 10, destination())
        .with_predicate("invoice.amount", PredicateOp::Gte, json!(100))]);

    let snapshot = engine.snapshot().await;
    let hit = event("ghl", "invoice.paid", json!({"invoice": {"amount": 250}}));
    let miss = event("ghl", "invoice.paid", json!({"invoice": {"amount": 99.5}}));
    let absent = event("ghl", "invoice.paid", json!({"invoice": {}}));

    assert!(matched_id(snapshot.route(&hit)).is_some());
    assert!(matched_id(snapshot.route(&miss)).is_none());
    assert!(matched_id(snapshot.route(&absent)).is_none());
}

#[tokio::test]
async fn deep_predicate_paths_walk_nested_objects() {
    let engine = RuleEngine::new(vec![RoutingRule::new("deep", 10, destination())
        .with_predicate("contact.plan.tier", PredicateOp::Eq, json!("pro"))]);

    let snapshot = engine.snapshot().await;
    let nested = event(
        "ghl",
        "contact.created",
        json!({"contact": {"plan": {"tier": "pro"}}}),
    );
    assert!(matched_id(snapshot.route(&nested)).is_some());

    // An intermediate segment that is not an object never matches.
    let flat = event("ghl", "contact.created", json!({"contact": "pro"}));
    assert!(matched_id(snapshot.route(&flat)).is_none());
}

#[tokio::test]
async fn type_mismatched_predicate_never_matches() {
    let engine = RuleEngine::new(vec![RoutingRule::new("plan-gate", 10, destination())
        .with_predicate("plan", PredicateOp::Eq, json!("pro"))]);

    let snapshot = engine.snapshot().await;
    assert!(matched_id(snapshot.route(&event("ghl", "x", json!({"plan": "pro"})))).is_some());
    assert!(matched_id(snapshot.route(&event("ghl", "x", json!({"plan": 3})))).is_none());
}

#[tokio::test]
async fn reload_swaps_the_snapshot_atomically() {
    let engine = RuleEngine::new(vec![RoutingRule::new("old", 10, destination())]);
    let before = engine.snapshot().await;
    assert_eq!(before.generation(), 0);

    engine
        .reload(vec![RoutingRule::new("new", 10, destination())])
        .await;

    // The earlier snapshot is untouched; new lookups see the new rules.
    assert_eq!(
        matched_id(before.route(&event("ghl", "x", json!({})))),
        Some("old".into())
    );
    let after = engine.snapshot().await;
    assert_eq!(after.generation(), 1);
    assert_eq!(
        matched_id(after.route(&event("ghl", "x", json!({})))),
        Some("new".into())
    );
}
