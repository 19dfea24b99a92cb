use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::types::{CanonicalEvent, FieldPredicate, PredicateOp, RoutingRule, RuleConditions};

/// Result of matching one event against a rule snapshot.
///
/// `NoMatch` is not an error: the event is logged and dropped by
/// design (explicit default-deny routing).
#[derive(Debug, Clone)]
pub enum RouteDecision {
    Matched(Arc<RoutingRule>),
    NoMatch,
}

/// An immutable, priority-ordered rule set.
///
/// Rules are stable-sorted by ascending `priority` at construction, so
/// ties keep registration order and evaluation is deterministic.
#[derive(Debug)]
pub struct RuleSnapshot {
    rules: Vec<Arc<RoutingRule>>,
    generation: u64,
}

impl RuleSnapshot {
    fn new(mut rules: Vec<RoutingRule>, generation: u64) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[Arc<RoutingRule>] {
        &self.rules
    }

    /// First enabled rule (by ascending priority) whose conditions all
    /// match, or `NoMatch`.
    pub fn route(&self, event: &CanonicalEvent) -> RouteDecision {
        for rule in &self.rules {
            if rule.enabled && conditions_match(&rule.conditions, event) {
                return RouteDecision::Matched(rule.clone());
            }
        }
        RouteDecision::NoMatch
    }
}

/// Holder of the current rule snapshot.
///
/// Reload is copy-on-write: a new immutable snapshot is built and the
/// shared reference swapped, so no worker ever observes a half-updated
/// rule set. In-flight routing keeps the snapshot it already cloned.
pub struct RuleEngine {
    snapshot: RwLock<Arc<RuleSnapshot>>,
    generation: AtomicU64,
}

impl RuleEngine {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RuleSnapshot::new(rules, 0))),
            generation: AtomicU64::new(0),
        }
    }

    /// Publish a new snapshot. Takes effect on the next routing cycle,
    /// never mid-flight.
    pub async fn reload(&self, rules: Vec<RoutingRule>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new(RuleSnapshot::new(rules, generation));
        let mut guard = self.snapshot.write().await;
        *guard = next;
    }

    pub async fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().await.clone()
    }
}

fn conditions_match(conditions: &RuleConditions, event: &CanonicalEvent) -> bool {
    if !conditions.sources.is_empty() && !conditions.sources.contains(&event.source) {
        return false;
    }
    if !conditions.event_types.is_empty()
        && !conditions.event_types.iter().any(|t| t == &event.event_type)
    {
        return false;
    }
    if !conditions.tenants.is_empty() {
        match &event.tenant_id {
            Some(tenant) if conditions.tenants.contains(tenant) => {}
            _ => return false,
        }
    }
    if let Some(predicate) = &conditions.predicate {
        if !predicate_matches(predicate, &event.data) {
            return false;
        }
    }
    true
}

/// Evaluate a restricted field predicate against `data`.
///
/// Numbers compare numerically, strings lexicographically, booleans by
/// equality only. A missing field or a type mismatch never matches.
fn predicate_matches(
    predicate: &FieldPredicate,
    data: &serde_json::Map<String, Value>,
) -> bool {
    let mut segments = predicate.field.split('.');
    let Some(mut actual) = segments.next().and_then(|first| data.get(first)) else {
        return false;
    };
    for segment in segments {
        match actual.as_object().and_then(|o| o.get(segment)) {
            Some(value) => actual = value,
            None => return false,
        }
    }

    match (actual, &predicate.value) {
        (Value::Number(a), Value::Number(b)) => {
            let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                return false;
            };
            compare_ordered(predicate.op, a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => compare_ordered(predicate.op, Some(a.cmp(b))),
        (Value::Bool(a), Value::Bool(b)) => match predicate.op {
            PredicateOp::Eq => a == b,
            PredicateOp::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}

fn compare_ordered<O: Into<Option<std::cmp::Ordering>>>(op: PredicateOp, ordering: O) -> bool {
    use std::cmp::Ordering::*;
    let Some(ordering) = ordering.into() else {
        return false;
    };
    match op {
        PredicateOp::Eq => ordering == Equal,
        PredicateOp::Ne => ordering != Equal,
        PredicateOp::Lt => ordering == Less,
        PredicateOp::Lte => ordering != Greater,
        PredicateOp::Gt => ordering == Greater,
        PredicateOp::Gte => ordering != Less,
    }
}
