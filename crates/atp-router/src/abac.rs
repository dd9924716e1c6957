//! # ABAC Policy Engine
//!
//! Attribute-based access control over subject, resource, action, and
//! environment attributes. Policies hold prioritized rule lists; DENY takes
//! precedence and the default is DENY. Decisions are cached per context with
//! a TTL; any policy mutation clears the cache.
//!
//! A legacy escalation policy coexists for confidence/disagreement routing.

use atp_common::metrics::{Counter, Registry};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Decision cache lifetime.
pub const DECISION_CACHE_TTL: Duration = Duration::from_secs(300);

// ─── Effects & Operators ────────────────────────────────────────────────────

/// Policy decision effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Permit,
    Deny,
}

/// Attribute comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    Contains,
    /// Regex match anchored at the start of the attribute value.
    Matches,
    Exists,
    NotExists,
}

// ─── Conditions ─────────────────────────────────────────────────────────────

/// Single attribute condition in a policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeCondition {
    pub attribute: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl AttributeCondition {
    pub fn new(attribute: impl Into<String>, operator: Operator, value: Value) -> Self {
        AttributeCondition {
            attribute: attribute.into(),
            operator,
            value,
        }
    }

    /// Evaluate against the attribute bag. Type and parse errors evaluate
    /// to `false`.
    fn evaluate(&self, attributes: &BTreeMap<String, Value>, regexes: &RegexCache) -> bool {
        match self.operator {
            Operator::Exists => return attributes.contains_key(&self.attribute),
            Operator::NotExists => return !attributes.contains_key(&self.attribute),
            _ => {}
        }

        let Some(attr_value) = attributes.get(&self.attribute) else {
            return false;
        };

        match self.operator {
            Operator::Equals => attr_value == &self.value,
            Operator::NotEquals => attr_value != &self.value,
            Operator::In => match &self.value {
                Value::Array(list) => list.contains(attr_value),
                _ => false,
            },
            Operator::NotIn => match &self.value {
                Value::Array(list) => !list.contains(attr_value),
                _ => true,
            },
            Operator::GreaterThan => match (as_f64(attr_value), as_f64(&self.value)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Operator::LessThan => match (as_f64(attr_value), as_f64(&self.value)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            Operator::Contains => as_string(attr_value).contains(&as_string(&self.value)),
            Operator::Matches => regexes.matches(&as_string(&self.value), &as_string(attr_value)),
            Operator::Exists | Operator::NotExists => unreachable!("handled above"),
        }
    }
}

/// Numeric coercion: JSON numbers directly, strings via parse.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// String coercion: raw strings verbatim, everything else via JSON encoding.
fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compiled-regex cache, keyed by the raw pattern.
#[derive(Default)]
struct RegexCache {
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl RegexCache {
    /// Anchored-prefix match; invalid patterns evaluate to `false`.
    fn matches(&self, pattern: &str, value: &str) -> bool {
        let mut compiled = match self.compiled.lock() {
            Ok(compiled) => compiled,
            Err(_) => return false,
        };
        let entry = compiled
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(&format!("^(?:{pattern})")).ok());
        match entry {
            Some(regex) => regex.is_match(value),
            None => false,
        }
    }
}

// ─── Rules & Policies ───────────────────────────────────────────────────────

/// ABAC policy rule: all conditions must hold (AND) for the effect to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub rule_id: String,
    pub description: String,
    pub effect: Effect,
    pub conditions: Vec<AttributeCondition>,
    /// Wildcard resource patterns this rule applies to (`*` and `?`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
}

impl PolicyRule {
    fn matches_request(&self, resource: &str, action: &str, regexes: &RegexCache) -> bool {
        if let Some(patterns) = &self.resources {
            let hit = patterns.iter().any(|pattern| {
                let regex = pattern.replace('*', ".*").replace('?', ".");
                regexes.matches(&format!("{regex}$"), resource)
            });
            if !hit {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.iter().any(|a| a == action) {
                return false;
            }
        }
        true
    }

    fn evaluate(&self, attributes: &BTreeMap<String, Value>, regexes: &RegexCache) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.evaluate(attributes, regexes))
    }
}

/// Attribute-based access control policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbacPolicy {
    pub policy_id: String,
    pub name: String,
    pub description: String,
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl AbacPolicy {
    /// First rule matching resource+action whose conditions hold yields its
    /// effect; disabled policies yield nothing.
    fn evaluate(
        &self,
        resource: &str,
        action: &str,
        attributes: &BTreeMap<String, Value>,
        regexes: &RegexCache,
    ) -> Option<Effect> {
        if !self.enabled {
            return None;
        }
        self.rules
            .iter()
            .filter(|rule| rule.matches_request(resource, action, regexes))
            .find(|rule| rule.evaluate(attributes, regexes))
            .map(|rule| rule.effect)
    }
}

// ─── Context & Decision ─────────────────────────────────────────────────────

/// Evaluation context: subject, request, environment, and the legacy
/// escalation inputs.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub confidence: Option<f64>,
    pub disagreement: bool,

    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub roles: BTreeSet<String>,
    pub groups: BTreeSet<String>,
    pub attributes: BTreeMap<String, Value>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub environment: BTreeMap<String, Value>,
}

impl Context {
    /// Flatten into the attribute bag used by rule evaluation. `None`
    /// values are dropped.
    fn attribute_bag(&self) -> BTreeMap<String, Value> {
        let mut bag = BTreeMap::new();
        if let Some(user_id) = &self.user_id {
            bag.insert("user.id".to_string(), Value::from(user_id.clone()));
        }
        if let Some(tenant_id) = &self.tenant_id {
            bag.insert("user.tenant_id".to_string(), Value::from(tenant_id.clone()));
        }
        bag.insert(
            "user.roles".to_string(),
            Value::from(self.roles.iter().cloned().collect::<Vec<_>>()),
        );
        bag.insert(
            "user.groups".to_string(),
            Value::from(self.groups.iter().cloned().collect::<Vec<_>>()),
        );
        if let Some(resource) = &self.resource {
            bag.insert("request.resource".to_string(), Value::from(resource.clone()));
        }
        if let Some(action) = &self.action {
            bag.insert("request.action".to_string(), Value::from(action.clone()));
        }
        bag.insert(
            "request.timestamp".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        for (key, value) in &self.attributes {
            if !value.is_null() {
                bag.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.environment {
            if !value.is_null() {
                bag.insert(format!("env.{key}"), value.clone());
            }
        }
        bag
    }

    /// Stable cache key over the decision-relevant context fields.
    fn cache_key(&self) -> String {
        let key = serde_json::json!({
            "resource": self.resource,
            "action": self.action,
            "user_id": self.user_id,
            "tenant_id": self.tenant_id,
            "roles": self.roles,
            "groups": self.groups,
            "attributes": self.attributes,
        });
        key.to_string()
    }
}

/// Combined escalation + ABAC decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub escalate: bool,
    pub reason: Option<String>,

    pub effect: Option<Effect>,
    pub permitted: bool,
    pub applicable_policies: Vec<String>,
    pub evaluation_time_ms: f64,
}

impl Decision {
    fn deny(reason: &str) -> Self {
        Decision {
            effect: Some(Effect::Deny),
            permitted: false,
            reason: Some(reason.to_string()),
            ..Decision::default()
        }
    }
}

// ─── Escalation Policy ──────────────────────────────────────────────────────

/// Legacy escalation policy: low confidence or reviewer disagreement routes
/// the request to a human.
pub struct EscalationPolicy {
    pub low_conf_threshold: f64,
    pub escalate_on_disagreement: bool,
    low_conf_events: Arc<Counter>,
    disagreement_events: Arc<Counter>,
}

impl EscalationPolicy {
    pub fn new(registry: &Registry) -> Self {
        EscalationPolicy {
            low_conf_threshold: 0.6,
            escalate_on_disagreement: true,
            low_conf_events: registry.counter("escalations_total_low_conf"),
            disagreement_events: registry.counter("escalations_total_disagreement"),
        }
    }

    pub fn evaluate(&self, ctx: &Context) -> Decision {
        let mut escalate = false;
        let mut reason = None;

        if let Some(confidence) = ctx.confidence {
            if confidence < self.low_conf_threshold {
                escalate = true;
                reason = Some("low_conf".to_string());
                self.low_conf_events.inc(1);
            }
        }
        if !escalate && self.escalate_on_disagreement && ctx.disagreement {
            escalate = true;
            reason = Some("disagreement".to_string());
            self.disagreement_events.inc(1);
        }

        let span = tracing::info_span!(
            "policy.evaluate_escalation",
            policy.escalate = escalate,
            policy.reason = reason.as_deref().unwrap_or(""),
        );
        let _enter = span.enter();

        Decision {
            escalate,
            reason,
            ..Decision::default()
        }
    }
}

// ─── Policy Engine ──────────────────────────────────────────────────────────

struct CachedDecision {
    decision: Decision,
    cached_at: Instant,
}

/// Policy engine with prioritized ABAC policies, a TTL decision cache, and
/// the legacy escalation policy.
pub struct PolicyEngine {
    policies: Mutex<HashMap<String, AbacPolicy>>,
    cache: Mutex<HashMap<String, CachedDecision>>,
    cache_ttl: Duration,
    regexes: RegexCache,
    escalation: EscalationPolicy,

    evaluations: Arc<Counter>,
    permits: Arc<Counter>,
    denies: Arc<Counter>,
    cache_hits: Arc<Counter>,
    cache_misses: Arc<Counter>,
}

impl PolicyEngine {
    pub fn new(registry: &Registry) -> Self {
        PolicyEngine {
            policies: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DECISION_CACHE_TTL,
            regexes: RegexCache::default(),
            escalation: EscalationPolicy::new(registry),
            evaluations: registry.counter("abac_evaluations_total"),
            permits: registry.counter("abac_permits_total"),
            denies: registry.counter("abac_denies_total"),
            cache_hits: registry.counter("policy_cache_hits_total"),
            cache_misses: registry.counter("policy_cache_misses_total"),
        }
    }

    pub fn escalation(&self) -> &EscalationPolicy {
        &self.escalation
    }

    /// Add or replace a policy. Clears the decision cache.
    pub fn add_policy(&self, mut policy: AbacPolicy) {
        let now = Utc::now();
        policy.updated_at = Some(now);
        if policy.created_at.is_none() {
            policy.created_at = Some(now);
        }
        info!(policy_id = %policy.policy_id, "abac policy added");
        if let Ok(mut policies) = self.policies.lock() {
            policies.insert(policy.policy_id.clone(), policy);
        }
        self.clear_cache();
    }

    /// Remove a policy. Clears the decision cache when something was removed.
    pub fn remove_policy(&self, policy_id: &str) -> bool {
        let removed = self
            .policies
            .lock()
            .map(|mut policies| policies.remove(policy_id).is_some())
            .unwrap_or(false);
        if removed {
            info!(policy_id, "abac policy removed");
            self.clear_cache();
        }
        removed
    }

    /// Enable or disable a policy in place. Clears the decision cache.
    pub fn set_enabled(&self, policy_id: &str, enabled: bool) -> bool {
        let changed = self
            .policies
            .lock()
            .map(|mut policies| match policies.get_mut(policy_id) {
                Some(policy) => {
                    policy.enabled = enabled;
                    policy.updated_at = Some(Utc::now());
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        if changed {
            self.clear_cache();
        }
        changed
    }

    pub fn get_policy(&self, policy_id: &str) -> Option<AbacPolicy> {
        self.policies
            .lock()
            .ok()
            .and_then(|policies| policies.get(policy_id).cloned())
    }

    pub fn list_policies(&self) -> Vec<AbacPolicy> {
        self.policies
            .lock()
            .map(|policies| policies.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate ABAC policies for the context.
    pub fn evaluate_abac(&self, ctx: &Context) -> Decision {
        let start = Instant::now();
        self.evaluations.inc(1);

        let span = tracing::info_span!(
            "policy.evaluate_abac",
            abac.resource = ctx.resource.as_deref().unwrap_or(""),
            abac.action = ctx.action.as_deref().unwrap_or(""),
            abac.user_id = ctx.user_id.as_deref().unwrap_or(""),
            abac.tenant_id = ctx.tenant_id.as_deref().unwrap_or(""),
        );
        let _enter = span.enter();

        let (Some(resource), Some(action)) = (ctx.resource.as_deref(), ctx.action.as_deref())
        else {
            self.denies.inc(1);
            return Decision::deny("missing_resource_or_action");
        };

        let cache_key = ctx.cache_key();
        if let Some(cached) = self.cached_decision(&cache_key) {
            self.cache_hits.inc(1);
            return cached;
        }
        self.cache_misses.inc(1);

        let attributes = ctx.attribute_bag();
        let mut applicable_policies = Vec::new();
        let mut final_effect: Option<Effect> = None;

        let mut sorted: Vec<AbacPolicy> = self.list_policies();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        for policy in &sorted {
            let Some(effect) = policy.evaluate(resource, action, &attributes, &self.regexes)
            else {
                continue;
            };
            applicable_policies.push(policy.policy_id.clone());
            if final_effect.is_none() {
                final_effect = Some(effect);
            }
            // DENY takes precedence; stop at the first one.
            if effect == Effect::Deny {
                final_effect = Some(Effect::Deny);
                break;
            }
        }

        // Default deny when nothing matched.
        let effect = final_effect.unwrap_or(Effect::Deny);
        let permitted = effect == Effect::Permit;

        let decision = Decision {
            effect: Some(effect),
            permitted,
            applicable_policies,
            evaluation_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            ..Decision::default()
        };

        self.cache_decision(cache_key, decision.clone());
        if permitted {
            self.permits.inc(1);
        } else {
            self.denies.inc(1);
        }
        debug!(?effect, "abac evaluation complete");
        decision
    }

    /// Evaluate the escalation policy, plus ABAC when the context carries a
    /// resource and action.
    pub fn evaluate(&self, ctx: &Context) -> Decision {
        let escalation = self.escalation.evaluate(ctx);
        if ctx.resource.is_none() || ctx.action.is_none() {
            return escalation;
        }
        let abac = self.evaluate_abac(ctx);
        Decision {
            escalate: escalation.escalate,
            reason: escalation.reason,
            effect: abac.effect,
            permitted: abac.permitted,
            applicable_policies: abac.applicable_policies,
            evaluation_time_ms: abac.evaluation_time_ms,
        }
    }

    fn cached_decision(&self, cache_key: &str) -> Option<Decision> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(cache_key) {
            Some(cached) if cached.cached_at.elapsed() < self.cache_ttl => {
                Some(cached.decision.clone())
            }
            Some(_) => {
                cache.remove(cache_key);
                None
            }
            None => None,
        }
    }

    fn cache_decision(&self, cache_key: String, decision: Decision) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                cache_key,
                CachedDecision {
                    decision,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}
