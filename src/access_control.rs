//! Authentication and topic authorization for broker hooks.
//!
//! Both operations fail closed: unknown identities, mismatched client ids and
//! store failures all yield `false`.
use crate::models::{Effect, Identity, MqttAction, PermissionRule};
use crate::secret::verify_secret;
use crate::store::Store;
use crate::topic;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct AccessControl {
    store: Arc<dyn Store>,
}

/// Outcome of evaluating an identity's rules against one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    Allowed { priority: i32 },
    Denied { priority: i32 },
    NoMatch,
}

impl RuleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RuleDecision::Allowed { .. })
    }
}

/// A rule applies when its pattern covers the topic, its action covers the
/// request and its QoS set contains the requested level.
fn applies(rule: &PermissionRule, topic: &str, action: MqttAction, qos: u8) -> bool {
    rule.action.covers(action) && rule.allowed_qos.contains(qos) && topic::matches(&rule.topic_pattern, topic)
}

/// Evaluates rules by descending priority. The highest tier holding an
/// applicable rule decides, and a deny in that tier beats any allow.
pub fn evaluate_rules(
    rules: &[PermissionRule],
    topic: &str,
    action: MqttAction,
    qos: u8,
) -> RuleDecision {
    let Some(top) = rules
        .iter()
        .filter(|rule| applies(rule, topic, action, qos))
        .map(|rule| rule.priority)
        .max()
    else {
        return RuleDecision::NoMatch;
    };

    let denied = rules.iter().any(|rule| {
        rule.priority == top && rule.effect == Effect::Deny && applies(rule, topic, action, qos)
    });
    if denied {
        RuleDecision::Denied { priority: top }
    } else {
        RuleDecision::Allowed { priority: top }
    }
}

fn client_id_mismatch(identity: &Identity, client_id: Option<&str>) -> bool {
    match client_id.map(str::trim) {
        Some(client_id) if !client_id.is_empty() => client_id != identity.client_id,
        _ => false,
    }
}

impl AccessControl {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validates an identity/secret pair, and the client id when one is supplied.
    pub async fn authenticate(&self, identity: &str, secret: &str, client_id: Option<&str>) -> bool {
        if identity.trim().is_empty() || secret.trim().is_empty() {
            warn!("Authentication failed: blank identity or secret");
            return false;
        }

        let account = match self.store.find_identity_by_external_id(identity).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!(identity, "Authentication failed: unknown identity");
                return false;
            }
            Err(e) => {
                error!(identity, error = %e, "Authentication failed: store error");
                return false;
            }
        };

        let candidate = secret.to_string();
        let stored = account.secret_hash.clone();
        let verification = tokio::task::spawn_blocking(move || verify_secret(&candidate, &stored));
        let verified = match verification.await {
            Ok(verified) => verified,
            Err(e) => {
                error!(identity, error = %e, "Authentication failed: verification task aborted");
                return false;
            }
        };
        if !verified {
            warn!(identity, "Authentication failed: secret mismatch");
            return false;
        }

        if client_id_mismatch(&account, client_id) {
            warn!(identity, client_id = ?client_id, "Authentication failed: client id mismatch");
            return false;
        }

        info!(identity, "Authentication successful");
        true
    }

    /// Decides whether `identity` may perform `action` on `topic` at `qos`.
    pub async fn authorize(
        &self,
        identity: &str,
        client_id: Option<&str>,
        topic: &str,
        action: MqttAction,
        qos: u8,
    ) -> bool {
        if identity.trim().is_empty() || topic.trim().is_empty() {
            warn!("Authorization failed: blank identity or topic");
            return false;
        }
        if qos > 2 {
            warn!(identity, qos, "Authorization failed: invalid QoS");
            return false;
        }

        let account = match self.store.find_identity_by_external_id(identity).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!(identity, "Authorization failed: unknown identity");
                return false;
            }
            Err(e) => {
                error!(identity, error = %e, "Authorization failed: store error");
                return false;
            }
        };

        if client_id_mismatch(&account, client_id) {
            warn!(identity, client_id = ?client_id, "Authorization failed: client id mismatch");
            return false;
        }

        let decision = evaluate_rules(&account.permissions, topic, action, qos);
        debug!(identity, topic, %action, qos, ?decision, "ACL rules evaluated");
        if decision.is_allowed() {
            info!(identity, topic, %action, "Authorization granted");
        } else {
            warn!(identity, topic, %action, "Authorization denied");
        }
        decision.is_allowed()
    }
}
