use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use time::OffsetDateTime;

/// QoS levels granted by a rule when none are specified.
pub const ALL_QOS_LEVELS: [u8; 3] = [0, 1, 2];

/// MQTT operation a permission rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttAction {
    Publish,
    Subscribe,
    /// Covers both publish and subscribe.
    Any,
}

impl MqttAction {
    /// Parses the action names the broker sends (`publish` / `subscribe`).
    /// `any` is a rule-side value and is never accepted from a request.
    pub fn from_request(action: &str) -> Option<Self> {
        match action.trim().to_ascii_lowercase().as_str() {
            "publish" => Some(MqttAction::Publish),
            "subscribe" => Some(MqttAction::Subscribe),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MqttAction::Publish => "publish",
            MqttAction::Subscribe => "subscribe",
            MqttAction::Any => "any",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "publish" => Some(MqttAction::Publish),
            "subscribe" => Some(MqttAction::Subscribe),
            "any" => Some(MqttAction::Any),
            _ => None,
        }
    }

    /// Whether a rule carrying `self` covers the requested action.
    pub fn covers(&self, requested: MqttAction) -> bool {
        *self == MqttAction::Any || *self == requested
    }
}

impl fmt::Display for MqttAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Effect::Allow),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

/// Non-empty subset of {0, 1, 2}.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QosSet(Vec<u8>);

impl QosSet {
    pub fn all() -> Self {
        Self(ALL_QOS_LEVELS.to_vec())
    }

    /// Builds a set from raw levels. Returns `None` for an empty set or any level above 2.
    pub fn new(levels: &[u8]) -> Option<Self> {
        if levels.is_empty() || levels.iter().any(|qos| *qos > 2) {
            return None;
        }
        let mut levels = levels.to_vec();
        levels.sort_unstable();
        levels.dedup();
        Some(Self(levels))
    }

    pub fn contains(&self, qos: u8) -> bool {
        self.0.contains(&qos)
    }

    pub fn levels(&self) -> &[u8] {
        &self.0
    }

    /// Storage form, e.g. `"0,1,2"`.
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(|qos| qos.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_csv(value: &str) -> Option<Self> {
        let levels = value
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.trim().parse::<u8>().ok())
            .collect::<Option<Vec<_>>>()?;
        Self::new(&levels)
    }
}

impl Default for QosSet {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionRule {
    pub topic_pattern: String,
    pub action: MqttAction,
    pub effect: Effect,
    pub allowed_qos: QosSet,
    /// Higher values are evaluated first.
    pub priority: i32,
}

impl PermissionRule {
    /// Allow rule over every QoS level with the default priority.
    pub fn allow(topic_pattern: impl Into<String>, action: MqttAction) -> Self {
        Self {
            topic_pattern: topic_pattern.into(),
            action,
            effect: Effect::Allow,
            allowed_qos: QosSet::all(),
            priority: 0,
        }
    }

    pub fn deny(topic_pattern: impl Into<String>, action: MqttAction) -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow(topic_pattern, action)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_qos(mut self, allowed_qos: QosSet) -> Self {
        self.allowed_qos = allowed_qos;
        self
    }
}

/// MQTT account of a provisioned device (or the admin account).
#[derive(Clone, PartialEq)]
pub struct Identity {
    pub id: i64,
    pub mqtt_id: String,
    pub secret_hash: String,
    pub client_id: String,
    pub device_name: Option<String>,
    pub permissions: Vec<PermissionRule>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("mqtt_id", &self.mqtt_id)
            .field("secret_hash", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("device_name", &self.device_name)
            .field("permissions", &self.permissions)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub mqtt_id: String,
    pub secret_hash: String,
    pub client_id: String,
    pub device_name: Option<String>,
    pub permissions: Vec<PermissionRule>,
}

/// Key of a threshold rule: owning client id plus sensor key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThresholdKey {
    pub owner: String,
    pub sensor_key: String,
}

impl ThresholdKey {
    pub fn new(owner: impl Into<String>, sensor_key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            sensor_key: sensor_key.into(),
        }
    }
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.sensor_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRule {
    pub id: i64,
    pub owner: String,
    pub sensor_key: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub warning_message: Option<String>,
}

impl ThresholdRule {
    pub fn key(&self) -> ThresholdKey {
        ThresholdKey::new(self.owner.clone(), self.sensor_key.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewThresholdRule {
    pub owner: String,
    pub sensor_key: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub warning_message: Option<String>,
}

impl NewThresholdRule {
    /// Unbounded rule created the first time a sensor key is seen.
    pub fn unbounded(key: &ThresholdKey, warning_message: &str) -> Self {
        Self {
            owner: key.owner.clone(),
            sensor_key: key.sensor_key.clone(),
            min_value: None,
            max_value: None,
            warning_message: Some(warning_message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdUpdate {
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub warning_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub identity_id: i64,
    pub recorded_at: OffsetDateTime,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Reading {
    pub id: i64,
    pub identity_id: i64,
    pub recorded_at: OffsetDateTime,
    pub received_at: OffsetDateTime,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub sensor_key: String,
    pub value: f64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_set_rejects_empty_and_out_of_range() {
        assert!(QosSet::new(&[]).is_none());
        assert!(QosSet::new(&[0, 3]).is_none());
        assert_eq!(QosSet::new(&[2, 0, 2]).unwrap().levels(), &[0, 2]);
    }

    #[test]
    fn qos_set_csv_round_trip() {
        let set = QosSet::from_csv("1, 2").unwrap();
        assert!(set.contains(1) && set.contains(2) && !set.contains(0));
        assert_eq!(set.to_csv(), "1,2");
        assert!(QosSet::from_csv("").is_none());
        assert!(QosSet::from_csv("x").is_none());
    }

    #[test]
    fn any_action_covers_both() {
        assert!(MqttAction::Any.covers(MqttAction::Publish));
        assert!(MqttAction::Any.covers(MqttAction::Subscribe));
        assert!(!MqttAction::Publish.covers(MqttAction::Subscribe));
        assert_eq!(MqttAction::from_request("PUBLISH"), Some(MqttAction::Publish));
        assert_eq!(MqttAction::from_request("any"), None);
    }

    #[test]
    fn identity_debug_redacts_secret() {
        let identity = Identity {
            id: 1,
            mqtt_id: "dev".into(),
            secret_hash: "abc$def".into(),
            client_id: "C1".into(),
            device_name: None,
            permissions: vec![],
        };
        assert!(!format!("{identity:?}").contains("abc$def"));
    }
}
