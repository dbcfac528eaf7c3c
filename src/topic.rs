//! MQTT topic pattern matching.
//!
//! `+` matches exactly one `/`-delimited level, `#` matches zero or more
//! trailing levels and is only meaningful as the last level. Wildcards never
//! match part of a level; `temp+` is plain text.

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Returns true when `topic` is covered by `pattern`.
///
/// ```
/// use sensor_guard::topic::matches;
///
/// assert!(matches("sensor/+/telemetry", "sensor/ABC123/telemetry"));
/// assert!(!matches("sensor/+/telemetry", "sensor/a/b/telemetry"));
/// assert!(matches("sensor/#", "sensor/x/y/z"));
/// ```
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let pattern_levels: Vec<&str> = pattern.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let mut t_idx = 0;

    for (p_idx, level) in pattern_levels.iter().enumerate() {
        match *level {
            MULTI_LEVEL => return p_idx == pattern_levels.len() - 1,
            SINGLE_LEVEL => {
                if t_idx >= topic_levels.len() {
                    return false;
                }
                t_idx += 1;
            }
            literal => {
                if t_idx >= topic_levels.len() || topic_levels[t_idx] != literal {
                    return false;
                }
                t_idx += 1;
            }
        }
    }

    t_idx == topic_levels.len()
}

/// Checks that a rule pattern is well formed: no empty levels, `+` and `#`
/// occupy whole levels, `#` only last.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| {
        !level.is_empty()
            && (!level.contains('#') || (*level == MULTI_LEVEL && i == levels.len() - 1))
            && (!level.contains('+') || *level == SINGLE_LEVEL)
    })
}

/// Final level of a topic, which selects the message handler.
pub fn topic_type(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|level| !level.is_empty())
}

/// Client id of a device topic shaped `sensor/{clientId}/{type}`.
pub fn client_id_from_topic(topic: &str) -> Option<&str> {
    let levels: Vec<&str> = topic.split('/').collect();
    if levels.len() < 2 {
        return None;
    }
    Some(levels[levels.len() - 2]).filter(|id| !id.is_empty())
}

/// Topics provisioned for a device.
pub fn telemetry_topic(client_id: &str) -> String {
    format!("sensor/{client_id}/telemetry")
}

pub fn status_topic(client_id: &str) -> String {
    format!("sensor/{client_id}/status")
}

pub fn command_topic(client_id: &str) -> String {
    format!("sensor/{client_id}/command")
}
