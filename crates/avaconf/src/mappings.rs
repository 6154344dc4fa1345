//! Gift → action mappings and the avatar catalog.

use serde::{Deserialize, Serialize};

/// Predefined actions a gift (or an admin call) can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GiftAction {
    Wave,
    Celebrate,
    Dance,
    Hearts,
    Confetti,
    Emote,
    #[serde(alias = "avatarSwitch", alias = "avatar_switch")]
    AvatarSwitch,
    #[serde(alias = "customParameter", alias = "custom_parameter")]
    CustomParameter,
}

impl GiftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftAction::Wave => "wave",
            GiftAction::Celebrate => "celebrate",
            GiftAction::Dance => "dance",
            GiftAction::Hearts => "hearts",
            GiftAction::Confetti => "confetti",
            GiftAction::Emote => "emote",
            GiftAction::AvatarSwitch => "avatar-switch",
            GiftAction::CustomParameter => "custom-parameter",
        }
    }

    /// Avatar parameter name pulsed by the simple actions, if any.
    pub fn pulse_parameter(&self) -> Option<&'static str> {
        match self {
            GiftAction::Wave => Some("Wave"),
            GiftAction::Celebrate => Some("Celebrate"),
            GiftAction::Dance => Some("Dance"),
            GiftAction::Hearts => Some("Hearts"),
            GiftAction::Confetti => Some("Confetti"),
            _ => None,
        }
    }

    /// Parse the host-facing action name (accepts kebab, camel and snake case).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "wave" => Some(GiftAction::Wave),
            "celebrate" => Some(GiftAction::Celebrate),
            "dance" => Some(GiftAction::Dance),
            "hearts" => Some(GiftAction::Hearts),
            "confetti" => Some(GiftAction::Confetti),
            "emote" => Some(GiftAction::Emote),
            "avatar-switch" | "avatarswitch" => Some(GiftAction::AvatarSwitch),
            "custom-parameter" | "customparameter" => Some(GiftAction::CustomParameter),
            _ => None,
        }
    }
}

impl std::fmt::Display for GiftAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A literal parameter value in configuration.
///
/// Untagged so `1` stays an integer and `1.5` a float in both TOML and JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Parameters attached to a mapped action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionParams {
    /// How long the action holds before releasing, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Emote slot for `emote`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<i32>,
    /// Target for `avatar-switch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_name: Option<String>,
    /// Parameter name or full address for `custom-parameter`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ConfigValue>,
    /// Value written after `duration` elapses for `custom-parameter`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_value: Option<ConfigValue>,
}

/// One gift → action rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_name: Option<String>,
    pub action: GiftAction,
    #[serde(default)]
    pub params: ActionParams,
}

/// A switchable avatar known to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarEntry {
    pub id: String,
    pub name: String,
    /// Extra names accepted by the `!avatar` chat command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl AvatarEntry {
    /// Case-insensitive match against the name or any alias.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        self.name.eq_ignore_ascii_case(query)
            || self.id == query
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_every_spelling() {
        assert_eq!(GiftAction::parse("avatarSwitch"), Some(GiftAction::AvatarSwitch));
        assert_eq!(GiftAction::parse("avatar_switch"), Some(GiftAction::AvatarSwitch));
        assert_eq!(GiftAction::parse("custom-parameter"), Some(GiftAction::CustomParameter));
        assert_eq!(GiftAction::parse("HEARTS"), Some(GiftAction::Hearts));
        assert_eq!(GiftAction::parse("moonwalk"), None);
    }

    #[test]
    fn config_value_keeps_int_and_float_apart() {
        let v: ConfigValue = serde_json::from_str("1").unwrap();
        assert_eq!(v, ConfigValue::Int(1));
        let v: ConfigValue = serde_json::from_str("0.5").unwrap();
        assert_eq!(v, ConfigValue::Float(0.5));
        let v: ConfigValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, ConfigValue::Bool(true));
    }

    #[test]
    fn mapping_from_host_json() {
        let json = r#"{"giftId":5655,"giftName":"Rose","action":"hearts","params":{"duration":2000}}"#;
        let mapping: GiftMapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.gift_id, Some(5655));
        assert_eq!(mapping.action, GiftAction::Hearts);
        assert_eq!(mapping.params.duration, Some(2000));
    }

    #[test]
    fn avatar_matches_alias() {
        let avatar = AvatarEntry {
            id: "avtr_123".into(),
            name: "Fox".into(),
            aliases: vec!["kitsune".into()],
        };
        assert!(avatar.matches("fox"));
        assert!(avatar.matches("Kitsune"));
        assert!(avatar.matches("avtr_123"));
        assert!(!avatar.matches("wolf"));
    }
}
