//! Gift events from the live stream and their mapping lookup.

use avaconf::GiftMapping;
use serde::{Deserialize, Serialize};

/// A gift as delivered by the stream platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftEvent {
    #[serde(default)]
    pub gift_id: Option<u64>,
    #[serde(default)]
    pub gift_name: Option<String>,
    #[serde(default, alias = "username", alias = "uniqueId")]
    pub user: Option<String>,
}

impl GiftEvent {
    pub fn new(gift_id: u64, gift_name: impl Into<String>) -> Self {
        Self {
            gift_id: Some(gift_id),
            gift_name: Some(gift_name.into()),
            user: None,
        }
    }

    pub fn label(&self) -> String {
        match (&self.gift_name, self.gift_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => format!("#{}", id),
            (None, None) => "unknown gift".to_string(),
        }
    }
}

/// Find the mapping for a gift.
///
/// Precedence is strict: a mapping naming both the id and the name wins, then
/// one keyed by id alone, then one keyed by name alone. Names compare
/// case-insensitively. Within a tier the first configured mapping wins.
pub fn find_mapping<'a>(mappings: &'a [GiftMapping], event: &GiftEvent) -> Option<&'a GiftMapping> {
    let name_eq = |m: &GiftMapping| match (&m.gift_name, &event.gift_name) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    };
    let id_eq = |m: &GiftMapping| m.gift_id.is_some() && m.gift_id == event.gift_id;

    mappings
        .iter()
        .find(|m| id_eq(m) && name_eq(m))
        .or_else(|| mappings.iter().find(|m| m.gift_name.is_none() && id_eq(m)))
        .or_else(|| mappings.iter().find(|m| m.gift_id.is_none() && name_eq(m)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaconf::{ActionParams, GiftAction};

    fn mapping(id: Option<u64>, name: Option<&str>, action: GiftAction) -> GiftMapping {
        GiftMapping {
            gift_id: id,
            gift_name: name.map(str::to_string),
            action,
            params: ActionParams::default(),
        }
    }

    #[test]
    fn exact_match_beats_id_and_name() {
        let mappings = vec![
            mapping(None, Some("Rose"), GiftAction::Wave),
            mapping(Some(5655), None, GiftAction::Dance),
            mapping(Some(5655), Some("Rose"), GiftAction::Hearts),
        ];
        let found = find_mapping(&mappings, &GiftEvent::new(5655, "Rose")).unwrap();
        assert_eq!(found.action, GiftAction::Hearts);
    }

    #[test]
    fn id_beats_name() {
        let mappings = vec![
            mapping(None, Some("rose"), GiftAction::Wave),
            mapping(Some(5655), None, GiftAction::Dance),
        ];
        let found = find_mapping(&mappings, &GiftEvent::new(5655, "Rose")).unwrap();
        assert_eq!(found.action, GiftAction::Dance);
    }

    #[test]
    fn name_alone_is_case_insensitive() {
        let mappings = vec![mapping(None, Some("rose"), GiftAction::Wave)];
        let found = find_mapping(&mappings, &GiftEvent::new(1, "ROSE")).unwrap();
        assert_eq!(found.action, GiftAction::Wave);
    }

    #[test]
    fn mismatched_pair_is_not_an_id_match() {
        // A mapping pinned to a different name must not match on id alone.
        let mappings = vec![mapping(Some(5655), Some("Lily"), GiftAction::Confetti)];
        assert!(find_mapping(&mappings, &GiftEvent::new(5655, "Rose")).is_none());
        assert!(find_mapping(&[], &GiftEvent::new(5655, "Rose")).is_none());
    }

    #[test]
    fn platform_payload_deserializes() {
        // Streak fields such as repeatCount are ignored; each event is one gift.
        let json = r#"{"giftId":5655,"giftName":"Rose","uniqueId":"viewer1","repeatCount":3}"#;
        let event: GiftEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.user.as_deref(), Some("viewer1"));
        assert_eq!(event, GiftEvent {
            user: Some("viewer1".into()),
            ..GiftEvent::new(5655, "Rose")
        });

        let bare: GiftEvent = serde_json::from_str(r#"{"giftName":"Rose"}"#).unwrap();
        assert_eq!(bare.label(), "Rose");
    }
}
