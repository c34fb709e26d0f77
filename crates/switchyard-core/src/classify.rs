//! Capability classification
//!
//! Turns a raw message into the capability tags the turn requires. The router
//! only depends on the trait; the shipped implementation is a keyword table.
//! A message matching several groups needs one agent covering all of them.

use std::collections::BTreeSet;

use tracing::debug;

/// Tag assumed when a message matches no keyword group
pub const DEFAULT_CAPABILITY: &str = "calendar-read";

/// Derives the capability tags one message requires
pub trait CapabilityClassifier: Send + Sync + 'static {
    fn classify(&self, message: &str) -> BTreeSet<String>;
}

/// Keyword groups and the tag each one demands. Matching is whole-word and
/// case-insensitive.
const KEYWORD_GROUPS: &[(&str, &[&str])] = &[
    (
        "calendar-read",
        &["check", "available", "availability", "free"],
    ),
    ("event-create", &["schedule", "add", "create", "book"]),
    ("event-update", &["modify", "edit", "change", "update"]),
    ("event-delete", &["delete", "remove", "cancel"]),
];

/// Table-driven classifier over `KEYWORD_GROUPS`
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl CapabilityClassifier for KeywordClassifier {
    fn classify(&self, message: &str) -> BTreeSet<String> {
        let lower = message.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut tags: BTreeSet<String> = KEYWORD_GROUPS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
            .map(|(tag, _)| tag.to_string())
            .collect();

        if tags.is_empty() {
            tags.insert(DEFAULT_CAPABILITY.to_string());
        }
        debug!("classified message into tags {:?}", tags);
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(message: &str) -> BTreeSet<String> {
        KeywordClassifier::new().classify(message)
    }

    fn tags(expected: &[&str]) -> BTreeSet<String> {
        expected.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_check_maps_to_calendar_read() {
        assert_eq!(
            classify("Check my availability for next Friday"),
            tags(&["calendar-read"])
        );
    }

    #[test]
    fn test_schedule_maps_to_event_create() {
        assert_eq!(
            classify("Schedule a team sync for Monday"),
            tags(&["event-create"])
        );
    }

    #[test]
    fn test_update_and_delete_groups() {
        assert_eq!(classify("update the standup slot"), tags(&["event-update"]));
        assert_eq!(classify("please cancel my dentist visit"), tags(&["event-delete"]));
    }

    #[test]
    fn test_multiple_groups_union() {
        assert_eq!(
            classify("Check if I am free, then book a slot"),
            tags(&["calendar-read", "event-create"])
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(classify("CHECK the calendar"), tags(&["calendar-read"]));
    }

    #[test]
    fn test_whole_word_matching() {
        // "checking" and "address" must not trigger the check/add keywords
        assert_eq!(
            classify("checking the address list"),
            tags(&["calendar-read"])
        );
    }

    #[test]
    fn test_unmatched_message_falls_back() {
        assert_eq!(classify("hello there"), tags(&[DEFAULT_CAPABILITY]));
        assert_eq!(classify(""), tags(&[DEFAULT_CAPABILITY]));
    }
}
