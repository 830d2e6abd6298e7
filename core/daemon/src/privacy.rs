//! Privacy gate applied before anything reaches the delivery queue.
//!
//! Only free-text fields are rewritten. Ids, timestamps, and paths stay
//! untouched because correlation and workspace attribution key off them.

use companion_daemon_protocol::EventType;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// Redaction Patterns
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}").unwrap());
pub static RE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:~|[A-Za-z]:)?(?:[/\\][\w.-]+){2,}").unwrap());
pub static RE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+(?: [A-Z][a-z]+)+\b").unwrap());
pub static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:[.,-]\d+)*\b").unwrap());

/// Top-level payload fields that carry free text.
pub const FREE_TEXT_FIELDS: &[&str] = &["content", "data", "text", "prompt", "response"];

/// Keys never rewritten, even when nested inside `data`.
pub const STRUCTURAL_FIELDS: &[&str] = &[
    "id",
    "seq",
    "timestamp",
    "path",
    "file_path",
    "workspace_id",
    "session_id",
    "prompt_id",
    "entry_id",
    "conversation_id",
    "event_type",
    "role",
];

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrivacyPolicy {
    pub enabled: bool,
    pub consent_given: bool,
    pub sensitivity: Sensitivity,
    pub redact_names: bool,
    pub redact_emails: bool,
    pub redact_numbers: bool,
    pub redact_paths: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Pass(Value),
    Drop { reason: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct PrivacyFilter {
    policy: PrivacyPolicy,
}

impl PrivacyFilter {
    pub fn new(policy: PrivacyPolicy) -> Self {
        Self { policy }
    }

    pub fn apply(&self, event_type: Option<EventType>, payload: Value) -> FilterDecision {
        if !self.policy.enabled {
            return FilterDecision::Pass(payload);
        }

        if event_type == Some(EventType::Clipboard) {
            if self.policy.sensitivity == Sensitivity::High {
                return FilterDecision::Drop {
                    reason: "clipboard_high_sensitivity",
                };
            }
            if !self.policy.consent_given {
                return FilterDecision::Drop {
                    reason: "clipboard_without_consent",
                };
            }
        }

        if !self.redacts_anything() {
            return FilterDecision::Pass(payload);
        }

        let mut payload = payload;
        if let Value::Object(fields) = &mut payload {
            for (key, value) in fields.iter_mut() {
                if !FREE_TEXT_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                if key == "data" {
                    self.redact_value(value);
                } else if let Value::String(text) = value {
                    *text = self.redact_text(text);
                }
            }
        }
        FilterDecision::Pass(payload)
    }

    pub fn redact_text(&self, text: &str) -> String {
        redact(&self.policy, text)
    }

    /// Redacts free text headed for storage outside an event payload.
    /// Returns the text untouched when the policy is off.
    pub fn scrub_text(&self, text: &str) -> String {
        if !self.policy.enabled || !self.redacts_anything() {
            return text.to_string();
        }
        self.redact_text(text)
    }

    fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(text) => *text = self.redact_text(text),
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact_value(item)),
            Value::Object(fields) => {
                for (key, nested) in fields.iter_mut() {
                    if !STRUCTURAL_FIELDS.contains(&key.as_str()) {
                        self.redact_value(nested);
                    }
                }
            }
            _ => {}
        }
    }

    fn redacts_anything(&self) -> bool {
        self.policy.redact_names
            || self.policy.redact_emails
            || self.policy.redact_numbers
            || self.policy.redact_paths
    }
}

/// Applies every enabled category. All patterns match against the original
/// text, so a placeholder is never re-matched by another category. Overlaps
/// go to the earliest, then longest, match.
pub fn redact(policy: &PrivacyPolicy, text: &str) -> String {
    let categories: [(bool, &Lazy<Regex>, &str); 4] = [
        (policy.redact_emails, &RE_EMAIL, "[EMAIL]"),
        (policy.redact_paths, &RE_PATH, "[PATH]"),
        (policy.redact_names, &RE_NAME, "[NAME]"),
        (policy.redact_numbers, &RE_NUMBER, "[NUMBER]"),
    ];

    let mut spans: Vec<(usize, usize, &str)> = categories
        .iter()
        .filter(|(enabled, _, _)| *enabled)
        .flat_map(|(_, pattern, placeholder)| {
            pattern
                .find_iter(text)
                .map(move |found| (found.start(), found.end(), *placeholder))
        })
        .collect();
    if spans.is_empty() {
        return text.to_string();
    }
    spans.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, placeholder) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        out.push_str(placeholder);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> PrivacyPolicy {
        PrivacyPolicy {
            enabled: true,
            consent_given: true,
            ..PrivacyPolicy::default()
        }
    }

    fn passed(decision: FilterDecision) -> Value {
        match decision {
            FilterDecision::Pass(value) => value,
            FilterDecision::Drop { reason } => panic!("unexpected drop: {}", reason),
        }
    }

    #[test]
    fn redacts_content_but_not_path() {
        let filter = PrivacyFilter::new(PrivacyPolicy {
            redact_emails: true,
            ..policy()
        });
        let payload = json!({"content": "contact a@b.com", "path": "a@b.com/file.txt"});

        let out = passed(filter.apply(Some(EventType::Prompt), payload));

        assert_eq!(out["content"], "contact [EMAIL]");
        assert_eq!(out["path"], "a@b.com/file.txt");
    }

    #[test]
    fn redacts_nested_data_except_structural_keys() {
        let filter = PrivacyFilter::new(PrivacyPolicy {
            redact_numbers: true,
            ..policy()
        });
        let payload = json!({
            "id": "evt-123",
            "data": {"prompt": "call 5551234", "entry_id": "e-456", "lines": ["port 8080"]}
        });

        let out = passed(filter.apply(Some(EventType::PromptResponse), payload));

        assert_eq!(out["id"], "evt-123");
        assert_eq!(out["data"]["prompt"], "call [NUMBER]");
        assert_eq!(out["data"]["entry_id"], "e-456");
        assert_eq!(out["data"]["lines"][0], "port [NUMBER]");
    }

    #[test]
    fn scrub_text_follows_the_enabled_switch() {
        let on = PrivacyFilter::new(PrivacyPolicy {
            redact_emails: true,
            ..policy()
        });
        let off = PrivacyFilter::new(PrivacyPolicy {
            enabled: false,
            redact_emails: true,
            ..PrivacyPolicy::default()
        });

        assert_eq!(on.scrub_text("mail ana@example.com"), "mail [EMAIL]");
        assert_eq!(off.scrub_text("mail ana@example.com"), "mail ana@example.com");
    }

    #[test]
    fn disabled_policy_passes_everything() {
        let filter = PrivacyFilter::new(PrivacyPolicy {
            enabled: false,
            redact_emails: true,
            sensitivity: Sensitivity::High,
            ..PrivacyPolicy::default()
        });
        let payload = json!({"content": "a@b.com"});
        assert_eq!(
            filter.apply(Some(EventType::Clipboard), payload.clone()),
            FilterDecision::Pass(payload)
        );
    }

    #[test]
    fn drops_clipboard_at_high_sensitivity() {
        let filter = PrivacyFilter::new(PrivacyPolicy {
            sensitivity: Sensitivity::High,
            ..policy()
        });
        assert!(matches!(
            filter.apply(Some(EventType::Clipboard), json!({"content": "secret"})),
            FilterDecision::Drop { .. }
        ));
        assert!(matches!(
            filter.apply(Some(EventType::Prompt), json!({"content": "fine"})),
            FilterDecision::Pass(_)
        ));
    }

    #[test]
    fn drops_clipboard_without_consent() {
        let filter = PrivacyFilter::new(PrivacyPolicy {
            consent_given: false,
            ..policy()
        });
        assert_eq!(
            filter.apply(Some(EventType::Clipboard), json!({"content": "x"})),
            FilterDecision::Drop {
                reason: "clipboard_without_consent"
            }
        );
    }

    #[test]
    fn redacts_every_enabled_category() {
        let all = PrivacyPolicy {
            redact_names: true,
            redact_emails: true,
            redact_numbers: true,
            redact_paths: true,
            ..policy()
        };
        let text = "Ada Lovelace wrote to ada@example.com about /home/ada/notes.txt on 1843";
        let redacted = redact(&all, text);
        assert_eq!(
            redacted,
            "[NAME] wrote to [EMAIL] about [PATH] on [NUMBER]"
        );
    }

    #[test]
    fn overlapping_categories_do_not_depend_on_each_other() {
        let text = "mail ops@host.io or see /srv/ops/2024/report.txt";
        let emails = PrivacyPolicy {
            redact_emails: true,
            ..policy()
        };
        let emails_and_numbers = PrivacyPolicy {
            redact_numbers: true,
            ..emails.clone()
        };
        let paths_and_numbers = PrivacyPolicy {
            redact_paths: true,
            redact_numbers: true,
            ..policy()
        };

        assert_eq!(
            redact(&emails, text),
            "mail [EMAIL] or see /srv/ops/2024/report.txt"
        );
        assert_eq!(
            redact(&emails_and_numbers, text),
            "mail [EMAIL] or see /srv/ops/[NUMBER]/report.txt"
        );
        assert_eq!(redact(&paths_and_numbers, text), "mail ops@host.io or see [PATH]");
    }
}
