//! Thread headers: Message-ID generation and References chains.
//!
//! References lists ids oldest → newest, so the last id of a chain is the
//! immediate parent of whatever message carries it.

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

/// A fresh RFC 2822 Message-ID: `<millis-random@domain>`.
pub fn generate_message_id(domain: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!(
        "<{}-{}@{}>",
        Utc::now().timestamp_millis(),
        suffix.to_lowercase(),
        domain.trim().trim_start_matches('@')
    )
}

/// A parsed References chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReferences {
    /// The chain re-joined with single spaces, `None` when empty.
    pub references_header: Option<String>,
    /// Last id in the chain.
    pub parent_message_id: Option<String>,
    pub reference_ids: Vec<String>,
}

pub fn parse_references(value: Option<&str>) -> ParsedReferences {
    let reference_ids: Vec<String> = value
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if reference_ids.is_empty() {
        return ParsedReferences::default();
    }

    ParsedReferences {
        references_header: Some(reference_ids.join(" ")),
        parent_message_id: reference_ids.last().cloned(),
        reference_ids,
    }
}

/// Concatenate chains in argument order, keeping the first occurrence of each
/// id. `None` only when every input is empty.
pub fn merge_references(chains: &[Option<&str>]) -> Option<String> {
    let mut merged: Vec<&str> = Vec::new();
    for chain in chains.iter().flatten() {
        for id in chain.split_whitespace() {
            if !merged.contains(&id) {
                merged.push(id);
            }
        }
    }
    (!merged.is_empty()).then(|| merged.join(" "))
}

/// Threading headers for one outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadHeaders {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

impl ThreadHeaders {
    /// Headers for a message continuing `references` (already merged).
    pub fn for_reply(message_id: String, references: Option<String>) -> Self {
        let parsed = parse_references(references.as_deref());
        Self {
            message_id,
            in_reply_to: parsed.parent_message_id,
            references: parsed.references_header,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_shape() {
        let id = generate_message_id("fundmail.app");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@fundmail.app>"));
        assert_ne!(id, generate_message_id("fundmail.app"));
    }

    #[test]
    fn parse_picks_last_as_parent() {
        let parsed = parse_references(Some("  <a@x>\n <b@x>   <c@x> "));
        assert_eq!(parsed.reference_ids, vec!["<a@x>", "<b@x>", "<c@x>"]);
        assert_eq!(parsed.parent_message_id.as_deref(), Some("<c@x>"));
        assert_eq!(parsed.references_header.as_deref(), Some("<a@x> <b@x> <c@x>"));
    }

    #[test]
    fn parse_empty() {
        assert_eq!(parse_references(None), ParsedReferences::default());
        assert_eq!(parse_references(Some("   ")), ParsedReferences::default());
    }

    #[test]
    fn merge_predecessor_chain_and_id() {
        assert_eq!(
            merge_references(&[Some("<m1>"), Some("<m2>")]).as_deref(),
            Some("<m1> <m2>")
        );
    }

    #[test]
    fn merge_dedups_by_first_occurrence() {
        assert_eq!(
            merge_references(&[Some("<a> <b>"), Some("<b> <c> <a>")]).as_deref(),
            Some("<a> <b> <c>")
        );
    }

    #[test]
    fn merge_all_empty_is_none() {
        assert_eq!(merge_references(&[None, Some(""), Some("  ")]), None);
        assert_eq!(merge_references(&[]), None);
    }

    #[test]
    fn merge_is_idempotent() {
        let a = Some("<a> <b>");
        let b = Some("<c> <a>");
        let once = merge_references(&[a, b]);
        let twice = merge_references(&[once.as_deref(), a]);
        assert_eq!(once, twice);
    }

    #[test]
    fn reply_headers_from_chain() {
        let h = ThreadHeaders::for_reply("<new@x>".into(), Some("<m1> <m2>".into()));
        assert!(h.is_reply());
        assert_eq!(h.in_reply_to.as_deref(), Some("<m2>"));
        assert_eq!(h.references.as_deref(), Some("<m1> <m2>"));

        let fresh = ThreadHeaders::for_reply("<new@x>".into(), None);
        assert!(!fresh.is_reply());
        assert_eq!(fresh.references, None);
    }
}
