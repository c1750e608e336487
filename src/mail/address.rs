//! Address normalization: free-form From/To/Cc header values into bare
//! addresses and case-variant candidate sets.

use serde::{Deserialize, Serialize};

/// Extract a bare address from a single header entry.
///
/// `"Jane Doe" <Jane@X.com>` → `Jane@X.com`; `jane@x.com` → `jane@x.com`.
/// Case is preserved. Returns `None` when nothing address-shaped is found.
pub fn extract_address(header_value: &str) -> Option<String> {
    let value = header_value.trim();
    if value.is_empty() {
        return None;
    }

    let candidate = match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => value,
    };

    let candidate = candidate
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim_start_matches("mailto:")
        .trim();

    is_address_shaped(candidate).then(|| candidate.to_string())
}

/// Split a header on commas (outside quotes and angle brackets) and extract
/// every parseable address. Unparseable entries are dropped.
pub fn extract_addresses(header_value: &str) -> Vec<String> {
    split_header_list(header_value)
        .into_iter()
        .filter_map(extract_address)
        .collect()
}

/// Lowercased, de-duplicated addresses from several headers, first
/// occurrence order preserved.
pub fn unique_lowercase<'a>(addresses: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for addr in addresses {
        let lower = addr.to_lowercase();
        if !out.contains(&lower) {
            out.push(lower);
        }
    }
    out
}

fn is_address_shaped(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !s.chars().any(|c| c.is_whitespace() || c == '<' || c == '>' || c == ',')
}

fn split_header_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut start = 0;

    for (i, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' | ';' if !in_quotes && !in_angle => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// The three case variants of one address.
///
/// Stored rows may carry any casing, and the store compares exactly, so
/// lookups try every variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub exact: String,
    pub lower: String,
    pub upper: String,
}

impl CandidateSet {
    /// Distinct variants, in exact/lower/upper order.
    pub fn variants(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(3);
        for v in [&self.exact, &self.lower, &self.upper] {
            if !out.contains(&v.as_str()) {
                out.push(v);
            }
        }
        out
    }

    pub fn matches(&self, other: &str) -> bool {
        self.lower == other.trim().to_lowercase()
    }
}

pub fn build_candidate_set(address: &str) -> CandidateSet {
    let exact = address.trim().to_string();
    CandidateSet {
        lower: exact.to_lowercase(),
        upper: exact.to_uppercase(),
        exact,
    }
}

/// Flattened variants of several addresses, de-duplicated.
pub fn candidate_variants(sets: &[CandidateSet]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for set in sets {
        for v in set.variants() {
            if !out.iter().any(|o| o == v) {
                out.push(v.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_stripped() {
        assert_eq!(
            extract_address(r#""Name" <x@y.com>"#).as_deref(),
            Some("x@y.com")
        );
        assert_eq!(
            extract_address("Jane Doe <Jane@Corp.com>").as_deref(),
            Some("Jane@Corp.com")
        );
    }

    #[test]
    fn bare_address_passes_through() {
        assert_eq!(extract_address("  bob@us.com ").as_deref(), Some("bob@us.com"));
        assert_eq!(extract_address("mailto:bob@us.com").as_deref(), Some("bob@us.com"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(extract_address(""), None);
        assert_eq!(extract_address("undisclosed-recipients:;"), None);
        assert_eq!(extract_address("Jane Doe"), None);
        assert_eq!(extract_address("<>"), None);
    }

    #[test]
    fn list_with_quoted_commas() {
        let header = r#""Doe, Jane" <jane@x.com>, bob@us.com, not an address, <carol@z.io>"#;
        assert_eq!(
            extract_addresses(header),
            vec!["jane@x.com", "bob@us.com", "carol@z.io"]
        );
    }

    #[test]
    fn candidate_set_has_three_variants() {
        let set = build_candidate_set("Alice@Corp.com");
        assert_eq!(set.variants(), vec!["Alice@Corp.com", "alice@corp.com", "ALICE@CORP.COM"]);
        assert!(set.matches("ALICE@corp.COM"));
    }

    #[test]
    fn candidate_set_collapses_duplicates() {
        let set = build_candidate_set("alice@corp.com");
        assert_eq!(set.variants(), vec!["alice@corp.com", "ALICE@CORP.COM"]);
    }

    #[test]
    fn flattened_variants_are_unique() {
        let sets = vec![build_candidate_set("a@b.com"), build_candidate_set("A@B.com")];
        let all = candidate_variants(&sets);
        assert_eq!(all, vec!["a@b.com", "A@B.COM", "A@B.com"]);
    }

    #[test]
    fn unique_lowercase_keeps_first_order() {
        let out = unique_lowercase(["B@x.com", "a@x.com", "b@X.com"]);
        assert_eq!(out, vec!["b@x.com", "a@x.com"]);
    }
}
