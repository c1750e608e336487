//! Quote stripping: pull the newest reply out of a multi-quoted body.
//!
//! Boundaries are data: an ordered table of [`BoundaryRule`]s. Every rule is
//! scanned and the one matching earliest in the text wins, so whichever quote
//! convention appears first cuts the body regardless of table order.
//!
//! Pure string parsing, works on plain text and on HTML bodies.

use std::sync::LazyLock;

use regex::Regex;

/// One recognised quote boundary.
#[derive(Debug, Clone)]
pub struct BoundaryRule {
    /// Short name, reported by [`QuoteStripper::earliest_boundary`].
    pub name: String,
    /// Compiled regex; the match start is the cut position.
    pub regex: Regex,
}

/// Ordered table of boundary rules plus the fallback policy.
#[derive(Debug, Clone)]
pub struct QuoteStripper {
    rules: Vec<BoundaryRule>,
}

static DEFAULT_STRIPPER: LazyLock<QuoteStripper> = LazyLock::new(QuoteStripper::default_rules);

static HEADER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\*?(?:from|sent|to|cc|subject|date):").unwrap());

impl QuoteStripper {
    /// Boundaries exercised by Gmail and Outlook replies. Ties at the same
    /// offset go to the rule listed first.
    pub fn default_rules() -> Self {
        let rules = vec![
            // "On Fri, Oct 17, 2025 at 10:24 AM Jane <jane@x.com> wrote:" (Gmail may wrap once)
            BoundaryRule {
                name: "on_wrote".into(),
                regex: Regex::new(r"(?m)^[ \t]*On\b[^\n]*(?:\n[^\n]*)?\bwrote:[ \t]*$").unwrap(),
            },
            BoundaryRule {
                name: "original_message".into(),
                regex: Regex::new(r"(?mi)^[ \t]*-{2,}[ \t]*Original Message[ \t]*-{2,}").unwrap(),
            },
            BoundaryRule {
                name: "forwarded_message".into(),
                regex: Regex::new(r"(?mi)^[ \t]*-{2,}[ \t]*Forwarded message[ \t]*-{2,}").unwrap(),
            },
            // Outlook header block: "From: ..." directly followed by Sent/Date/To/Subject
            BoundaryRule {
                name: "outlook_header".into(),
                regex: Regex::new(
                    r"(?mi)^[ \t]*\*?From:\*?[^\n]*\n[ \t]*\*?(?:Sent|Date|To|Subject):",
                )
                .unwrap(),
            },
            BoundaryRule {
                name: "horizontal_rule".into(),
                regex: Regex::new(r"(?m)^[ \t]*(?:_{8,}|-{8,})[ \t]*$").unwrap(),
            },
            BoundaryRule {
                name: "quote_marker".into(),
                regex: Regex::new(r"(?m)^[ \t]*>").unwrap(),
            },
            BoundaryRule {
                name: "gmail_quote".into(),
                regex: Regex::new(r#"(?i)<div[^>]*class=["']?[^"'>]*gmail_quote"#).unwrap(),
            },
            BoundaryRule {
                name: "outlook_reply_div".into(),
                regex: Regex::new(r#"(?i)<div[^>]*id=["']?(?:divRplyFwdMsg|appendonsend)"#).unwrap(),
            },
            BoundaryRule {
                name: "blockquote".into(),
                regex: Regex::new(r"(?i)<blockquote\b").unwrap(),
            },
            BoundaryRule {
                name: "html_rule".into(),
                regex: Regex::new(r"(?i)<hr\b[^>]*>").unwrap(),
            },
        ];
        Self { rules }
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a custom boundary rule.
    pub fn add_rule(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        self.rules.push(BoundaryRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    pub fn rules(&self) -> &[BoundaryRule] {
        &self.rules
    }

    /// Earliest boundary in `body` across all rules: `(offset, rule name)`.
    pub fn earliest_boundary(&self, body: &str) -> Option<(usize, &str)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.regex.find(body).map(|m| (m.start(), rule.name.as_str())))
            .min_by_key(|(offset, _)| *offset)
    }

    /// Text attributable to the newest reply only.
    ///
    /// Never returns an empty string for non-blank input: when the cut leaves
    /// nothing, falls back to the last non-quoted, non-header line, then to
    /// the untouched input.
    pub fn extract_latest_reply(&self, raw_body: &str) -> String {
        // Rules see `\n` line ends; the cut is made on the raw text.
        let body = raw_body.replace("\r\n", "\n");

        let stripped = match self.earliest_boundary(&body) {
            Some((offset, rule)) => {
                tracing::trace!(offset, rule, "Quote boundary found");
                trim_quote_tail(&raw_body[..raw_offset(raw_body, offset)])
            }
            None => raw_body.trim(),
        };

        if !stripped.is_empty() {
            return stripped.to_string();
        }

        last_unquoted_line(&body).unwrap_or_else(|| raw_body.to_string())
    }
}

impl Default for QuoteStripper {
    fn default() -> Self {
        Self::default_rules()
    }
}

/// [`QuoteStripper::extract_latest_reply`] with the default rule table.
pub fn extract_latest_reply(raw_body: &str) -> String {
    DEFAULT_STRIPPER.extract_latest_reply(raw_body)
}

/// Byte offset in `raw` of `offset` in its `\r\n`-collapsed form.
fn raw_offset(raw: &str, offset: usize) -> usize {
    let bytes = raw.as_bytes();
    let (mut i, mut seen) = (0, 0);
    while i < bytes.len() && seen < offset {
        i += if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
        seen += 1;
    }
    i
}

/// Drop trailing blank lines, `>` fragments and stray "wrote:" remnants.
fn trim_quote_tail(prefix: &str) -> &str {
    let mut kept = prefix;
    loop {
        let body = kept.trim_end_matches(['\r', '\n']);
        let start = body.rfind('\n').map_or(0, |i| i + 1);
        let last = body[start..].trim();
        if body.is_empty() || !(last.is_empty() || last.starts_with('>') || last.ends_with("wrote:")) {
            kept = body;
            break;
        }
        kept = &body[..start];
    }
    kept.trim()
}

fn last_unquoted_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.starts_with('>'))
        .filter(|l| !HEADER_LINE.is_match(l))
        .filter(|l| !(l.starts_with("On ") && l.ends_with("wrote:")))
        .filter(|l| !l.chars().all(|c| c == '-' || c == '_'))
        .last()
        .map(str::to_string)
}
