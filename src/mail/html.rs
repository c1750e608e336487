//! HTML body cleanup for outgoing mail.
//!
//! Drafts are written in a rich-text editor that styles through `ql-*`
//! classes. Mail clients drop stylesheets, so each class is rewritten into an
//! inline `style` before sending.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static CLASS_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([a-zA-Z][a-zA-Z0-9]*)([^>]*?)\sclass="([^"]*)"([^>]*)>"#).unwrap());

static EMPTY_PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<p>\s*(?:<br\s*/?>)?\s*</p>").unwrap());

static STYLE_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"\sstyle="([^"]*)""#).unwrap());

/// Inline style for one editor class, `None` for classes we don't translate.
fn class_style(class: &str) -> Option<String> {
    if let Some(align) = class.strip_prefix("ql-align-") {
        return matches!(align, "center" | "right" | "justify")
            .then(|| format!("text-align: {align};"));
    }
    if let Some(level) = class.strip_prefix("ql-indent-") {
        let level: u32 = level.parse().ok()?;
        return Some(format!("padding-left: {}em;", level * 3));
    }
    if let Some(size) = class.strip_prefix("ql-size-") {
        let px = match size {
            "small" => "10px",
            "large" => "20px",
            "huge" => "32px",
            _ => return None,
        };
        return Some(format!("font-size: {px};"));
    }
    if let Some(font) = class.strip_prefix("ql-font-") {
        let family = match font {
            "serif" => "Georgia, 'Times New Roman', serif",
            "monospace" => "Monaco, 'Courier New', monospace",
            _ => return None,
        };
        return Some(format!("font-family: {family};"));
    }
    None
}

/// Rewrite editor markup into email-safe HTML.
///
/// `ql-*` classes become inline styles (merged into any existing `style`),
/// other classes are kept, and empty paragraphs collapse to `<br>`.
pub fn clean_html_body(html: &str) -> String {
    let styled = CLASS_ATTR.replace_all(html, |caps: &Captures| {
        let tag = &caps[1];
        let mut before = caps[2].to_string();
        let mut after = caps[4].to_string();

        let mut styles = Vec::new();
        let mut kept = Vec::new();
        for class in caps[3].split_whitespace() {
            match class_style(class) {
                Some(style) => styles.push(style),
                None if class.starts_with("ql-") => {}
                None => kept.push(class),
            }
        }

        let mut attrs = String::new();
        if !styles.is_empty() {
            let inline = styles.join(" ");
            // Merge into an existing style attribute on either side of class.
            let mut merged = false;
            for part in [&mut before, &mut after] {
                if !merged && let Some(m) = STYLE_ATTR.captures(part) {
                    let existing = m[1].trim().trim_end_matches(';').to_string();
                    let replacement = if existing.is_empty() {
                        format!(r#" style="{inline}""#)
                    } else {
                        format!(r#" style="{existing}; {inline}""#)
                    };
                    let updated = STYLE_ATTR.replace(part.as_str(), replacement.as_str()).into_owned();
                    *part = updated;
                    merged = true;
                }
            }
            if !merged {
                attrs.push_str(&format!(r#" style="{inline}""#));
            }
        }
        if !kept.is_empty() {
            attrs.push_str(&format!(r#" class="{}""#, kept.join(" ")));
        }

        format!("<{tag}{before}{attrs}{after}>")
    });

    EMPTY_PARAGRAPH.replace_all(&styled, "<br>").trim().to_string()
}

/// Strip tags and normalize whitespace (plain-text alternative part).
pub fn strip_html(html: &str) -> String {
    let spaced = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</p>", "</p>\n")
        .replace("</div>", "</div>\n");

    let mut result = String::new();
    let mut in_tag = false;
    for ch in spaced.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a body looks like HTML rather than plain text.
pub fn looks_like_html(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["<p", "<div", "<br", "<html", "<span", "<a ", "<ol", "<ul"]
        .iter()
        .any(|tag| lower.contains(tag))
}
