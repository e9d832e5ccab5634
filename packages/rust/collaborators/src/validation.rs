//! Local structural checks on placement payloads.
//!
//! Payloads carrying raw markup or inline styling are rejected before any
//! network call, with the same error the build collaborator would return.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use siteport_shared::CollaboratorError;

struct Rule {
    label: &'static str,
    pattern: Regex,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        ("script tag", r"(?i)<\s*/?\s*script\b"),
        ("iframe tag", r"(?i)<\s*/?\s*iframe\b"),
        ("inline event handler", r#"(?i)<[^>]*\son[a-z]+\s*="#),
        ("javascript: URL", r"(?i)javascript\s*:"),
        ("inline style attribute", r#"(?i)<[^>]*\sstyle\s*="#),
    ]
    .into_iter()
    .map(|(label, re)| Rule {
        label,
        pattern: Regex::new(re).expect("valid regex"),
    })
    .collect()
});

/// Reject payload fields containing raw scripts, frames, event handlers,
/// `javascript:` URLs, or inline style attributes.
pub fn validate_payload(payload: &BTreeMap<String, String>) -> Result<(), CollaboratorError> {
    for (field, value) in payload {
        if let Some(rule) = RULES.iter().find(|r| r.pattern.is_match(value)) {
            return Err(CollaboratorError::rejected(format!(
                "field '{field}' contains disallowed {}",
                rule.label
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: &str) -> BTreeMap<String, String> {
        [("body".to_string(), value.to_string())].into()
    }

    #[test]
    fn plain_text_and_safe_links_pass() {
        assert!(validate_payload(&payload("Welcome to our bakery")).is_ok());
        assert!(validate_payload(&payload("https://example.com/about")).is_ok());
        assert!(validate_payload(&payload("<p>Simple paragraph</p>")).is_ok());
    }

    #[test]
    fn scripts_and_frames_are_rejected() {
        let err = validate_payload(&payload("hi <script>alert(1)</script>")).unwrap_err();
        assert!(matches!(err, CollaboratorError::ValidationRejected { .. }));
        assert!(err.to_string().contains("script tag"));
        assert!(validate_payload(&payload("<IFRAME src=x>")).is_err());
    }

    #[test]
    fn handlers_urls_and_inline_styles_are_rejected() {
        assert!(validate_payload(&payload(r#"<img src=x onerror="go()">"#)).is_err());
        assert!(validate_payload(&payload("javascript:void(0)")).is_err());
        let err = validate_payload(&payload(r#"<div style="color:red">x</div>"#)).unwrap_err();
        assert!(err.to_string().contains("inline style"));
    }

    #[test]
    fn prose_mentioning_style_is_fine() {
        assert!(validate_payload(&payload("Our style = modern and clean")).is_ok());
        assert!(validate_payload(&payload("Call us online = fast")).is_ok());
    }
}
