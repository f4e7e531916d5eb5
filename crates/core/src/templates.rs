//! Message template interpolation using `{{placeholder}}` syntax.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Recipient fields available to a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateFields<'a> {
    pub name: Option<&'a str>,
    pub phone: Option<&'a str>,
}

impl<'a> TemplateFields<'a> {
    pub fn new(name: Option<&'a str>, phone: &'a str) -> Self {
        Self {
            name,
            phone: Some(phone),
        }
    }
}

/// Matches the supported placeholders, case-insensitively.
const PLACEHOLDER_PATTERN: &str = r"(?i)\{\{(name|phone|phonenumber)\}\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Substitute recipient fields into `template`.
///
/// `{{name}}` becomes the name (empty when absent); `{{phone}}` and
/// `{{phoneNumber}}` become the phone. Placeholder names match
/// case-insensitively and every occurrence is replaced, including ones
/// wrapped in extra braces. Any other placeholder, or one whose field was
/// not supplied, is left verbatim. Substituted values are not rescanned.
pub fn interpolate(template: &str, fields: &TemplateFields<'_>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            if key.eq_ignore_ascii_case("name") {
                fields.name.unwrap_or("").to_string()
            } else {
                fields.phone.unwrap_or(&caps[0]).to_string()
            }
        })
        .into_owned()
}
