//! URI templates for resources.
//!
//! Templates use `{name}` placeholders that match one non-empty path segment,
//! e.g. `metadata://tables/{table}`. Specificity is the number of literal
//! characters; a template without placeholders is always more specific than
//! one with placeholders.

use crate::error::RegistryError;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Values captured from a URI by a template.
pub type TemplateVars = BTreeMap<String, String>;

/// A compiled URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    pattern: Regex,
    variables: Vec<String>,
    literal_len: usize,
}

impl UriTemplate {
    /// Parse and compile a template.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidTemplate {
            template: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("template is empty"));
        }

        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut literal_len = 0;
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            let literal = &rest[..open];
            if literal.contains('}') {
                return Err(invalid("unmatched '}'"));
            }
            pattern.push_str(&regex::escape(literal));
            literal_len += literal.chars().count();

            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let name = &after[..close];
            if !is_identifier(name) {
                return Err(invalid("placeholder names must be identifiers"));
            }
            if variables.iter().any(|v| v == name) {
                return Err(invalid("placeholder names must be unique"));
            }
            pattern.push_str(&format!("(?P<{}>[^/]+)", name));
            variables.push(name.to_string());
            rest = &after[close + 1..];
        }

        if rest.contains('}') {
            return Err(invalid("unmatched '}'"));
        }
        pattern.push_str(&regex::escape(rest));
        literal_len += rest.chars().count();
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            pattern,
            variables,
            literal_len,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the template names exactly one URI.
    pub fn is_static(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Ranking used to pick between several matching templates.
    pub fn specificity(&self) -> (bool, usize) {
        (self.is_static(), self.literal_len)
    }

    /// Match a URI, returning the captured placeholder values.
    pub fn matches(&self, uri: &str) -> Option<TemplateVars> {
        let captures = self.pattern.captures(uri)?;
        let vars = self
            .variables
            .iter()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(vars)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_template() {
        let t = UriTemplate::parse("metadata://catalog").unwrap();
        assert!(t.is_static());
        assert!(t.matches("metadata://catalog").unwrap().is_empty());
        assert!(t.matches("metadata://catalog/x").is_none());
    }

    #[test]
    fn test_placeholder_captures_one_segment() {
        let t = UriTemplate::parse("metadata://tables/{table}").unwrap();
        let vars = t.matches("metadata://tables/orders").unwrap();
        assert_eq!(vars.get("table").map(String::as_str), Some("orders"));
        assert!(t.matches("metadata://tables/").is_none());
        assert!(t.matches("metadata://tables/a/b").is_none());
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        let t = UriTemplate::parse("db://x.y/{id}").unwrap();
        assert!(t.matches("db://xzy/1").is_none());
        assert!(t.matches("db://x.y/1").is_some());
    }

    #[test]
    fn test_specificity_prefers_static_then_longer_literals() {
        let exact = UriTemplate::parse("schema://tables/orders").unwrap();
        let long = UriTemplate::parse("schema://tables/{table}").unwrap();
        let short = UriTemplate::parse("schema://{kind}/{name}").unwrap();
        assert!(exact.specificity() > long.specificity());
        assert!(long.specificity() > short.specificity());
    }

    #[test]
    fn test_invalid_templates() {
        assert!(UriTemplate::parse("").is_err());
        assert!(UriTemplate::parse("a://{x").is_err());
        assert!(UriTemplate::parse("a://x}").is_err());
        assert!(UriTemplate::parse("a://{1x}").is_err());
        assert!(UriTemplate::parse("a://{x}/{x}").is_err());
    }
}
