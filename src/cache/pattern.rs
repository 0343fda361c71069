//! Glob patterns for bulk cache invalidation.
//!
//! `*` matches any run of characters (including `:`), `?` matches exactly one
//! character, line breaks included; everything else is literal. Patterns are
//! anchored at both ends.

use regex::Regex;

use crate::error::CacheError;

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        if pattern.is_empty() {
            return Err(CacheError::Pattern("pattern is empty".to_string()));
        }

        let mut expr = String::with_capacity(pattern.len() + 12);
        // Keys may contain line breaks; wildcards must cross them
        expr.push_str("(?s)^");
        let mut literal = String::new();
        for c in pattern.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| CacheError::Pattern(e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Test a key against the pattern
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern() {
        let pattern = GlobPattern::new("products:shop1:*").unwrap();
        assert!(pattern.matches("products:shop1:list"));
        assert!(pattern.matches("products:shop1:detail:42"));
        assert!(pattern.matches("products:shop1:"));
        assert!(!pattern.matches("products:shop10:list"));
        assert!(!pattern.matches("products:shop2:list"));
        assert!(!pattern.matches("xproducts:shop1:list"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("a.b+c:*").unwrap();
        assert!(pattern.matches("a.b+c:1"));
        assert!(!pattern.matches("axb+c:1"));
        assert!(!pattern.matches("a.bbc:1"));
    }

    #[test]
    fn test_single_char_wildcard() {
        let pattern = GlobPattern::new("page:?").unwrap();
        assert!(pattern.matches("page:1"));
        assert!(!pattern.matches("page:10"));
        assert!(!pattern.matches("page:"));
    }

    #[test]
    fn test_infix_wildcard() {
        let pattern = GlobPattern::new("*:acme.myshopify.com:*").unwrap();
        assert!(pattern.matches("products:acme.myshopify.com:list"));
        assert!(pattern.matches("shop:acme.myshopify.com:meta"));
        assert!(!pattern.matches("products:other.myshopify.com:list"));
    }

    #[test]
    fn test_wildcards_cross_line_breaks() {
        let pattern = GlobPattern::new("products:shop1:*").unwrap();
        assert!(pattern.matches("products:shop1:line one\nline two"));

        let single = GlobPattern::new("page:?").unwrap();
        assert!(single.matches("page:\n"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(GlobPattern::new(""), Err(CacheError::Pattern(_))));
    }
}
