//! Glob patterns over cache keys.
//!
//! Only `*` is special: it matches any run of characters, including `:`.
//! Everything else matches literally.

use regex::Regex;

use crate::error::CacheError;

#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn compile(glob: &str) -> Result<Self, CacheError> {
        let body = regex::escape(glob).replace(r"\*", ".*");
        let regex = Regex::new(&format!("^{}$", body))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(glob: &str) -> KeyPattern {
        KeyPattern::compile(glob).expect("pattern should compile")
    }

    #[test]
    fn test_trailing_wildcard() {
        let p = pattern("books:*");
        assert!(p.matches("books:1"));
        assert!(p.matches("books:search:gita"));
        assert!(p.matches("books:"));
        assert!(!p.matches("community:1"));
        assert!(!p.matches("u1:books:1"));
    }

    #[test]
    fn test_exact_without_wildcard() {
        let p = pattern("community:stats");
        assert!(p.matches("community:stats"));
        assert!(!p.matches("community:stats:old"));
        assert!(!p.matches("xcommunity:stats"));
    }

    #[test]
    fn test_inner_wildcard() {
        let p = pattern("analytics:*:weekly");
        assert!(p.matches("analytics:trends:weekly"));
        assert!(!p.matches("analytics:trends:daily"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = pattern("books:search:a.b(c)+[d]?");
        assert!(p.matches("books:search:a.b(c)+[d]?"));
        assert!(!p.matches("books:search:aXb(c)+[d]?"));
        assert!(!p.matches("books:search:a.bcc"));
    }

    #[test]
    fn test_lone_wildcard_matches_everything() {
        let p = pattern("*");
        assert!(p.matches(""));
        assert!(p.matches("anything:at:all"));
    }

    #[test]
    fn test_as_str_keeps_glob() {
        assert_eq!(pattern("books:*").as_str(), "books:*");
    }
}
