//! Url filter matching.
//!
//! Compiles the host's `urlFilter` pattern syntax into a regex:
//!
//! - `*` matches any run of characters
//! - `|` at the start or end anchors to the start or end of the URL
//! - `||` at the start anchors to the start of a domain label in the host
//! - `^` matches a separator character or the end of the URL
//!
//! Anything else matches literally, case-insensitively.

use regex::Regex;
use thiserror::Error;

/// Reasons a url filter is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("url filter cannot be empty")]
    Empty,
    #[error("url filter must be ASCII: {0}")]
    NonAscii(String),
    #[error("'||' is only allowed at the start of a url filter: {0}")]
    MisplacedDomainAnchor(String),
    #[error("'|' is only allowed at the start or end of a url filter: {0}")]
    MisplacedAnchor(String),
    #[error("url filter does not compile: {0}")]
    Compile(String),
}

/// A compiled url filter.
#[derive(Debug, Clone)]
pub struct UrlFilter {
    raw: String,
    regex: Regex,
}

enum LeftAnchor {
    None,
    Start,
    Domain,
}

impl UrlFilter {
    /// Parse and compile a url filter.
    pub fn parse(filter: &str) -> Result<Self, FilterError> {
        if filter.is_empty() {
            return Err(FilterError::Empty);
        }
        if !filter.is_ascii() {
            return Err(FilterError::NonAscii(filter.to_string()));
        }

        let (left, rest) = if let Some(rest) = filter.strip_prefix("||") {
            (LeftAnchor::Domain, rest)
        } else if let Some(rest) = filter.strip_prefix('|') {
            (LeftAnchor::Start, rest)
        } else {
            (LeftAnchor::None, filter)
        };

        let (body, right_anchor) = match rest.strip_suffix('|') {
            Some(body) => (body, true),
            None => (rest, false),
        };

        if body.contains("||") {
            return Err(FilterError::MisplacedDomainAnchor(filter.to_string()));
        }
        if body.contains('|') {
            return Err(FilterError::MisplacedAnchor(filter.to_string()));
        }
        if body.is_empty() {
            return Err(FilterError::Empty);
        }

        let mut pattern = String::from("(?i)");
        match left {
            LeftAnchor::None => {}
            LeftAnchor::Start => pattern.push('^'),
            LeftAnchor::Domain => pattern.push_str(r"^[^:/?#]+://(?:[^/?#]*\.)?"),
        }
        for ch in body.chars() {
            match ch {
                '*' => pattern.push_str(".*"),
                '^' => pattern.push_str(r"(?:[^A-Za-z0-9_\-.%]|$)"),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        if right_anchor {
            pattern.push('$');
        }

        let regex = Regex::new(&pattern).map_err(|e| FilterError::Compile(e.to_string()))?;
        Ok(Self {
            raw: filter.to_string(),
            regex,
        })
    }

    /// The filter as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether `url` matches this filter.
    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}
