//! Mock rule records.
//!
//! A [`Rule`] maps a URL filter and an HTTP method to a canned response body.
//! This is the record shape shared by the UI store, the persisted list and
//! the background controller's message payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a rule. Doubles as the id of its host redirect directive.
pub type RuleId = u32;

/// Largest id the host accepts for a dynamic rule.
pub const MAX_RULE_ID: RuleId = i32::MAX as RuleId;

/// HTTP verbs a rule can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Upper-case verb, as shown to users and persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Lower-case verb, as the host's `requestMethods` condition expects it.
    pub fn as_host_method(&self) -> String {
        self.as_str().to_lowercase()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method: {}", other)),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

/// A single mock rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id, shared with the host directive
    pub id: RuleId,

    /// URL filter the request must match
    pub path: String,

    /// HTTP method to match
    pub method: HttpMethod,

    /// Only enabled rules are materialized as host redirects
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Literal response body served on match
    #[serde(default)]
    pub mock: String,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Build a rule from a draft and an allocated id.
    pub fn from_draft(id: RuleId, draft: RuleDraft) -> Self {
        Self {
            id,
            path: draft.path,
            method: draft.method,
            enabled: draft.enabled,
            mock: draft.mock,
        }
    }

    /// Validate the rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.id == 0 || self.id > MAX_RULE_ID {
            return Err(format!("rule id {} is out of range", self.id));
        }
        validate_path(&self.path)
    }

    /// Return a copy with `patch` applied. The id is never changed.
    pub fn patched(&self, patch: &RulePatch) -> Self {
        let mut rule = self.clone();
        if let Some(path) = &patch.path {
            rule.path = path.clone();
        }
        if let Some(method) = patch.method {
            rule.method = method;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(mock) = &patch.mock {
            rule.mock = mock.clone();
        }
        rule
    }
}

/// Compact a mock body if it is valid JSON, otherwise return it unchanged.
pub fn normalized_mock(mock: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(mock) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| mock.to_string()),
        Err(_) => mock.to_string(),
    }
}

fn validate_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("rule path cannot be empty".to_string());
    }
    Ok(())
}

/// A rule that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub path: String,
    pub method: HttpMethod,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mock: String,
}

impl RuleDraft {
    pub fn new(path: impl Into<String>, method: HttpMethod, mock: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            enabled: true,
            mock: mock.into(),
        }
    }

    /// Validate the draft.
    pub fn validate(&self) -> Result<(), String> {
        validate_path(&self.path)
    }
}

/// Partial update of an existing rule; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePatch {
    pub id: RuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock: Option<String>,
}

impl RulePatch {
    pub fn new(id: RuleId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn mock(mut self, mock: impl Into<String>) -> Self {
        self.mock = Some(mock.into());
        self
    }

    /// Validate the fields that are being changed.
    pub fn validate(&self) -> Result<(), String> {
        match &self.path {
            Some(path) => validate_path(path),
            None => Ok(()),
        }
    }
}
