//! Host redirect directives.
//!
//! Translates mock rules into the host's declarative rule shape: match on
//! url filter, method and resource type, then redirect to a `data:` URI
//! that carries the mock body.

use crate::rule::{Rule, RuleId};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Priority given to every mock directive.
pub const DIRECTIVE_PRIORITY: u32 = 1;

/// Resource type of XHR / fetch requests.
pub const XHR_RESOURCE_TYPE: &str = "xmlhttprequest";

/// MIME prefix of the redirect target.
const DATA_URI_PREFIX: &str = "data:application/json;charset=utf-8";

/// How the mock body is embedded in the data URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectEncoding {
    /// Body embedded verbatim after the comma
    #[default]
    Plain,
    /// Body base64 encoded (`;base64,` form)
    Base64,
}

/// A native redirect directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectDirective {
    pub id: RuleId,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

/// Directive action. Only redirects are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Redirect { redirect: Redirect },
}

impl RuleAction {
    /// Target URL of the redirect.
    pub fn redirect_url(&self) -> &str {
        match self {
            RuleAction::Redirect { redirect } => &redirect.url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub url: String,
}

/// Directive match condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub url_filter: String,
    pub request_methods: Vec<String>,
    pub resource_types: Vec<String>,
}

/// One atomic change to the host's dynamic rule table.
///
/// Removals are applied before additions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicRulesUpdate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_rule_ids: Vec<RuleId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_rules: Vec<RedirectDirective>,
}

impl DynamicRulesUpdate {
    pub fn is_empty(&self) -> bool {
        self.remove_rule_ids.is_empty() && self.add_rules.is_empty()
    }
}

impl RedirectDirective {
    /// Build the directive for a rule.
    pub fn from_rule(rule: &Rule, encoding: RedirectEncoding) -> Self {
        Self {
            id: rule.id,
            priority: DIRECTIVE_PRIORITY,
            action: RuleAction::Redirect {
                redirect: Redirect {
                    url: data_uri(&rule.mock, encoding),
                },
            },
            condition: RuleCondition {
                url_filter: rule.path.clone(),
                request_methods: vec![rule.method.as_host_method()],
                resource_types: vec![XHR_RESOURCE_TYPE.to_string()],
            },
        }
    }
}

/// Build the `data:` URI serving `body` as JSON.
pub fn data_uri(body: &str, encoding: RedirectEncoding) -> String {
    match encoding {
        RedirectEncoding::Plain => format!("{},{}", DATA_URI_PREFIX, body),
        RedirectEncoding::Base64 => format!(
            "{};base64,{}",
            DATA_URI_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(body.as_bytes())
        ),
    }
}

/// Decode the body carried by a `data:` URI.
pub fn decode_data_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, body) = rest.split_once(',')?;
    if meta.ends_with(";base64") {
        let bytes = base64::engine::general_purpose::STANDARD.decode(body).ok()?;
        String::from_utf8(bytes).ok()
    } else {
        Some(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{HttpMethod, RuleDraft};

    fn users_rule() -> Rule {
        Rule::from_draft(1, RuleDraft::new("/api/users", HttpMethod::Get, r#"{"ok":true}"#))
    }

    #[test]
    fn test_directive_shape() {
        let directive = RedirectDirective::from_rule(&users_rule(), RedirectEncoding::Plain);
        let value = serde_json::to_value(&directive).unwrap();

        assert_eq!(value["id"], 1);
        assert_eq!(value["priority"], 1);
        assert_eq!(value["action"]["type"], "redirect");
        assert_eq!(
            value["action"]["redirect"]["url"],
            r#"data:application/json;charset=utf-8,{"ok":true}"#
        );
        assert_eq!(value["condition"]["urlFilter"], "/api/users");
        assert_eq!(value["condition"]["requestMethods"][0], "get");
        assert_eq!(value["condition"]["resourceTypes"][0], "xmlhttprequest");
    }

    #[test]
    fn test_base64_encoding() {
        let directive = RedirectDirective::from_rule(&users_rule(), RedirectEncoding::Base64);
        let url = directive.action.redirect_url();
        assert!(url.starts_with("data:application/json;charset=utf-8;base64,"));
        assert_eq!(decode_data_uri(url).unwrap(), r#"{"ok":true}"#);
    }

    #[test]
    fn test_decode_plain_data_uri() {
        assert_eq!(
            decode_data_uri("data:application/json;charset=utf-8,[1,2]").as_deref(),
            Some("[1,2]")
        );
        assert!(decode_data_uri("https://example.com").is_none());
    }

    #[test]
    fn test_update_serialization_omits_empty_lists() {
        let update = DynamicRulesUpdate {
            remove_rule_ids: vec![4, 5],
            add_rules: vec![],
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, serde_json::json!({"removeRuleIds": [4, 5]}));
        assert!(DynamicRulesUpdate::default().is_empty());
    }
}
