//! Message contract between the UI store and the background controller.
//!
//! Messages are JSON objects tagged by `type` with the payload under `data`:
//!
//! ```json
//! {"type": "addDynamicRules", "data": [{"id": 1, "path": "/api/users", "method": "GET", "enabled": true, "mock": "{}"}]}
//! {"type": "removeDynamicRules", "data": [1]}
//! {"type": "updateDynamicRules", "data": [{"id": 1, "path": "/api/users", "method": "GET", "enabled": false, "mock": "{}"}]}
//! ```
//!
//! Every message is answered with an [`Ack`]: `{"status": 1, "error": null}`
//! on success, `{"status": 0, "error": "<reason>"}` on failure.

use crate::rule::{Rule, RuleId};
use serde::{Deserialize, Serialize};

/// Ack status for an applied change.
pub const STATUS_OK: u8 = 1;
/// Ack status for a rejected change.
pub const STATUS_FAILED: u8 = 0;

/// A request to the background controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Message {
    /// Materialize redirects for the given rules
    AddDynamicRules(Vec<Rule>),
    /// Remove the redirects with the given ids
    RemoveDynamicRules(Vec<RuleId>),
    /// Replace the redirects for the given rules; disabled rules end up removed
    UpdateDynamicRules(Vec<Rule>),
}

impl Message {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AddDynamicRules(_) => "addDynamicRules",
            Message::RemoveDynamicRules(_) => "removeDynamicRules",
            Message::UpdateDynamicRules(_) => "updateDynamicRules",
        }
    }

    /// Number of rules or ids carried.
    pub fn len(&self) -> usize {
        match self {
            Message::AddDynamicRules(rules) | Message::UpdateDynamicRules(rules) => rules.len(),
            Message::RemoveDynamicRules(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acknowledgement sent once the host call settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: u8,
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILED,
            error: Some(error.into()),
        }
    }

    /// A non-null error means failure, whatever the status says.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK && self.error.is_none()
    }

    /// Convert into a `Result`, yielding the error text on failure.
    pub fn into_result(self) -> Result<(), String> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self
                .error
                .unwrap_or_else(|| format!("request failed with status {}", self.status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{HttpMethod, RuleDraft};

    #[test]
    fn test_message_wire_format() {
        let rule = Rule::from_draft(1, RuleDraft::new("/api/users", HttpMethod::Get, "{}"));
        let value = serde_json::to_value(Message::AddDynamicRules(vec![rule])).unwrap();
        assert_eq!(value["type"], "addDynamicRules");
        assert_eq!(value["data"][0]["path"], "/api/users");

        let value = serde_json::to_value(Message::RemoveDynamicRules(vec![1, 2])).unwrap();
        assert_eq!(value, serde_json::json!({"type": "removeDynamicRules", "data": [1, 2]}));
    }

    #[test]
    fn test_parse_update_message() {
        let json = r#"{"type":"updateDynamicRules","data":[{"id":9,"path":"/x","method":"post","enabled":false,"mock":""}]}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::UpdateDynamicRules(rules) => {
                assert_eq!(rules[0].id, 9);
                assert_eq!(rules[0].method, HttpMethod::Post);
                assert!(!rules[0].enabled);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"type":"clearDynamicRules","data":[]}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn test_ack_shape() {
        assert_eq!(
            serde_json::to_value(Ack::ok()).unwrap(),
            serde_json::json!({"status": 1, "error": null})
        );
        let failed = Ack::failed("quota exceeded");
        assert!(!failed.is_ok());
        assert_eq!(failed.into_result().unwrap_err(), "quota exceeded");
    }
}
