//! Mock API Redirect Rules
//!
//! Keeps a list of mock API rules (URL filter + HTTP method -> canned JSON
//! body) in sync with a host's declarative redirect table, so matching
//! requests are answered from a `data:` URI instead of the real backend.
//!
//! # Components
//!
//! - **Background controller** ([`RuleController`]): sole writer of the host
//!   redirect table. Handles `addDynamicRules`, `removeDynamicRules` and
//!   `updateDynamicRules` messages and reconciles the table with persisted
//!   rules at startup.
//! - **Rule store** ([`RuleStore`]): the observable list a UI renders. Sends
//!   each change to the controller and commits it locally and to storage
//!   only after a successful acknowledgement.
//!
//! # Example Configuration
//!
//! ```yaml
//! storage:
//!   path: mock-rules.json
//!   key: local:rules
//! host:
//!   redirect_encoding: plain
//! channel:
//!   ack_timeout_ms: 5000
//! ```

pub mod background;
pub mod config;
pub mod controller;
pub mod directive;
pub mod host;
pub mod ids;
pub mod protocol;
pub mod rule;
pub mod storage;
pub mod store;
pub mod url_filter;

pub use background::{Background, BackgroundClient};
pub use config::MockRulesConfig;
pub use controller::RuleController;
pub use host::{InMemoryHost, RedirectHost};
pub use protocol::{Ack, Message};
pub use rule::{HttpMethod, Rule, RuleDraft, RuleId, RulePatch};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use store::RuleStore;
