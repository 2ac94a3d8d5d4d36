//! Background rule controller.
//!
//! The only writer of the host redirect table. Translates rules into
//! directives, applies them through [`RedirectHost`], and answers the
//! store's messages with an [`Ack`] once the host call has settled.

use crate::directive::{DynamicRulesUpdate, RedirectDirective, RedirectEncoding};
use crate::host::{HostError, RedirectHost};
use crate::protocol::{Ack, Message};
use crate::rule::{Rule, RuleId};
use crate::storage::{load_rules, KeyValueStorage, StorageError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Controller failures.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("failed to read persisted rules: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid rule {id}: {reason}")]
    InvalidRule { id: RuleId, reason: String },
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Rules found in storage
    pub persisted: usize,
    /// Ids cleared from the host: every persisted id plus any orphaned directive
    pub removed: usize,
    /// Directives re-added (enabled rules)
    pub active: usize,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub messages_total: u64,
    pub messages_failed: u64,
}

/// Background Rule Controller.
pub struct RuleController {
    host: Arc<dyn RedirectHost>,
    encoding: RedirectEncoding,
    log_operations: bool,
    /// Serializes every host table mutation
    queue: Mutex<()>,
    messages_total: AtomicU64,
    messages_failed: AtomicU64,
}

impl RuleController {
    /// Create a controller over `host`.
    pub fn new(host: Arc<dyn RedirectHost>, encoding: RedirectEncoding) -> Self {
        Self {
            host,
            encoding,
            log_operations: true,
            queue: Mutex::new(()),
            messages_total: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
        }
    }

    /// Toggle per-operation logging.
    pub fn with_operation_logging(mut self, enabled: bool) -> Self {
        self.log_operations = enabled;
        self
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            messages_total: self.messages_total.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }

    /// Materialize redirects for `rules`.
    ///
    /// Ids already present in the host are replaced, never duplicated.
    /// Disabled rules produce no directive.
    pub async fn add_rules(&self, rules: &[Rule]) -> Result<(), ControllerError> {
        if rules.is_empty() {
            return Ok(());
        }
        self.replace(rules).await?;
        if self.log_operations {
            info!(ids = ?ids_of(rules), "Added mock rules");
        }
        Ok(())
    }

    /// Remove the redirects for `ids`. Unknown ids are ignored.
    pub async fn remove_rules(&self, ids: &[RuleId]) -> Result<(), ControllerError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.apply(DynamicRulesUpdate {
            remove_rule_ids: ids.to_vec(),
            add_rules: Vec::new(),
        })
        .await?;
        if self.log_operations {
            info!(ids = ?ids, "Removed mock rules");
        }
        Ok(())
    }

    /// Remove then re-add the redirects for `rules`; only enabled rules come back.
    pub async fn update_rules(&self, rules: &[Rule]) -> Result<(), ControllerError> {
        if rules.is_empty() {
            return Ok(());
        }
        self.replace(rules).await?;
        if self.log_operations {
            info!(
                ids = ?ids_of(rules),
                enabled = rules.iter().filter(|r| r.enabled).count(),
                "Updated mock rules"
            );
        }
        Ok(())
    }

    /// Make the host table mirror the enabled rules persisted under `key`.
    ///
    /// Clears every persisted id and every directive currently in the host,
    /// so stale directives from an earlier session do not survive.
    pub async fn reconcile(
        &self,
        storage: &dyn KeyValueStorage,
        key: &str,
    ) -> Result<ReconcileSummary, ControllerError> {
        let persisted = load_rules(storage, key).await?;
        let current = self.host.get_dynamic_rules().await?;

        let mut stale: BTreeSet<RuleId> = persisted.iter().map(|r| r.id).collect();
        stale.extend(current.iter().map(|d| d.id));

        let summary = ReconcileSummary {
            persisted: persisted.len(),
            removed: stale.len(),
            active: persisted.iter().filter(|r| r.enabled).count(),
        };
        if stale.is_empty() {
            info!("No persisted mock rules, host table left empty");
            return Ok(summary);
        }

        let add_rules = self.directives(&persisted)?;
        self.apply(DynamicRulesUpdate {
            remove_rule_ids: stale.into_iter().collect(),
            add_rules,
        })
        .await?;

        info!(
            persisted = summary.persisted,
            removed = summary.removed,
            active = summary.active,
            "Reconciled host redirect table with persisted rules"
        );
        Ok(summary)
    }

    /// Route a message to the matching operation and build its acknowledgement.
    pub async fn handle(&self, message: Message) -> Ack {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        debug!(kind = message.kind(), items = message.len(), "Received message");

        let result = match &message {
            Message::AddDynamicRules(rules) => self.add_rules(rules).await,
            Message::RemoveDynamicRules(ids) => self.remove_rules(ids).await,
            Message::UpdateDynamicRules(rules) => self.update_rules(rules).await,
        };

        match result {
            Ok(()) => Ack::ok(),
            Err(e) => {
                self.messages_failed.fetch_add(1, Ordering::Relaxed);
                warn!(kind = message.kind(), error = %e, "Rejected message");
                Ack::failed(e.to_string())
            }
        }
    }

    /// Decode a raw message and handle it. Undecodable messages get a failed ack.
    pub async fn handle_value(&self, value: serde_json::Value) -> Ack {
        match serde_json::from_value::<Message>(value) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                self.messages_total.fetch_add(1, Ordering::Relaxed);
                self.messages_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Unrecognized message");
                Ack::failed(format!("unrecognized message: {}", e))
            }
        }
    }

    async fn replace(&self, rules: &[Rule]) -> Result<(), ControllerError> {
        let add_rules = self.directives(rules)?;
        self.apply(DynamicRulesUpdate {
            remove_rule_ids: ids_of(rules),
            add_rules,
        })
        .await
    }

    fn directives(&self, rules: &[Rule]) -> Result<Vec<RedirectDirective>, ControllerError> {
        rules
            .iter()
            .filter(|rule| rule.enabled)
            .map(|rule| -> Result<RedirectDirective, ControllerError> {
                rule.validate()
                    .map_err(|reason| ControllerError::InvalidRule {
                        id: rule.id,
                        reason,
                    })?;
                Ok(RedirectDirective::from_rule(rule, self.encoding))
            })
            .collect()
    }

    async fn apply(&self, update: DynamicRulesUpdate) -> Result<(), ControllerError> {
        let _turn = self.queue.lock().await;
        debug!(
            remove = update.remove_rule_ids.len(),
            add = update.add_rules.len(),
            "Updating host redirect table"
        );
        self.host.update_dynamic_rules(update).await?;
        Ok(())
    }
}

fn ids_of(rules: &[Rule]) -> Vec<RuleId> {
    let mut seen = BTreeSet::new();
    rules
        .iter()
        .map(|r| r.id)
        .filter(|id| seen.insert(*id))
        .collect()
}
