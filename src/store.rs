//! UI rule store.
//!
//! Holds the observable rule list the interface renders. Every change is
//! sent to the background controller first; the local list and persisted
//! storage only change after a successful acknowledgement. The store is the
//! only writer of persisted rules.

use crate::background::{BackgroundClient, ChannelError};
use crate::config::MockRulesConfig;
use crate::ids::IdAllocator;
use crate::protocol::Message;
use crate::rule::{normalized_mock, Rule, RuleDraft, RuleId, RulePatch};
use crate::storage::{load_rules, save_rules, KeyValueStorage, StorageError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Store failures. None of them leave the local list modified.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule store used before load()")]
    NotLoaded,
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("no rule with id {0}")]
    UnknownRule(RuleId),
    #[error("no free rule id left")]
    IdSpaceExhausted,
    #[error("background controller rejected the change: {0}")]
    Rejected(String),
    #[error("no acknowledgement from the background controller within {0:?}")]
    Timeout(Duration),
    #[error("message delivery failed: {0}")]
    Delivery(ChannelError),
    #[error("failed to persist rules: {0}")]
    Persistence(#[from] StorageError),
}

impl From<ChannelError> for StoreError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout(after) => StoreError::Timeout(after),
            other => StoreError::Delivery(other),
        }
    }
}

/// Observable, ack-gated rule list.
pub struct RuleStore {
    client: BackgroundClient,
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    ids: IdAllocator,
    normalize_mock: bool,
    rules: watch::Sender<Vec<Rule>>,
    loaded: OnceCell<()>,
    /// One mutation in flight at a time
    op_lock: Mutex<()>,
}

impl RuleStore {
    pub fn new(
        client: BackgroundClient,
        storage: Arc<dyn KeyValueStorage>,
        key: impl Into<String>,
    ) -> Self {
        let (rules, _) = watch::channel(Vec::new());
        Self {
            client,
            storage,
            key: key.into(),
            ids: IdAllocator::default(),
            normalize_mock: true,
            rules,
            loaded: OnceCell::new(),
            op_lock: Mutex::new(()),
        }
    }

    /// Create a store with settings from `config`.
    pub fn from_config(
        client: BackgroundClient,
        storage: Arc<dyn KeyValueStorage>,
        config: &MockRulesConfig,
    ) -> Self {
        let mut store = Self::new(client, storage, config.storage.key.clone());
        store.normalize_mock = config.settings.normalize_mock;
        store
    }

    /// Seed the list from storage. Runs once; later calls return the current list.
    pub async fn load(&self) -> Result<Vec<Rule>, StoreError> {
        self.loaded
            .get_or_try_init(|| async {
                let rules = load_rules(self.storage.as_ref(), &self.key).await?;
                info!(rules = rules.len(), key = %self.key, "Loaded persisted rules");
                self.rules.send_replace(rules);
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(self.rules())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Current rule list.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.borrow().clone()
    }

    /// Look up a rule by id.
    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.rules.borrow().iter().find(|r| r.id == id).cloned()
    }

    /// Watch the rule list; the receiver sees every committed change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Rule>> {
        self.rules.subscribe()
    }

    /// Create a rule with a fresh id.
    pub async fn add(&self, draft: RuleDraft) -> Result<Rule, StoreError> {
        self.ensure_loaded()?;
        draft.validate().map_err(StoreError::InvalidRule)?;
        let _op = self.op_lock.lock().await;

        let persisted = load_rules(self.storage.as_ref(), &self.key).await?;
        let mut taken: HashSet<RuleId> = persisted.iter().map(|r| r.id).collect();
        taken.extend(self.rules.borrow().iter().map(|r| r.id));
        let id = self
            .ids
            .allocate(&taken)
            .ok_or(StoreError::IdSpaceExhausted)?;

        let mut rule = Rule::from_draft(id, draft);
        if self.normalize_mock {
            rule.mock = normalized_mock(&rule.mock);
        }

        let revert = Message::RemoveDynamicRules(vec![id]);
        self.deliver(Message::AddDynamicRules(vec![rule.clone()]), &revert)
            .await?;

        let added = rule.clone();
        self.commit(
            move |rules| {
                rules.retain(|r| r.id != added.id);
                rules.push(added);
            },
            revert,
        )
        .await?;

        debug!(rule_id = id, path = %rule.path, "Rule added");
        Ok(rule)
    }

    /// Delete a rule.
    pub async fn remove(&self, id: RuleId) -> Result<(), StoreError> {
        self.ensure_loaded()?;
        let _op = self.op_lock.lock().await;
        let previous = self.get(id).ok_or(StoreError::UnknownRule(id))?;

        let revert = Message::AddDynamicRules(vec![previous]);
        self.deliver(Message::RemoveDynamicRules(vec![id]), &revert)
            .await?;
        self.commit(move |rules| rules.retain(|r| r.id != id), revert)
            .await?;

        debug!(rule_id = id, "Rule removed");
        Ok(())
    }

    /// Change fields of an existing rule.
    pub async fn update(&self, mut patch: RulePatch) -> Result<Rule, StoreError> {
        self.ensure_loaded()?;
        patch.validate().map_err(StoreError::InvalidRule)?;
        if self.normalize_mock {
            patch.mock = patch.mock.map(|mock| normalized_mock(&mock));
        }
        let _op = self.op_lock.lock().await;
        let previous = self.get(patch.id).ok_or(StoreError::UnknownRule(patch.id))?;

        let updated = previous.patched(&patch);
        if updated == previous {
            return Ok(updated);
        }

        let revert = Message::UpdateDynamicRules(vec![previous]);
        self.deliver(Message::UpdateDynamicRules(vec![updated.clone()]), &revert)
            .await?;

        let replacement = updated.clone();
        self.commit(
            move |rules| match rules.iter_mut().find(|r| r.id == replacement.id) {
                Some(slot) => *slot = replacement,
                None => rules.push(replacement),
            },
            revert,
        )
        .await?;

        debug!(rule_id = updated.id, enabled = updated.enabled, "Rule updated");
        Ok(updated)
    }

    fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(StoreError::NotLoaded)
        }
    }

    /// Send a change and wait for its acknowledgement.
    ///
    /// A message that times out is still queued and gets applied late, so
    /// `revert` is queued behind it before the timeout is reported.
    async fn deliver(&self, message: Message, revert: &Message) -> Result<(), StoreError> {
        match self.round_trip(message).await {
            Err(StoreError::Timeout(after)) => {
                warn!(kind = revert.kind(), "Queueing revert of timed-out change");
                if let Err(e) = self.round_trip(revert.clone()).await {
                    warn!(error = %e, "Reverting timed-out change failed");
                }
                Err(StoreError::Timeout(after))
            }
            other => other,
        }
    }

    async fn round_trip(&self, message: Message) -> Result<(), StoreError> {
        let kind = message.kind();
        let ack = self.client.send(&message).await.map_err(|e| {
            warn!(kind, error = %e, "Message to background controller failed");
            StoreError::from(e)
        })?;
        ack.into_result().map_err(|error| {
            warn!(kind, error = %error, "Background controller rejected change");
            StoreError::Rejected(error)
        })
    }

    /// Apply an acknowledged change to storage, then publish it.
    ///
    /// The persisted list is re-read so changes committed by other stores
    /// survive. If the write fails, `compensation` is sent to undo the host
    /// change and the local list stays as it was.
    async fn commit<F>(&self, mutate: F, compensation: Message) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<Rule>),
    {
        let persisted = async move {
            let mut rules = load_rules(self.storage.as_ref(), &self.key).await?;
            mutate(&mut rules);
            save_rules(self.storage.as_ref(), &self.key, &rules).await?;
            Ok::<_, StorageError>(rules)
        }
        .await;

        match persisted {
            Ok(rules) => {
                self.rules.send_replace(rules);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Persisting rules failed, reverting host change");
                if let Err(revert) = self.round_trip(compensation).await {
                    warn!(error = %revert, "Reverting host change failed");
                }
                Err(StoreError::Persistence(e))
            }
        }
    }
}
