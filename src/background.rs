//! Messaging channel between the UI store and the background controller.
//!
//! The controller runs as its own task and receives JSON-encoded messages,
//! each paired with a reply slot that stays open until the acknowledgement
//! is sent. Messages are handled one at a time in arrival order.

use crate::config::{ChannelConfig, MockRulesConfig};
use crate::controller::{ControllerError, ReconcileSummary, RuleController};
use crate::host::RedirectHost;
use crate::protocol::{Ack, Message};
use crate::storage::KeyValueStorage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message delivery failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("background controller is not running")]
    Closed,
    #[error("background controller dropped the request without answering")]
    NoResponse,
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("malformed acknowledgement: {0}")]
    MalformedAck(serde_json::Error),
}

struct Envelope {
    payload: Value,
    reply: oneshot::Sender<Value>,
}

/// Sending side of the channel. Cheap to clone; one per UI context.
#[derive(Clone)]
pub struct BackgroundClient {
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
}

impl BackgroundClient {
    /// Send a message and wait for its acknowledgement.
    pub async fn send(&self, message: &Message) -> Result<Ack, ChannelError> {
        let payload = serde_json::to_value(message).map_err(ChannelError::Encode)?;
        self.send_value(payload).await
    }

    /// Send a raw JSON message and wait for its acknowledgement.
    pub async fn send_value(&self, payload: Value) -> Result<Ack, ChannelError> {
        let round_trip = async move {
            let (reply, response) = oneshot::channel();
            self.tx
                .send(Envelope { payload, reply })
                .await
                .map_err(|_| ChannelError::Closed)?;
            let value = response.await.map_err(|_| ChannelError::NoResponse)?;
            serde_json::from_value::<Ack>(value).map_err(ChannelError::MalformedAck)
        };

        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| ChannelError::Timeout(self.timeout))?
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Spawn the controller's message loop.
///
/// The loop ends once every [`BackgroundClient`] has been dropped.
pub fn spawn(
    controller: Arc<RuleController>,
    config: &ChannelConfig,
) -> (BackgroundClient, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(config.capacity);

    let handle = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let ack = controller.handle_value(envelope.payload).await;
            let value = match serde_json::to_value(&ack) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Failed to encode acknowledgement");
                    continue;
                }
            };
            if envelope.reply.send(value).is_err() {
                debug!("Sender went away before the acknowledgement");
            }
        }
        info!("Background message loop stopped");
    });

    let client = BackgroundClient {
        tx,
        timeout: config.ack_timeout(),
    };
    (client, handle)
}

/// A running background context.
pub struct Background {
    pub controller: Arc<RuleController>,
    pub client: BackgroundClient,
    pub handle: JoinHandle<()>,
    pub reconciled: ReconcileSummary,
}

impl Background {
    /// Start the background context: reconcile the host table with storage,
    /// then begin listening for messages.
    pub async fn start(
        host: Arc<dyn RedirectHost>,
        storage: &dyn KeyValueStorage,
        config: &MockRulesConfig,
    ) -> Result<Self, ControllerError> {
        let controller = Arc::new(
            RuleController::new(host, config.host.redirect_encoding)
                .with_operation_logging(config.settings.log_operations),
        );
        let reconciled = controller.reconcile(storage, &config.storage.key).await?;
        let (client, handle) = spawn(controller.clone(), &config.channel);

        Ok(Self {
            controller,
            client,
            handle,
            reconciled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{DynamicRulesUpdate, RedirectDirective, RedirectEncoding};
    use crate::host::{HostError, InMemoryHost};
    use crate::rule::{HttpMethod, Rule, RuleDraft};
    use crate::storage::{save_rules, MemoryStorage, RULES_KEY};
    use async_trait::async_trait;

    struct StalledHost;

    #[async_trait]
    impl RedirectHost for StalledHost {
        async fn update_dynamic_rules(&self, _update: DynamicRulesUpdate) -> Result<(), HostError> {
            std::future::pending().await
        }

        async fn get_dynamic_rules(&self) -> Result<Vec<RedirectDirective>, HostError> {
            Ok(Vec::new())
        }
    }

    fn rule(id: u32) -> Rule {
        Rule::from_draft(id, RuleDraft::new("/api", HttpMethod::Get, "{}"))
    }

    fn channel_config(ack_timeout_ms: u64) -> ChannelConfig {
        ChannelConfig {
            ack_timeout_ms,
            capacity: 4,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let host = Arc::new(InMemoryHost::default());
        let controller = Arc::new(RuleController::new(host.clone(), RedirectEncoding::Plain));
        let (client, _handle) = spawn(controller, &channel_config(1000));

        let ack = client
            .send(&Message::AddDynamicRules(vec![rule(1)]))
            .await
            .unwrap();
        assert!(ack.is_ok());
        assert_eq!(host.active_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_messages_applied_in_order() {
        let host = Arc::new(InMemoryHost::default());
        let controller = Arc::new(RuleController::new(host.clone(), RedirectEncoding::Plain));
        let (client, _handle) = spawn(controller, &channel_config(1000));

        let mut disabled = rule(1);
        disabled.enabled = false;
        let first = Message::AddDynamicRules(vec![rule(1)]);
        let second = Message::UpdateDynamicRules(vec![disabled]);
        let third = Message::AddDynamicRules(vec![rule(2)]);
        let (a, b, c) = tokio::join!(
            client.send(&first),
            client.send(&second),
            client.send(&third),
        );
        assert!(a.unwrap().is_ok() && b.unwrap().is_ok() && c.unwrap().is_ok());
        assert_eq!(host.active_ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_raw_unknown_message_gets_failed_ack() {
        let host = Arc::new(InMemoryHost::default());
        let controller = Arc::new(RuleController::new(host, RedirectEncoding::Plain));
        let (client, _handle) = spawn(controller, &channel_config(1000));

        let ack = client
            .send_value(serde_json::json!({"type": "nope"}))
            .await
            .unwrap();
        assert_eq!(ack.status, crate::protocol::STATUS_FAILED);
    }

    #[tokio::test]
    async fn test_stalled_host_times_out() {
        let controller = Arc::new(RuleController::new(
            Arc::new(StalledHost),
            RedirectEncoding::Plain,
        ));
        let (client, _handle) = spawn(controller, &channel_config(50));

        let err = client
            .send(&Message::AddDynamicRules(vec![rule(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let host = Arc::new(InMemoryHost::default());
        let controller = Arc::new(RuleController::new(host, RedirectEncoding::Plain));
        let (client, handle) = spawn(controller, &channel_config(1000));
        handle.abort();
        let _ = handle.await;

        let err = client
            .send(&Message::RemoveDynamicRules(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed | ChannelError::NoResponse));
    }

    #[tokio::test]
    async fn test_start_reconciles_before_listening() {
        let host = Arc::new(InMemoryHost::default());
        let storage = MemoryStorage::new();
        let mut off = rule(2);
        off.enabled = false;
        save_rules(&storage, RULES_KEY, &[rule(1), off, rule(3)])
            .await
            .unwrap();

        let background = Background::start(host.clone(), &storage, &MockRulesConfig::default())
            .await
            .unwrap();
        assert_eq!(background.reconciled.active, 2);
        assert_eq!(host.active_ids(), vec![1, 3]);

        let ack = background
            .client
            .send(&Message::RemoveDynamicRules(vec![1]))
            .await
            .unwrap();
        assert!(ack.is_ok());
        assert_eq!(host.active_ids(), vec![3]);
    }
}
