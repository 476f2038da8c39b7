/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Typed signaling over an abstract pub/sub relay.
//!
//! The relay itself (hosted realtime service, websocket bridge, ...) is a
//! collaborator behind `SignalingRelay`; this module owns topic naming,
//! subscribe-acknowledgment timeouts, JSON (de)coding and the
//! best-effort send policy. Dropped messages are not retried here: the
//! session's own timeouts already treat them as "peer never responded".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use carelink_protocol::{RingMessage, SignalMessage};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::SignalError;

/// In-call topic, one per conversation.
pub fn call_topic(conversation_id: &str) -> String {
    format!("call_{conversation_id}")
}

/// Personal topic for out-of-band ring/bye notifications.
pub fn user_topic(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// An acknowledged subscription. Dropping it leaves the topic.
pub struct RelaySubscription {
    pub messages: mpsc::Receiver<Value>,
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Resolves once the relay has acknowledged the subscription.
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription>;
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

/// The session's handle on one conversation's signaling topic.
pub struct CallChannel {
    topic: String,
    relay: Arc<dyn SignalingRelay>,
    messages: mpsc::Receiver<Value>,
}

impl std::fmt::Debug for CallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallChannel")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl CallChannel {
    /// Joins the conversation topic, failing with `SubscribeTimeout` if
    /// the relay does not acknowledge within the bounded wait.
    pub async fn join(
        relay: Arc<dyn SignalingRelay>,
        conversation_id: &str,
        timeout: Duration,
    ) -> Result<Self, SignalError> {
        let topic = call_topic(conversation_id);
        let sub = tokio::time::timeout(timeout, relay.subscribe(&topic))
            .await
            .map_err(|_| SignalError::SubscribeTimeout {
                topic: topic.clone(),
            })?
            .map_err(SignalError::Relay)?;
        debug!(topic = %topic, "joined signaling topic");
        Ok(Self {
            topic,
            relay,
            messages: sub.messages,
        })
    }

    /// Best-effort send: failures are logged and swallowed so a flaky
    /// relay can never crash the state machine mid-call.
    pub async fn send(&self, msg: &SignalMessage) {
        let payload = match serde_json::to_value(msg) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to encode signal");
                return;
            }
        };
        if let Err(e) = self.relay.publish(&self.topic, payload).await {
            warn!(topic = %self.topic, error = %e, "signal send failed");
        }
    }

    /// Next decodable message on the topic, self-sent ones included;
    /// echo suppression is the session's job. Returns `None` when the
    /// relay side of the subscription is gone.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let raw = self.messages.recv().await?;
            match serde_json::from_value::<SignalMessage>(raw) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "dropping undecodable signal");
                }
            }
        }
    }
}

/// Delivers an out-of-band notification to a peer's personal topic:
/// subscribe, publish, leave. A subscribe timeout here only aborts the
/// notification - the peer may already be on the call page listening on
/// the conversation topic.
pub async fn notify_user(
    relay: &Arc<dyn SignalingRelay>,
    user_id: &str,
    message: &RingMessage,
    timeout: Duration,
) -> Result<(), SignalError> {
    let topic = user_topic(user_id);
    let _sub = tokio::time::timeout(timeout, relay.subscribe(&topic))
        .await
        .map_err(|_| SignalError::SubscribeTimeout {
            topic: topic.clone(),
        })?
        .map_err(SignalError::Relay)?;
    let payload = serde_json::to_value(message)
        .context("encode ring message")
        .map_err(SignalError::Relay)?;
    relay
        .publish(&topic, payload)
        .await
        .map_err(SignalError::Relay)?;
    debug!(topic = %topic, "ring notification sent");
    Ok(())
}

/// Callee-side subscription on one's own personal topic, surfacing
/// incoming invites and out-of-band byes.
pub struct RingListener {
    messages: mpsc::Receiver<Value>,
}

impl RingListener {
    pub async fn listen(
        relay: Arc<dyn SignalingRelay>,
        self_id: &str,
        timeout: Duration,
    ) -> Result<Self, SignalError> {
        let topic = user_topic(self_id);
        let sub = tokio::time::timeout(timeout, relay.subscribe(&topic))
            .await
            .map_err(|_| SignalError::SubscribeTimeout {
                topic: topic.clone(),
            })?
            .map_err(SignalError::Relay)?;
        Ok(Self {
            messages: sub.messages,
        })
    }

    pub async fn recv(&mut self) -> Option<RingMessage> {
        loop {
            let raw = self.messages.recv().await?;
            match serde_json::from_value::<RingMessage>(raw) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable ring message");
                }
            }
        }
    }
}

/// In-process loopback relay: topic fan-out with immediate subscribe
/// acknowledgment. Used by tests and same-process demos; production
/// deployments supply their own `SignalingRelay`.
pub struct LocalRelay {
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl LocalRelay {
    const TOPIC_DEPTH: usize = 64;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
        })
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(Self::TOPIC_DEPTH).0)
            .clone()
    }
}

#[async_trait]
impl SignalingRelay for LocalRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription> {
        let mut rx = self.sender_for(topic).subscribe();
        let (tx, messages) = mpsc::channel(Self::TOPIC_DEPTH);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(v) => {
                        if tx.send(v).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "local relay subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(RelaySubscription { messages })
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        // A publish with no subscribers is not an error; signaling is
        // timeout-driven on the receiving side.
        let _ = self.sender_for(topic).send(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_protocol::CallMode;

    /// Relay whose subscribe never acknowledges.
    struct StalledRelay;

    #[async_trait]
    impl SignalingRelay for StalledRelay {
        async fn subscribe(&self, _topic: &str) -> Result<RelaySubscription> {
            std::future::pending().await
        }

        async fn publish(&self, _topic: &str, _payload: Value) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn channel_roundtrips_typed_messages_including_self_sent() {
        let relay = LocalRelay::new();
        let mut a = CallChannel::join(
            relay.clone() as Arc<dyn SignalingRelay>,
            "conv-1",
            Duration::from_secs(1),
        )
            .await
            .unwrap();
        let b = CallChannel::join(
            relay as Arc<dyn SignalingRelay>,
            "conv-1",
            Duration::from_secs(1),
        )
            .await
            .unwrap();

        b.send(&SignalMessage::Bye { from: "bob".into() }).await;
        let got = a.recv().await.unwrap();
        assert_eq!(got.from_id(), "bob");

        // The adapter does not suppress echo; the sender sees its own
        // message too.
        a.send(&SignalMessage::Bye { from: "alice".into() }).await;
        let echoed = a.recv().await.unwrap();
        assert_eq!(echoed.from_id(), "alice");
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped() {
        let relay = LocalRelay::new();
        let mut ch = CallChannel::join(
            relay.clone() as Arc<dyn SignalingRelay>,
            "conv-2",
            Duration::from_secs(1),
        )
            .await
            .unwrap();
        relay
            .publish(&call_topic("conv-2"), serde_json::json!({"kind": "mystery"}))
            .await
            .unwrap();
        ch.send(&SignalMessage::Bye { from: "x".into() }).await;
        assert_eq!(ch.recv().await.unwrap().from_id(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn join_times_out_without_acknowledgment() {
        let err = CallChannel::join(
            Arc::new(StalledRelay) as Arc<dyn SignalingRelay>,
            "conv-3",
            Duration::from_secs(8),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::SubscribeTimeout { .. }));
    }

    #[tokio::test]
    async fn ring_notification_reaches_the_personal_topic() {
        let relay = LocalRelay::new();
        let mut listener = RingListener::listen(
            relay.clone() as Arc<dyn SignalingRelay>,
            "callee-1",
            Duration::from_secs(1),
        )
            .await
            .unwrap();
        let invite = RingMessage::Invite {
            conversation_id: "conv-9".into(),
            from_id: "caller-1".into(),
            from_name: "Dr. Reyes".into(),
            mode: CallMode::Audio,
        };
        notify_user(
            &(relay as Arc<dyn SignalingRelay>),
            "callee-1",
            &invite,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        match listener.recv().await.unwrap() {
            RingMessage::Invite {
                conversation_id,
                from_name,
                ..
            } => {
                assert_eq!(conversation_id, "conv-9");
                assert_eq!(from_name, "Dr. Reyes");
            }
            other => panic!("unexpected ring message: {other:?}"),
        }
    }
}
