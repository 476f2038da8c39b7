/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Call-history collaborator. Persistence lives with the host
//! application; the session only reports, fire-and-forget, and a tracker
//! failure must never affect an otherwise-healthy call.

use async_trait::async_trait;
use carelink_protocol::CallMode;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Initiated,
    Ringing,
    Connected,
    Ended,
    Missed,
    Declined,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub conversation_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub caller_name: String,
    pub callee_name: String,
    pub call_type: CallMode,
    pub status: CallPhase,
    pub started_at_ms: u64,
}

#[async_trait]
pub trait CallTracker: Send + Sync {
    async fn log_call_event(&self, record: &CallRecord) -> anyhow::Result<()>;
    async fn update_call_status(
        &self,
        conversation_id: &str,
        status: CallPhase,
    ) -> anyhow::Result<()>;
}

/// For hosts without history storage.
pub struct NullTracker;

#[async_trait]
impl CallTracker for NullTracker {
    async fn log_call_event(&self, _record: &CallRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_call_status(
        &self,
        _conversation_id: &str,
        _status: CallPhase,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Detached status update; tracker errors are logged and dropped.
pub fn track_status(
    tracker: std::sync::Arc<dyn CallTracker>,
    conversation_id: String,
    status: CallPhase,
) {
    tokio::spawn(async move {
        if let Err(e) = tracker.update_call_status(&conversation_id, status).await {
            warn!(conversation = %conversation_id, error = %e, "call status update failed");
        }
    });
}

/// Detached event log, same policy as `track_status`.
pub fn track_event(tracker: std::sync::Arc<dyn CallTracker>, record: CallRecord) {
    tokio::spawn(async move {
        if let Err(e) = tracker.log_call_event(&record).await {
            warn!(conversation = %record.conversation_id, error = %e, "call event log failed");
        }
    });
}
