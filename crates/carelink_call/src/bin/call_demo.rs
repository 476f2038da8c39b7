/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Loopback demo: a caller and a callee session in one process, signaling
//! over the in-memory relay and negotiating through real peer
//! connections on host candidates.
//!
//! ```sh
//! RUST_LOG=carelink_call=debug cargo run --bin call_demo
//! ```

use std::sync::Arc;

use carelink_call::config::CallConfig;
use carelink_call::history::NullTracker;
use carelink_call::media::NoDevices;
use carelink_call::metrics::CallMetrics;
use carelink_call::rtc::WebRtcFactory;
use carelink_call::session::{CallRole, CallSession, CallState, SessionParams};
use carelink_call::signaling::{LocalRelay, SignalingRelay};
use carelink_protocol::CallMode;
use tracing::info;

fn params(role: CallRole) -> SessionParams {
    let (self_id, peer_id) = match role {
        CallRole::Caller => ("staff-1", "patient-1"),
        CallRole::Callee => ("patient-1", "staff-1"),
    };
    SessionParams {
        conversation_id: "demo-conversation".to_string(),
        self_id: self_id.to_string(),
        self_name: self_id.to_string(),
        peer_id: peer_id.to_string(),
        peer_name: peer_id.to_string(),
        role,
        mode: CallMode::Audio,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let relay: Arc<dyn SignalingRelay> = LocalRelay::new();
    let metrics = Arc::new(CallMetrics::new());

    let callee = CallSession::start(
        params(CallRole::Callee),
        CallConfig::default(),
        relay.clone(),
        Arc::new(WebRtcFactory),
        Arc::new(NoDevices),
        Arc::new(NullTracker),
        metrics.clone(),
    )
    .await?;

    let caller = CallSession::start(
        params(CallRole::Caller),
        CallConfig::default(),
        relay,
        Arc::new(WebRtcFactory),
        Arc::new(NoDevices),
        Arc::new(NullTracker),
        metrics.clone(),
    )
    .await?;

    let mut watch = caller.watch();
    let connected = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        watch
            .wait_for(|s| s.state == CallState::Connected || s.state.is_terminal())
            .await
            .map(|s| s.clone())
    })
    .await;
    match connected {
        Ok(Ok(snapshot)) => info!(state = ?snapshot.state, reason = ?snapshot.reason, "caller settled"),
        other => info!(?other, "caller did not settle"),
    }

    caller.hang_up().await;
    let mut callee_watch = callee.watch();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        callee_watch.wait_for(|s| s.state.is_terminal()).await
    })
    .await;
    info!(
        signals_tx = metrics
            .signals_tx
            .load(std::sync::atomic::Ordering::Relaxed),
        signals_rx = metrics
            .signals_rx
            .load(std::sync::atomic::Ordering::Relaxed),
        "done"
    );
    Ok(())
}
