/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide call counters, shared across sessions.
#[derive(Default)]
pub struct CallMetrics {
    pub signals_tx: AtomicU64,
    pub signals_rx: AtomicU64,
    pub ice_candidates_added: AtomicU64,
    pub ice_candidates_dropped: AtomicU64,
    pub sessions_started: AtomicU64,
    pub sessions_connected: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub transport_restarts: AtomicU64,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_tx_add(&self) {
        self.signals_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_rx_add(&self) {
        self.signals_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ice_added(&self) {
        self.ice_candidates_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ice_dropped(&self) {
        self.ice_candidates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_connected(&self) {
        self.sessions_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_restart(&self) {
        self.transport_restarts.fetch_add(1, Ordering::Relaxed);
    }
}
