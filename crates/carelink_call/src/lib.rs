/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod error;
pub mod history;
pub mod media;
pub mod metrics;
pub mod monitor;
pub mod peer;
pub mod rtc;
pub mod sdp;
pub mod session;
pub mod signaling;
