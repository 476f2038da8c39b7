/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use crate::peer::IceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Environment-supplied call configuration, read once at session start.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct CallConfig {
    /// STUN server URI. A public default is used when unset.
    pub stun_url: Option<String>,
    /// Optional TURN URI (e.g. `turns:turn.example:5349`). Omitted from
    /// candidate gathering when unset or when credentials are incomplete.
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Seconds to wait for a subscribe acknowledgment on ring/in-call topics.
    pub subscribe_timeout_secs: Option<u64>,
    /// Caller-side seconds to wait for an answer or transport connect.
    pub connect_timeout_secs: Option<u64>,
    /// Callee-side seconds to wait for the initial offer.
    pub offer_timeout_secs: Option<u64>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_url: Some(DEFAULT_STUN_URL.to_string()),
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            subscribe_timeout_secs: Some(8),
            connect_timeout_secs: Some(30),
            offer_timeout_secs: Some(60),
        }
    }
}

impl CallConfig {
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self
            .stun_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STUN_URL.to_string());
        let mut servers = vec![IceServer {
            urls: vec![stun],
            username: String::new(),
            credential: String::new(),
        }];
        if let (Some(url), Some(user), Some(pass)) = (
            self.turn_url.as_deref().filter(|s| !s.trim().is_empty()),
            self.turn_username.as_deref().filter(|s| !s.trim().is_empty()),
            self.turn_credential.as_deref().filter(|s| !s.trim().is_empty()),
        ) {
            servers.push(IceServer {
                urls: vec![url.to_string()],
                username: user.to_string(),
                credential: pass.to_string(),
            });
        }
        servers
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs.unwrap_or(8).clamp(2, 30))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs.unwrap_or(60).clamp(10, 300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reference_values() {
        let cfg = CallConfig::default();
        assert_eq!(cfg.subscribe_timeout(), Duration::from_secs(8));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.offer_timeout(), Duration::from_secs(60));
        let servers = cfg.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
    }

    #[test]
    fn turn_requires_complete_credentials() {
        let mut cfg = CallConfig {
            turn_url: Some("turns:turn.example:5349".into()),
            ..CallConfig::default()
        };
        assert_eq!(cfg.ice_servers().len(), 1, "url alone must not add TURN");

        cfg.turn_username = Some("care".into());
        cfg.turn_credential = Some("s3cret".into());
        let servers = cfg.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "care");
    }

    #[test]
    fn out_of_range_timeouts_are_clamped() {
        let cfg = CallConfig {
            connect_timeout_secs: Some(1),
            offer_timeout_secs: Some(100_000),
            ..CallConfig::default()
        };
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.offer_timeout(), Duration::from_secs(300));
    }
}
