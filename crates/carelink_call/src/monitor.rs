/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Maps raw link/transport state changes onto session-level outcomes.
//!
//! Transport (ICE) failure gets one in-place restart attempt; overall
//! link failure is terminal. The monitor only observes; acting on a
//! verdict (closing, re-signaling) stays with the session.

use tracing::{debug, warn};

use crate::peer::{IceState, LinkState};

/// What the session should do about a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Nothing,
    /// The link is negotiating; reflect `Connecting`.
    Connecting,
    /// Media path is up; cancel the pending timeout, start the level meter.
    Connected,
    /// Transport failed but the link may still be saved: create a restart
    /// offer and re-signal it.
    RestartTransport,
    /// The link is gone. `reached_connected` picks `Ended` vs `Failed`.
    Terminal { reached_connected: bool },
}

#[derive(Debug, Default)]
pub struct LinkMonitor {
    reached_connected: bool,
    restart_attempted: bool,
    terminal: bool,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reached_connected(&self) -> bool {
        self.reached_connected
    }

    pub fn on_link_state(&mut self, state: LinkState) -> Verdict {
        if self.terminal {
            return Verdict::Nothing;
        }
        debug!(?state, "link state changed");
        match state {
            LinkState::Connecting => Verdict::Connecting,
            LinkState::Connected => {
                self.reached_connected = true;
                Verdict::Connected
            }
            LinkState::Failed | LinkState::Disconnected | LinkState::Closed => {
                self.terminal = true;
                Verdict::Terminal {
                    reached_connected: self.reached_connected,
                }
            }
            LinkState::New => Verdict::Nothing,
        }
    }

    pub fn on_ice_state(&mut self, state: IceState) -> Verdict {
        if self.terminal {
            return Verdict::Nothing;
        }
        debug!(?state, "transport state changed");
        match state {
            IceState::Connected | IceState::Completed => {
                self.reached_connected = true;
                Verdict::Connected
            }
            IceState::Failed => {
                if self.restart_attempted {
                    warn!("transport failed again after restart; leaving to link-level handling");
                    Verdict::Nothing
                } else {
                    self.restart_attempted = true;
                    Verdict::RestartTransport
                }
            }
            // Disconnected transport often self-heals with further
            // candidate pairs; the link-level state decides otherwise.
            _ => Verdict::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_connect_beats_link_connect_to_connected() {
        let mut m = LinkMonitor::new();
        assert_eq!(m.on_ice_state(IceState::Checking), Verdict::Nothing);
        assert_eq!(m.on_ice_state(IceState::Connected), Verdict::Connected);
        assert!(m.reached_connected());
        // Link-level confirmation afterwards is still a Connected verdict.
        assert_eq!(m.on_link_state(LinkState::Connected), Verdict::Connected);
    }

    #[test]
    fn transport_failure_gets_exactly_one_restart() {
        let mut m = LinkMonitor::new();
        assert_eq!(m.on_ice_state(IceState::Failed), Verdict::RestartTransport);
        assert_eq!(m.on_ice_state(IceState::Failed), Verdict::Nothing);
    }

    #[test]
    fn link_failure_before_connect_is_terminal_failed() {
        let mut m = LinkMonitor::new();
        assert_eq!(
            m.on_link_state(LinkState::Failed),
            Verdict::Terminal {
                reached_connected: false
            }
        );
        // Terminal is sticky; later events are ignored.
        assert_eq!(m.on_link_state(LinkState::Connected), Verdict::Nothing);
        assert_eq!(m.on_ice_state(IceState::Failed), Verdict::Nothing);
    }

    #[test]
    fn link_loss_after_connect_is_terminal_ended() {
        let mut m = LinkMonitor::new();
        m.on_link_state(LinkState::Connected);
        assert_eq!(
            m.on_link_state(LinkState::Disconnected),
            Verdict::Terminal {
                reached_connected: true
            }
        );
    }
}
