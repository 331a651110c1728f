// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Observable controller state.

use crate::bluetooth::Message;
use crate::devices::{DeviceDirectory, Peer};

/// Lifecycle of the connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Discovering,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "Idle",
            ConnectionStatus::Discovering => "Discovering...",
            ConnectionStatus::Listening => "Waiting for a peer...",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
        }
    }

    /// Whether a connection attempt or session is in progress.
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Listening | ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }
}

/// Snapshot of everything the controller exposes.
///
/// Published through a watch channel; observers never mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerState {
    /// Whether the radio was enabled at the last check.
    pub radio_enabled: bool,

    /// Current lifecycle status.
    pub status: ConnectionStatus,

    /// Whether a session transport is live.
    pub connected: bool,

    /// Remote side of the live session.
    pub session_peer: Option<Peer>,

    /// ACL link state last reported by the bonding ledger.
    pub bonded_link_up: bool,

    /// Discovered and bonded peers.
    pub devices: DeviceDirectory,

    /// Seconds left in the discovery cycle; `None` when not discovering.
    pub discovery_remaining_secs: Option<u32>,

    /// Messages exchanged in the current session.
    pub messages: Vec<Message>,
}

impl ControllerState {
    pub fn new(radio_enabled: bool) -> Self {
        Self {
            radio_enabled,
            status: ConnectionStatus::Idle,
            connected: false,
            session_peer: None,
            bonded_link_up: false,
            devices: DeviceDirectory::new(),
            discovery_remaining_secs: None,
            messages: Vec::new(),
        }
    }

    pub fn discovered_peers(&self) -> &[Peer] {
        self.devices.discovered()
    }

    pub fn bonded_peers(&self) -> &[Peer] {
        self.devices.bonded()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery_remaining_secs.is_some()
    }

    /// Clear every session-scoped field.
    pub fn clear_session(&mut self) {
        self.connected = false;
        self.session_peer = None;
        self.messages.clear();
        if self.status.is_engaged() {
            self.status = ConnectionStatus::Disconnected;
        }
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_session_resets_connection_fields() {
        let mut state = ControllerState::new(true);
        state.status = ConnectionStatus::Connected;
        state.connected = true;
        state.session_peer = Some(Peer::named("Phone-B", "AA:BB:CC:DD:EE:02"));
        state.messages.push(Message::local("Phone-A", "hi"));
        state.discovery_remaining_secs = Some(4);

        state.clear_session();

        assert!(!state.connected);
        assert!(state.session_peer.is_none());
        assert!(state.messages.is_empty());
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        // Discovery is independent of the session.
        assert_eq!(state.discovery_remaining_secs, Some(4));
    }

    #[test]
    fn test_clear_session_keeps_discovery_status() {
        let mut state = ControllerState::new(true);
        state.status = ConnectionStatus::Discovering;

        state.clear_session();
        assert_eq!(state.status, ConnectionStatus::Discovering);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(ConnectionStatus::Connected.as_str(), "Connected");
        assert!(!ConnectionStatus::Discovering.is_engaged());
        assert!(ConnectionStatus::Connecting.is_engaged());
    }
}
