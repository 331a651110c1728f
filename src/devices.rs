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

//! Remote peers and the in-memory device directory.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A remote Bluetooth device.
///
/// Peers are identified by their hardware address only; the display name is
/// informational and does not take part in equality.
#[derive(Debug, Clone)]
pub struct Peer {
    name: Option<String>,
    address: String,
}

impl Peer {
    /// Create a peer. The address is normalised to upper case.
    pub fn new(name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            name,
            address: address.into().to_uppercase(),
        }
    }

    /// Create a peer with a known display name.
    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(Some(name.into()), address)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Deduplicated sets of discovered and bonded peers.
///
/// Both sets keep first-seen order and never hold two peers with the same
/// address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDirectory {
    discovered: Vec<Peer>,
    bonded: Vec<Peer>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer seen during discovery.
    ///
    /// Returns `false` if a peer with the same address is already known; the
    /// existing entry is left untouched.
    pub fn record_discovered(&mut self, peer: Peer) -> bool {
        if self.discovered.contains(&peer) {
            return false;
        }
        self.discovered.push(peer);
        true
    }

    /// Replace the bonded set with a fresh snapshot from the radio.
    pub fn replace_bonded(&mut self, peers: impl IntoIterator<Item = Peer>) {
        let mut bonded: Vec<Peer> = Vec::new();
        for peer in peers {
            if !bonded.contains(&peer) {
                bonded.push(peer);
            }
        }
        self.bonded = bonded;
    }

    pub fn clear_discovered(&mut self) {
        self.discovered.clear();
    }

    pub fn discovered(&self) -> &[Peer] {
        &self.discovered
    }

    pub fn bonded(&self) -> &[Peer] {
        &self.bonded
    }

    pub fn is_bonded(&self, address: &str) -> bool {
        self.bonded
            .iter()
            .any(|peer| peer.address().eq_ignore_ascii_case(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_equality_ignores_name() {
        let a = Peer::named("Phone-A", "aa:bb:cc:dd:ee:01");
        let b = Peer::new(None, "AA:BB:CC:DD:EE:01");
        let c = Peer::named("Phone-A", "AA:BB:CC:DD:EE:02");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.address(), "AA:BB:CC:DD:EE:01");
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let peer = Peer::new(None, "AA:BB:CC:DD:EE:01");
        assert_eq!(peer.display_name(), "AA:BB:CC:DD:EE:01");
        assert_eq!(peer.to_string(), "AA:BB:CC:DD:EE:01");

        let peer = Peer::named("Phone-A", "AA:BB:CC:DD:EE:01");
        assert_eq!(peer.display_name(), "Phone-A");
        assert_eq!(peer.to_string(), "Phone-A (AA:BB:CC:DD:EE:01)");
    }

    #[test]
    fn test_record_discovered_is_idempotent() {
        let mut directory = DeviceDirectory::new();

        assert!(directory.record_discovered(Peer::named("Phone-A", "AA:BB:CC:DD:EE:01")));
        assert!(!directory.record_discovered(Peer::named("Renamed", "AA:BB:CC:DD:EE:01")));

        assert_eq!(directory.discovered().len(), 1);
        assert_eq!(directory.discovered()[0].name(), Some("Phone-A"));
    }

    #[test]
    fn test_replace_bonded_deduplicates() {
        let mut directory = DeviceDirectory::new();
        directory.replace_bonded(vec![Peer::named("Old", "11:11:11:11:11:11")]);

        directory.replace_bonded(vec![
            Peer::named("Phone-A", "AA:BB:CC:DD:EE:01"),
            Peer::named("Phone-A again", "AA:BB:CC:DD:EE:01"),
            Peer::named("Phone-B", "AA:BB:CC:DD:EE:02"),
        ]);

        assert_eq!(directory.bonded().len(), 2);
        assert!(directory.is_bonded("aa:bb:cc:dd:ee:02"));
        assert!(!directory.is_bonded("11:11:11:11:11:11"));
    }

    #[test]
    fn test_clear_discovered_keeps_bonded() {
        let mut directory = DeviceDirectory::new();
        directory.record_discovered(Peer::new(None, "AA:BB:CC:DD:EE:01"));
        directory.replace_bonded(vec![Peer::named("Phone-A", "AA:BB:CC:DD:EE:01")]);

        directory.clear_discovered();

        assert!(directory.discovered().is_empty());
        assert_eq!(directory.bonded().len(), 1);
    }
}
