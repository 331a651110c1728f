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

//! In-process radio simulator.
//!
//! Several [`SimRadio`] devices share one [`SimNetwork`]. They can discover
//! each other, listen, dial and exchange byte chunks entirely in memory.
//! One `write` arrives as one `read`, like an RFCOMM stream under light load.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::radio::{
    Authorization, BondStateEvent, CloseSignal, Radio, RadioError, RadioListener, RadioSocket,
};
use crate::devices::Peer;

type ListenerKey = (String, Uuid);

struct Registration {
    id: u64,
    conn_tx: mpsc::Sender<Arc<SimSocket>>,
}

/// The shared medium all simulated devices live on.
pub struct SimNetwork {
    devices: Mutex<Vec<Peer>>,
    listeners: Mutex<HashMap<ListenerKey, Registration>>,
    next_listener_id: AtomicU64,
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Add a powered, fully authorized device to the network.
    pub fn create_radio(self: &Arc<Self>, name: &str, address: &str) -> Arc<SimRadio> {
        let identity = Peer::named(name, address);
        self.devices.lock().push(identity.clone());

        let (discovered_tx, _) = broadcast::channel(64);
        let (bond_tx, _) = broadcast::channel(64);

        Arc::new(SimRadio {
            network: Arc::clone(self),
            identity,
            enabled: AtomicBool::new(true),
            scan_authorized: AtomicBool::new(true),
            connect_authorized: AtomicBool::new(true),
            bonded: Mutex::new(Vec::new()),
            discovering: AtomicBool::new(false),
            discovery_starts: AtomicUsize::new(0),
            discovery_stops: AtomicUsize::new(0),
            dial_latency: Mutex::new(Duration::ZERO),
            discovered_tx,
            bond_tx,
        })
    }

    fn identity_of(&self, address: &str) -> Peer {
        self.devices
            .lock()
            .iter()
            .find(|peer| peer.address().eq_ignore_ascii_case(address))
            .cloned()
            .unwrap_or_else(|| Peer::new(None, address))
    }

    fn unregister(&self, key: &ListenerKey, id: u64) {
        let mut listeners = self.listeners.lock();
        if listeners.get(key).map(|reg| reg.id) == Some(id) {
            listeners.remove(key);
        }
    }
}

/// A simulated Bluetooth adapter.
pub struct SimRadio {
    network: Arc<SimNetwork>,
    identity: Peer,
    enabled: AtomicBool,
    scan_authorized: AtomicBool,
    connect_authorized: AtomicBool,
    bonded: Mutex<Vec<Peer>>,
    discovering: AtomicBool,
    discovery_starts: AtomicUsize,
    discovery_stops: AtomicUsize,
    dial_latency: Mutex<Duration>,
    discovered_tx: broadcast::Sender<Peer>,
    bond_tx: broadcast::Sender<BondStateEvent>,
}

impl SimRadio {
    /// This device as seen by others.
    pub fn identity(&self) -> &Peer {
        &self.identity
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_authorized(&self, authorization: Authorization, granted: bool) {
        match authorization {
            Authorization::Scan => self.scan_authorized.store(granted, Ordering::SeqCst),
            Authorization::Connect => self.connect_authorized.store(granted, Ordering::SeqCst),
        }
    }

    pub fn set_bonded(&self, peers: Vec<Peer>) {
        *self.bonded.lock() = peers;
    }

    /// Delay applied to every dial before it reaches the remote listener.
    pub fn set_dial_latency(&self, latency: Duration) {
        *self.dial_latency.lock() = latency;
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    pub fn discovery_starts(&self) -> usize {
        self.discovery_starts.load(Ordering::SeqCst)
    }

    pub fn discovery_stops(&self) -> usize {
        self.discovery_stops.load(Ordering::SeqCst)
    }

    /// Check whether anything is listening for `service` on this device.
    pub fn is_listening(&self, service: Uuid) -> bool {
        self.network
            .listeners
            .lock()
            .contains_key(&(self.identity.address().to_string(), service))
    }

    /// Report a device found by discovery.
    pub fn announce(&self, peer: Peer) {
        let _ = self.discovered_tx.send(peer);
    }

    /// Report an ACL link change from the bonding ledger.
    pub fn emit_bond_state(&self, peer: Peer, connected: bool) {
        let _ = self.bond_tx.send(BondStateEvent { peer, connected });
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_authorized(&self, authorization: Authorization) -> bool {
        match authorization {
            Authorization::Scan => self.scan_authorized.load(Ordering::SeqCst),
            Authorization::Connect => self.connect_authorized.load(Ordering::SeqCst),
        }
    }

    async fn local_name(&self) -> Option<String> {
        self.identity.name().map(str::to_string)
    }

    async fn bonded_peers(&self) -> Result<Vec<Peer>, RadioError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(RadioError::Disabled);
        }
        Ok(self.bonded.lock().clone())
    }

    async fn start_discovery(&self) -> Result<(), RadioError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(RadioError::Disabled);
        }
        self.discovering.store(true, Ordering::SeqCst);
        self.discovery_starts.fetch_add(1, Ordering::SeqCst);

        let others: Vec<Peer> = self
            .network
            .devices
            .lock()
            .iter()
            .filter(|peer| **peer != self.identity)
            .cloned()
            .collect();
        for peer in others {
            let _ = self.discovered_tx.send(peer);
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        self.discovering.store(false, Ordering::SeqCst);
        self.discovery_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn listen(&self, service: Uuid) -> Result<Arc<dyn RadioListener>, RadioError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(RadioError::Disabled);
        }

        let key = (self.identity.address().to_string(), service);
        let id = self.network.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (conn_tx, conn_rx) = mpsc::channel(4);
        self.network
            .listeners
            .lock()
            .insert(key.clone(), Registration { id, conn_tx });
        debug!("Simulated listener {} on {:?}", id, key);

        Ok(Arc::new(SimListener {
            network: Arc::clone(&self.network),
            key,
            id,
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            closed: CloseSignal::new(),
        }))
    }

    async fn dial(&self, address: &str, service: Uuid) -> Result<Arc<dyn RadioSocket>, RadioError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(RadioError::Disabled);
        }

        let latency = *self.dial_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let key = (address.to_uppercase(), service);
        let conn_tx = self
            .network
            .listeners
            .lock()
            .get(&key)
            .map(|reg| reg.conn_tx.clone())
            .ok_or_else(|| RadioError::Unreachable {
                address: address.to_string(),
                service,
            })?;

        let remote = self.network.identity_of(address);
        let (local_end, remote_end) = SimSocket::pair(remote, self.identity.clone());

        conn_tx
            .try_send(Arc::new(remote_end))
            .map_err(|_| RadioError::Unreachable {
                address: address.to_string(),
                service,
            })?;

        Ok(Arc::new(local_end))
    }

    fn discovered_events(&self) -> broadcast::Receiver<Peer> {
        self.discovered_tx.subscribe()
    }

    fn bond_state_events(&self) -> broadcast::Receiver<BondStateEvent> {
        self.bond_tx.subscribe()
    }
}

/// A simulated listening endpoint.
pub struct SimListener {
    network: Arc<SimNetwork>,
    key: ListenerKey,
    id: u64,
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<SimSocket>>>,
    closed: CloseSignal,
}

#[async_trait]
impl RadioListener for SimListener {
    async fn accept(&self, timeout: Duration) -> Result<Arc<dyn RadioSocket>, RadioError> {
        if self.closed.is_closed() {
            return Err(RadioError::Closed);
        }

        let mut conn_rx = self.conn_rx.lock().await;
        tokio::select! {
            conn = conn_rx.recv() => match conn {
                Some(socket) => Ok(socket as Arc<dyn RadioSocket>),
                None => Err(RadioError::Closed),
            },
            _ = self.closed.closed() => Err(RadioError::Closed),
            _ = tokio::time::sleep(timeout) => Err(RadioError::Timeout),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            self.network.unregister(&self.key, self.id);
            debug!("Simulated listener {} closed", self.id);
        }
    }
}

impl Drop for SimListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// One end of a simulated connection.
pub struct SimSocket {
    peer: Peer,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
    closed: CloseSignal,
}

impl SimSocket {
    /// Create two connected ends. The first end talks to `first_peer`.
    fn pair(first_peer: Peer, second_peer: Peer) -> (SimSocket, SimSocket) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();

        let a = SimSocket {
            peer: first_peer,
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_a),
            leftover: Mutex::new(Vec::new()),
            closed: CloseSignal::new(),
        };
        let b = SimSocket {
            peer: second_peer,
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_b),
            leftover: Mutex::new(Vec::new()),
            closed: CloseSignal::new(),
        };
        (a, b)
    }

    fn take_leftover(&self, buf: &mut [u8]) -> Option<usize> {
        let mut leftover = self.leftover.lock();
        if leftover.is_empty() {
            return None;
        }
        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Some(n)
    }
}

#[async_trait]
impl RadioSocket for SimSocket {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RadioError> {
        if self.closed.is_closed() {
            return Err(RadioError::Closed);
        }
        if let Some(n) = self.take_leftover(buf) {
            return Ok(n);
        }

        let mut rx = self.rx.lock().await;
        let chunk = tokio::select! {
            chunk = rx.recv() => chunk,
            _ = self.closed.closed() => return Err(RadioError::Closed),
        };

        match chunk {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.leftover.lock().extend_from_slice(&chunk[n..]);
                }
                Ok(n)
            }
            None => Err(RadioError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "remote closed the connection",
            ))),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), RadioError> {
        if self.closed.is_closed() {
            return Err(RadioError::Closed);
        }
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| {
                RadioError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "remote closed the connection",
                ))
            }),
            None => Err(RadioError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            self.tx.lock().take();
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_closed()
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.close();
    }
}
