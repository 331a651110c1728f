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

//! Radio provider abstraction.
//!
//! The controller talks to the Bluetooth stack only through these traits.
//! [`super::simulated`] provides an in-process implementation and, with the
//! `bluez` feature, [`super::bluez`] drives a real adapter.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::devices::Peer;

/// Errors reported by a radio provider.
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Radio is disabled")]
    Disabled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Endpoint closed")]
    Closed,

    #[error("No service {service} at {address}")]
    Unreachable { address: String, service: Uuid },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Radio backend error: {0}")]
    Backend(String),
}

/// Runtime authorizations the platform may withhold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Scanning for nearby devices.
    Scan,
    /// Opening connections and querying bonded devices.
    Connect,
}

/// ACL link change reported by the bonding ledger.
#[derive(Debug, Clone)]
pub struct BondStateEvent {
    pub peer: Peer,
    pub connected: bool,
}

/// An established byte-stream connection.
///
/// `close` must make pending and future reads and writes fail.
#[async_trait]
pub trait RadioSocket: Send + Sync {
    /// Read the next chunk. Returns the number of bytes written into `buf`.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RadioError>;

    /// Write one chunk.
    async fn write(&self, data: &[u8]) -> Result<(), RadioError>;

    /// Close the connection.
    fn close(&self);

    /// Check whether the connection is still open.
    fn is_open(&self) -> bool;

    /// The remote peer.
    fn peer(&self) -> &Peer;
}

/// A listening endpoint for one service.
#[async_trait]
pub trait RadioListener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self, timeout: Duration) -> Result<Arc<dyn RadioSocket>, RadioError>;

    /// Stop accepting. A pending `accept` fails with [`RadioError::Closed`].
    fn close(&self);
}

/// A Bluetooth adapter.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Check whether the adapter is powered.
    async fn is_enabled(&self) -> bool;

    /// Check whether the given authorization is held.
    fn is_authorized(&self, authorization: Authorization) -> bool;

    /// Name this adapter is visible under.
    async fn local_name(&self) -> Option<String>;

    /// Devices bonded with this adapter.
    async fn bonded_peers(&self) -> Result<Vec<Peer>, RadioError>;

    /// Start broadcasting discovery.
    async fn start_discovery(&self) -> Result<(), RadioError>;

    /// Stop broadcasting discovery.
    async fn stop_discovery(&self) -> Result<(), RadioError>;

    /// Open a listening endpoint for `service`.
    async fn listen(&self, service: Uuid) -> Result<Arc<dyn RadioListener>, RadioError>;

    /// Connect to `service` on the device at `address`.
    async fn dial(&self, address: &str, service: Uuid) -> Result<Arc<dyn RadioSocket>, RadioError>;

    /// Subscribe to devices found by discovery.
    fn discovered_events(&self) -> broadcast::Receiver<Peer>;

    /// Subscribe to ACL connect/disconnect events.
    fn bond_state_events(&self) -> broadcast::Receiver<BondStateEvent>;
}

/// One-way closed flag that pending operations can wait on.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once closed.
    pub async fn closed(&self) {
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Handle for a running event subscription.
///
/// The forwarding task runs until [`Subscription::cancel`] is called, the
/// handle is dropped, or the source closes.
pub struct Subscription {
    name: &'static str,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Forward every event from `rx` to `handler` on a new task.
    pub fn spawn<T, F, Fut>(name: &'static str, mut rx: broadcast::Receiver<T>, mut handler: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Subscription {} missed {} events", name, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Subscription {} source closed", name);
                        break;
                    }
                }
            }
        });

        Self { name, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop forwarding events.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
