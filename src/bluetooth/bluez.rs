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

//! BlueZ radio backend.
//!
//! Both roles go through the RFCOMM profile API: listening registers a
//! server profile, dialing registers a client profile and asks the device
//! to connect it.

use async_trait::async_trait;
use bluer::rfcomm::stream::{OwnedReadHalf, OwnedWriteHalf};
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::constants::SERVICE_NAME;
use super::radio::{
    Authorization, BondStateEvent, CloseSignal, Radio, RadioError, RadioListener, RadioSocket,
};
use crate::devices::Peer;

type Profiles = Pin<Box<ProfileHandle>>;

impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        RadioError::Backend(e.to_string())
    }
}

fn chat_profile(service: Uuid, role: Role) -> Profile {
    Profile {
        uuid: service,
        name: Some(SERVICE_NAME.to_string()),
        role: Some(role),
        require_authentication: Some(false),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    }
}

async fn peer_for(adapter: &Adapter, address: Address) -> Peer {
    let name = match adapter.device(address) {
        Ok(device) => device.alias().await.ok(),
        Err(_) => None,
    };
    Peer::new(name, address.to_string())
}

/// Adapter owned through a BlueZ D-Bus session.
pub struct BluezRadio {
    session: Session,
    adapter: Adapter,
    discovery: Mutex<Option<JoinHandle<()>>>,
    link_monitor: JoinHandle<()>,
    discovered_tx: broadcast::Sender<Peer>,
    bond_tx: broadcast::Sender<BondStateEvent>,
}

impl BluezRadio {
    /// Connect to BlueZ and use the default adapter.
    pub async fn new() -> Result<Self, RadioError> {
        info!("Initializing BlueZ radio...");

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let (discovered_tx, _) = broadcast::channel(64);
        let (bond_tx, _) = broadcast::channel(64);
        let link_monitor = spawn_link_monitor(adapter.clone(), bond_tx.clone());

        Ok(Self {
            session,
            adapter,
            discovery: Mutex::new(None),
            link_monitor,
            discovered_tx,
            bond_tx,
        })
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        self.link_monitor.abort();
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
        }
    }
}

/// Link watcher tasks, at most one per device address.
#[derive(Default)]
struct LinkWatchers {
    tasks: JoinSet<()>,
    watched: HashMap<Address, AbortHandle>,
}

impl LinkWatchers {
    fn is_watching(&self, address: Address) -> bool {
        self.watched.contains_key(&address)
    }

    /// Run `watcher` for `address`. Returns `false` if one already runs.
    fn insert<F>(&mut self, address: Address, watcher: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_watching(address) {
            return false;
        }
        let handle = self.tasks.spawn(watcher);
        self.watched.insert(address, handle);
        true
    }

    fn remove(&mut self, address: Address) -> bool {
        match self.watched.remove(&address) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Report connect/disconnect of every known device.
fn spawn_link_monitor(adapter: Adapter, tx: broadcast::Sender<BondStateEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Link monitor unavailable: {}", e);
                return;
            }
        };
        let mut events = Box::pin(events);
        let mut watchers = LinkWatchers::default();

        if let Ok(addresses) = adapter.device_addresses().await {
            for address in addresses {
                watch_device(&adapter, address, &tx, &mut watchers);
            }
        }

        while let Some(event) = events.next().await {
            match event {
                AdapterEvent::DeviceAdded(address) => {
                    watch_device(&adapter, address, &tx, &mut watchers);
                }
                AdapterEvent::DeviceRemoved(address) => {
                    if watchers.remove(address) {
                        debug!("No longer watching {}", address);
                    }
                }
                _ => {}
            }
        }
    })
}

fn watch_device(
    adapter: &Adapter,
    address: Address,
    tx: &broadcast::Sender<BondStateEvent>,
    watchers: &mut LinkWatchers,
) {
    if watchers.is_watching(address) {
        return;
    }
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("Cannot watch {}: {}", address, e);
            return;
        }
    };
    let tx = tx.clone();

    watchers.insert(address, async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(_) => return,
        };
        let mut events = Box::pin(events);
        let name = device.alias().await.ok();

        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                let peer = Peer::new(name.clone(), address.to_string());
                let _ = tx.send(BondStateEvent { peer, connected });
            }
        }
    });
}

#[async_trait]
impl Radio for BluezRadio {
    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    fn is_authorized(&self, _authorization: Authorization) -> bool {
        // BlueZ access is governed by D-Bus policy, not runtime grants.
        true
    }

    async fn local_name(&self) -> Option<String> {
        self.adapter.alias().await.ok()
    }

    async fn bonded_peers(&self) -> Result<Vec<Peer>, RadioError> {
        let mut peers = Vec::new();

        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            if device.is_paired().await? {
                let name = device.alias().await.ok();
                peers.push(Peer::new(name, address.to_string()));
            }
        }

        Ok(peers)
    }

    async fn start_discovery(&self) -> Result<(), RadioError> {
        let events = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let tx = self.discovered_tx.clone();

        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    let _ = tx.send(peer_for(&adapter, address).await);
                }
            }
        });

        if let Some(previous) = self.discovery.lock().replace(task) {
            previous.abort();
        }
        info!("Adapter discovery started");
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
            info!("Adapter discovery stopped");
        }
        Ok(())
    }

    async fn listen(&self, service: Uuid) -> Result<Arc<dyn RadioListener>, RadioError> {
        if let Err(e) = self.adapter.set_discoverable(true).await {
            warn!("Could not make adapter discoverable: {}", e);
        }

        let profiles = self
            .session
            .register_profile(chat_profile(service, Role::Server))
            .await?;
        info!("RFCOMM profile {} registered for listening", service);

        Ok(Arc::new(BluezListener {
            adapter: self.adapter.clone(),
            profiles: tokio::sync::Mutex::new(Some(Box::pin(profiles))),
            closed: CloseSignal::new(),
        }))
    }

    async fn dial(&self, address: &str, service: Uuid) -> Result<Arc<dyn RadioSocket>, RadioError> {
        let unreachable = || RadioError::Unreachable {
            address: address.to_string(),
            service,
        };
        let target: Address = address.parse().map_err(|_| unreachable())?;

        let mut profiles: Profiles = Box::pin(
            self.session
                .register_profile(chat_profile(service, Role::Client))
                .await?,
        );
        let device = self.adapter.device(target)?;

        // The connection arrives through the profile while connect_profile
        // is still pending.
        let connect = device.connect_profile(&service);
        tokio::pin!(connect);
        let mut connecting = true;

        let request = loop {
            tokio::select! {
                result = &mut connect, if connecting => {
                    connecting = false;
                    if let Err(e) = result {
                        warn!("Profile connect to {} failed: {}", address, e);
                        return Err(unreachable());
                    }
                }
                request = profiles.next() => match request {
                    Some(request) => break request,
                    None => return Err(RadioError::Closed),
                },
            }
        };

        let stream = request.accept()?;
        let peer = peer_for(&self.adapter, target).await;
        info!("RFCOMM connection to {} open", peer);
        Ok(Arc::new(BluezSocket::new(stream, peer, Some(profiles))))
    }

    fn discovered_events(&self) -> broadcast::Receiver<Peer> {
        self.discovered_tx.subscribe()
    }

    fn bond_state_events(&self) -> broadcast::Receiver<BondStateEvent> {
        self.bond_tx.subscribe()
    }
}

/// Registered server profile waiting for connections.
struct BluezListener {
    adapter: Adapter,
    profiles: tokio::sync::Mutex<Option<Profiles>>,
    closed: CloseSignal,
}

#[async_trait]
impl RadioListener for BluezListener {
    async fn accept(&self, timeout: Duration) -> Result<Arc<dyn RadioSocket>, RadioError> {
        let mut slot = self.profiles.lock().await;

        let next = {
            let profiles = slot.as_mut().ok_or(RadioError::Closed)?;
            tokio::select! {
                _ = self.closed.closed() => None,
                next = tokio::time::timeout(timeout, profiles.next()) => Some(next),
            }
        };

        let request = match next {
            None => {
                slot.take();
                return Err(RadioError::Closed);
            }
            Some(Err(_)) => return Err(RadioError::Timeout),
            Some(Ok(None)) => return Err(RadioError::Closed),
            Some(Ok(Some(request))) => request,
        };

        let address = request.device();
        let stream = request.accept()?;
        let peer = peer_for(&self.adapter, address).await;
        info!("Accepted RFCOMM connection from {}", peer);
        Ok(Arc::new(BluezSocket::new(stream, peer, None)))
    }

    fn close(&self) {
        if self.closed.close() {
            // Dropping the handle unregisters the profile.
            if let Ok(mut slot) = self.profiles.try_lock() {
                slot.take();
            }
        }
    }
}

/// Open RFCOMM stream.
struct BluezSocket {
    peer: Peer,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: CloseSignal,
    _profiles: Option<Profiles>,
}

impl BluezSocket {
    fn new(stream: bluer::rfcomm::Stream, peer: Peer, profiles: Option<Profiles>) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: CloseSignal::new(),
            _profiles: profiles,
        }
    }
}

#[async_trait]
impl RadioSocket for BluezSocket {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RadioError> {
        let mut slot = self.reader.lock().await;

        let result = {
            let reader = slot.as_mut().ok_or(RadioError::Closed)?;
            tokio::select! {
                _ = self.closed.closed() => None,
                n = reader.read(buf) => Some(n),
            }
        };

        match result {
            Some(n) => Ok(n?),
            None => {
                slot.take();
                Err(RadioError::Closed)
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), RadioError> {
        let mut slot = self.writer.lock().await;

        let result = {
            let writer = slot.as_mut().ok_or(RadioError::Closed)?;
            tokio::select! {
                _ = self.closed.closed() => None,
                written = writer.write_all(data) => Some(written),
            }
        };

        match result {
            Some(written) => Ok(written?),
            None => {
                slot.take();
                Err(RadioError::Closed)
            }
        }
    }

    fn close(&self) {
        if self.closed.close() {
            debug!("Closing RFCOMM stream to {}", self.peer);
            if let Ok(mut reader) = self.reader.try_lock() {
                reader.take();
            }
            if let Ok(mut writer) = self.writer.try_lock() {
                writer.take();
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_closed()
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_watchers_start_one_task_per_address() {
        let mut watchers = LinkWatchers::default();
        let phone = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);
        let laptop = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x03]);

        assert!(watchers.insert(phone, std::future::pending()));
        // Listed at startup and then announced again by the adapter.
        assert!(!watchers.insert(phone, std::future::pending()));
        assert!(watchers.insert(laptop, std::future::pending()));
        assert_eq!(watchers.tasks.len(), 2);

        assert!(watchers.remove(phone));
        assert!(!watchers.remove(phone));
        assert!(!watchers.is_watching(phone));
        assert!(watchers.insert(phone, std::future::pending()));
    }
}
