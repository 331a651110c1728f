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

//! Connection controller.
//!
//! Owns the discovery cycle, both connection roles and the live session.
//! Observers read [`ControllerState`] snapshots through a watch channel and
//! transient error text through a broadcast feed.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::constants::defaults;
use super::protocol::Message;
use super::radio::{
    Authorization, BondStateEvent, CloseSignal, Radio, RadioError, RadioListener, RadioSocket,
    Subscription,
};
use super::session::{SessionError, SessionTransport};
use crate::config::Config;
use crate::devices::Peer;
use crate::error::{ControllerError, ErrorFeed};
use crate::state::{ConnectionStatus, ControllerState};
use crate::timer::CountdownTimer;

/// Pending outcomes buffered per attempt.
const OUTCOME_CAPACITY: usize = 32;

/// Progress of one listen or dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// A session with the peer is live.
    Established,
    /// The peer sent a message.
    MessageReceived(Message),
    /// The attempt or its session ended.
    Failed,
}

/// Handle for a running attempt, used to wait on and cancel it.
#[derive(Clone)]
struct AttemptSlot {
    abort: AbortHandle,
    done: Arc<CloseSignal>,
}

impl AttemptSlot {
    async fn cancel(self) {
        self.abort.abort();
        self.done.closed().await;
    }
}

/// Outcomes of one connection attempt.
///
/// Dropping the handle cancels the attempt and tears its connection down.
pub struct ConnectionAttempt {
    outcomes: mpsc::Receiver<ConnectionOutcome>,
    slot: Option<AttemptSlot>,
}

impl ConnectionAttempt {
    /// An attempt that never started. Yields no outcomes.
    fn inert() -> Self {
        let (_, outcomes) = mpsc::channel(1);
        Self {
            outcomes,
            slot: None,
        }
    }

    /// Wait for the next outcome. `None` once the attempt is over.
    pub async fn next(&mut self) -> Option<ConnectionOutcome> {
        self.outcomes.recv().await
    }

    /// Check whether the attempt's teardown has run.
    pub fn is_finished(&self) -> bool {
        self.slot
            .as_ref()
            .map(|slot| slot.done.is_closed())
            .unwrap_or(true)
    }

    /// Cancel the attempt and wait until its connection is torn down.
    pub async fn cancel(mut self) {
        if let Some(slot) = self.slot.take() {
            slot.cancel().await;
        }
    }

    /// Consume the handle as a stream of outcomes.
    pub fn into_stream(self) -> BoxStream<'static, ConnectionOutcome> {
        stream::unfold(self, |mut attempt| async move {
            attempt.next().await.map(|outcome| (outcome, attempt))
        })
        .boxed()
    }
}

impl Drop for ConnectionAttempt {
    fn drop(&mut self) {
        if let Some(slot) = &self.slot {
            slot.abort.abort();
        }
    }
}

/// Runs the connection teardown when an attempt ends, however it ends.
struct TeardownGuard {
    inner: Arc<Inner>,
    done: Arc<CloseSignal>,
}

impl TeardownGuard {
    /// Tear down now instead of at drop.
    fn teardown(self) {
        drop(self);
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.inner.close_connection();
        self.done.close();
    }
}

/// Endpoints owned by the current attempt.
#[derive(Default)]
struct Sockets {
    listener: Option<Arc<dyn RadioListener>>,
    socket: Option<Arc<dyn RadioSocket>>,
}

struct Inner {
    radio: Arc<dyn Radio>,
    config: Config,
    state: watch::Sender<ControllerState>,
    errors: ErrorFeed,
    timer: CountdownTimer,
    sockets: Mutex<Sockets>,
    session: Mutex<Option<Arc<SessionTransport>>>,
    attempt: Mutex<Option<AttemptSlot>>,
    attempt_gate: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
    released: AtomicBool,
}

impl Inner {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.send_if_modified(|state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
    }

    /// Refresh the enabled flag, then check the radio and `authorization`.
    /// Emits one error when a precondition fails.
    async fn check_ready(&self, authorization: Authorization) -> bool {
        let enabled = self.radio.is_enabled().await;
        self.state.send_if_modified(|state| {
            let changed = state.radio_enabled != enabled;
            state.radio_enabled = enabled;
            changed
        });

        if !enabled {
            self.errors.emit(ControllerError::RadioDisabled);
            return false;
        }
        if !self.radio.is_authorized(authorization) {
            self.errors.emit(ControllerError::Unauthorized);
            return false;
        }
        true
    }

    async fn refresh_bonded(&self) {
        match self.radio.bonded_peers().await {
            Ok(peers) => {
                debug!("{} bonded peers", peers.len());
                self.state.send_if_modified(|state| {
                    let before = state.devices.clone();
                    state.devices.replace_bonded(peers);
                    state.devices != before
                });
            }
            Err(e) => warn!("Failed to read bonded peers: {}", e),
        }
    }

    fn record_discovered(&self, peer: Peer) {
        self.state.send_if_modified(|state| {
            let added = state.devices.record_discovered(peer.clone());
            if added {
                debug!("Discovered {}", peer);
            }
            added
        });
    }

    fn on_discovery_tick(&self, remaining: u32) {
        self.state.send_if_modified(|state| {
            if state.discovery_remaining_secs.is_some() {
                state.discovery_remaining_secs = Some(remaining);
                true
            } else {
                false
            }
        });
    }

    async fn stop_discovery(&self) {
        self.timer.cancel();
        let was_active = self.state.send_if_modified(|state| {
            let active = state.discovery_remaining_secs.take().is_some();
            if state.status == ConnectionStatus::Discovering {
                state.status = ConnectionStatus::Idle;
                return true;
            }
            active
        });
        if was_active {
            info!("Discovery stopped");
        }

        if let Err(e) = self.radio.stop_discovery().await {
            warn!("Failed to stop radio discovery: {}", e);
        }
    }

    /// ACL link changes for bonded peers. The link flag is informational;
    /// only a disconnect of the live session's peer affects the session.
    async fn on_bond_state(&self, event: BondStateEvent) {
        let bonded = match self.radio.bonded_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Ignoring link change, bonded peers unavailable: {}", e);
                return;
            }
        };

        let mut is_bonded = false;
        let mut drops_session = false;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            state.devices.replace_bonded(bonded);
            is_bonded = state.devices.is_bonded(event.peer.address());
            if is_bonded {
                state.bonded_link_up = event.connected;
                drops_session =
                    !event.connected && state.session_peer.as_ref() == Some(&event.peer);
            }
            *state != before
        });

        if !is_bonded {
            debug!("Ignoring link change for unbonded {}", event.peer);
            return;
        }
        info!(
            "Bonded link to {} {}",
            event.peer,
            if event.connected { "up" } else { "down" }
        );

        if drops_session {
            info!("Link to session peer lost, closing connection");
            self.close_connection();
        }
    }

    /// Close and clear both endpoints and the session. Idempotent.
    fn close_connection(&self) {
        let Sockets { listener, socket } = std::mem::take(&mut *self.sockets.lock());
        if let Some(listener) = listener {
            listener.close();
        }
        if let Some(socket) = socket {
            socket.close();
        }
        if let Some(session) = self.session.lock().take() {
            session.close();
        }

        self.state.send_if_modified(|state| {
            let before = state.clone();
            state.clear_session();
            *state != before
        });
    }

    async fn cancel_attempt(&self) {
        let previous = self.attempt.lock().take();
        if let Some(slot) = previous {
            debug!("Cancelling previous connection attempt");
            slot.cancel().await;
        }
    }

    /// Own `socket` as the live session and forward its messages until it ends.
    async fn run_session(
        &self,
        socket: Arc<dyn RadioSocket>,
        outcomes: &mpsc::Sender<ConnectionOutcome>,
    ) -> SessionError {
        let session = Arc::new(SessionTransport::new(
            Arc::clone(&socket),
            self.config.session.framing,
            self.config.session.read_buffer_size,
        ));
        let peer = session.peer().clone();

        self.sockets.lock().socket = Some(socket);
        *self.session.lock() = Some(Arc::clone(&session));
        self.state.send_modify(|state| {
            state.connected = true;
            state.status = ConnectionStatus::Connected;
            state.session_peer = Some(peer.clone());
            state.messages.clear();
        });
        info!("Connected to {}", peer);
        let _ = outcomes.send(ConnectionOutcome::Established).await;

        let mut inbound = session.receive();
        while let Some(item) = inbound.next().await {
            match item {
                Ok(message) => {
                    self.state
                        .send_modify(|state| state.messages.push(message.clone()));
                    let _ = outcomes
                        .send(ConnectionOutcome::MessageReceived(message))
                        .await;
                }
                Err(e) => return e,
            }
        }
        SessionError::Terminated("inbound sequence ended".to_string())
    }

    fn report_session_end(&self, reason: &SessionError) {
        info!("Session ended: {}", reason);
        match reason {
            SessionError::Terminated(_) => self.errors.emit(ControllerError::SessionTerminated),
            SessionError::Malformed(_) => self.errors.emit(ControllerError::MalformedFrame),
        }
    }

    /// Listening role.
    async fn serve(
        self: Arc<Self>,
        outcomes: mpsc::Sender<ConnectionOutcome>,
        guard: TeardownGuard,
    ) {
        let service = self.config.bluetooth.service_uuid;
        let timeout = self.config.bluetooth.accept_timeout();
        let mut session_ended = false;

        loop {
            let listener = match self.radio.listen(service).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to listen on {}: {}", service, e);
                    self.errors.emit(ControllerError::ListenFailed);
                    guard.teardown();
                    let _ = outcomes.send(ConnectionOutcome::Failed).await;
                    return;
                }
            };
            self.sockets.lock().listener = Some(Arc::clone(&listener));
            self.set_status(ConnectionStatus::Listening);
            info!("Waiting for a peer on {}...", service);

            let accepted = listener.accept(timeout).await;
            listener.close();
            self.sockets.lock().listener = None;

            let socket = match accepted {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    if !session_ended {
                        let error = match e {
                            RadioError::Timeout => ControllerError::AcceptTimeout,
                            _ => ControllerError::ListenFailed,
                        };
                        self.errors.emit(error);
                    }
                    guard.teardown();
                    let _ = outcomes.send(ConnectionOutcome::Failed).await;
                    return;
                }
            };

            info!("Accepted connection from {}", socket.peer());
            let reason = self.run_session(socket, &outcomes).await;
            self.report_session_end(&reason);
            session_ended = true;

            if !self.config.bluetooth.relisten_after_session {
                guard.teardown();
                let _ = outcomes.send(ConnectionOutcome::Failed).await;
                return;
            }

            self.close_connection();
            info!("Listening again after session end");
        }
    }

    /// Dialing role.
    async fn dial(
        self: Arc<Self>,
        peer: Peer,
        outcomes: mpsc::Sender<ConnectionOutcome>,
        guard: TeardownGuard,
    ) {
        let service = self.config.bluetooth.service_uuid;
        self.set_status(ConnectionStatus::Connecting);
        info!("Connecting to {}...", peer);

        let dialed = tokio::time::timeout(
            self.config.bluetooth.connect_timeout(),
            self.radio.dial(peer.address(), service),
        )
        .await;

        let socket = match dialed {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", peer, e);
                guard.teardown();
                self.errors.emit(ControllerError::ConnectFailed);
                let _ = outcomes.send(ConnectionOutcome::Failed).await;
                return;
            }
            Err(_) => {
                warn!("Timed out connecting to {}", peer);
                guard.teardown();
                self.errors.emit(ControllerError::ConnectTimeout);
                let _ = outcomes.send(ConnectionOutcome::Failed).await;
                return;
            }
        };

        let reason = self.run_session(socket, &outcomes).await;
        guard.teardown();
        self.report_session_end(&reason);
        let _ = outcomes.send(ConnectionOutcome::Failed).await;
    }
}

/// The connection/session controller.
///
/// Cheap to clone; clones share one controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Create a controller on `radio` and subscribe to its event sources.
    pub async fn new(radio: Arc<dyn Radio>, config: Config) -> Self {
        let enabled = radio.is_enabled().await;
        let (state, _) = watch::channel(ControllerState::new(enabled));
        let errors = ErrorFeed::new(config.errors.feed_capacity);
        let discovery_secs = config.discovery.duration_secs;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_tick = weak.clone();
            let on_stop = weak.clone();
            let timer = CountdownTimer::new(
                discovery_secs,
                move |remaining| {
                    if let Some(inner) = on_tick.upgrade() {
                        inner.on_discovery_tick(remaining);
                    }
                },
                move || {
                    if let Some(inner) = on_stop.upgrade() {
                        debug!("Discovery window elapsed");
                        tokio::spawn(async move { inner.stop_discovery().await });
                    }
                },
            );

            Inner {
                radio: Arc::clone(&radio),
                config,
                state,
                errors,
                timer,
                sockets: Mutex::new(Sockets::default()),
                session: Mutex::new(None),
                attempt: Mutex::new(None),
                attempt_gate: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }
        });

        let weak = Arc::downgrade(&inner);
        let discovered = Subscription::spawn("discovered-peers", radio.discovered_events(), {
            let weak = weak.clone();
            move |peer: Peer| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.record_discovered(peer);
                    }
                }
            }
        });
        let bond_state = Subscription::spawn("bond-state", radio.bond_state_events(), {
            move |event: BondStateEvent| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_bond_state(event).await;
                    }
                }
            }
        });
        inner.subscriptions.lock().extend([discovered, bond_state]);

        if enabled && radio.is_authorized(Authorization::Connect) {
            inner.refresh_bonded().await;
        }

        info!("Controller ready (radio {})", if enabled { "on" } else { "off" });
        Self { inner }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ControllerState {
        self.inner.state.borrow().clone()
    }

    /// Receiver for state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    /// Receiver for transient error messages emitted from now on.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.inner.errors.subscribe()
    }

    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.inner.state.borrow().discovered_peers().to_vec()
    }

    pub fn bonded_peers(&self) -> Vec<Peer> {
        self.inner.state.borrow().bonded_peers().to_vec()
    }

    /// Check whether a listening endpoint or connection socket is held.
    pub fn has_open_endpoints(&self) -> bool {
        let sockets = self.inner.sockets.lock();
        sockets.listener.is_some() || sockets.socket.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    /// Start a discovery cycle bounded by the countdown.
    pub async fn start_device_discovery(&self) {
        if self.inner.is_released() {
            return;
        }
        let status = self.inner.state.borrow().status;
        if status.is_engaged() {
            debug!("Not discovering while {:?}", status);
            return;
        }
        if !self.inner.check_ready(Authorization::Scan).await {
            return;
        }

        if self.inner.radio.is_authorized(Authorization::Connect) {
            self.inner.refresh_bonded().await;
        }

        let total = self.inner.timer.total_secs();
        self.inner.state.send_modify(|state| {
            state.devices.clear_discovered();
            state.discovery_remaining_secs = Some(total);
            state.status = ConnectionStatus::Discovering;
        });

        if let Err(e) = self.inner.radio.start_discovery().await {
            error!("Failed to start radio discovery: {}", e);
            self.inner.stop_discovery().await;
            return;
        }
        self.inner.timer.start();
        info!("Discovering for {}s", total);
    }

    /// End the discovery cycle. Safe to call when none is running.
    pub async fn stop_device_discovery(&self) {
        self.inner.stop_discovery().await;
    }

    /// Refresh the bonded peer snapshot.
    pub async fn update_paired_devices(&self) {
        if self.inner.is_released() {
            return;
        }
        if self.inner.check_ready(Authorization::Connect).await {
            self.inner.refresh_bonded().await;
        }
    }

    /// Listen for one peer on the chat service.
    ///
    /// Any previous attempt is cancelled and torn down first.
    pub async fn start_bluetooth_server(&self) -> ConnectionAttempt {
        self.begin_attempt(|inner, outcomes, guard| inner.serve(outcomes, guard))
            .await
    }

    /// Dial `peer` on the chat service.
    ///
    /// Any previous attempt is cancelled and torn down first.
    pub async fn connect_to_device(&self, peer: &Peer) -> ConnectionAttempt {
        let peer = peer.clone();
        self.begin_attempt(move |inner, outcomes, guard| inner.dial(peer, outcomes, guard))
            .await
    }

    async fn begin_attempt<F, Fut>(&self, run: F) -> ConnectionAttempt
    where
        F: FnOnce(Arc<Inner>, mpsc::Sender<ConnectionOutcome>, TeardownGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.is_released() {
            return ConnectionAttempt::inert();
        }

        let _gate = self.inner.attempt_gate.lock().await;
        self.inner.cancel_attempt().await;
        self.inner.close_connection();
        self.inner.stop_discovery().await;

        if !self.inner.check_ready(Authorization::Connect).await {
            return ConnectionAttempt::inert();
        }

        let (tx, rx) = mpsc::channel(OUTCOME_CAPACITY);
        let done = Arc::new(CloseSignal::new());
        let guard = TeardownGuard {
            inner: Arc::clone(&self.inner),
            done: Arc::clone(&done),
        };
        let attempt = run(Arc::clone(&self.inner), tx, guard);
        let task = tokio::spawn(attempt);

        let slot = AttemptSlot {
            abort: task.abort_handle(),
            done,
        };
        *self.inner.attempt.lock() = Some(slot.clone());

        ConnectionAttempt {
            outcomes: rx,
            slot: Some(slot),
        }
    }

    /// Send `text` to the connected peer.
    ///
    /// Returns the sent message, or `None` without a session or on failure.
    pub async fn send_message(&self, text: &str) -> Option<Message> {
        if self.inner.is_released() {
            return None;
        }
        let session = self.inner.session.lock().clone()?;

        let sender = match &self.inner.config.bluetooth.device_name {
            Some(name) => name.clone(),
            None => self
                .inner
                .radio
                .local_name()
                .await
                .unwrap_or_else(|| defaults::UNKNOWN_SENDER.to_string()),
        };
        let message = Message::local(sender, text);

        if session.send(&message).await {
            self.inner
                .state
                .send_modify(|state| state.messages.push(message.clone()));
            Some(message)
        } else {
            self.inner.errors.emit(ControllerError::SendFailed);
            None
        }
    }

    /// Close both endpoints and drop the session.
    pub fn close_connection(&self) {
        self.inner.close_connection();
    }

    /// Cancel the running attempt and tear its connection down.
    pub async fn disconnect_from_device(&self) {
        self.inner.cancel_attempt().await;
        self.inner.close_connection();
        info!("Disconnected");
    }

    /// Cancel subscriptions, the countdown and any connection. Later
    /// operations do nothing.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }

        for subscription in self.inner.subscriptions.lock().drain(..) {
            if subscription.is_active() {
                debug!("Cancelling subscription {}", subscription.name());
            }
            subscription.cancel();
        }
        self.inner.cancel_attempt().await;
        self.inner.stop_discovery().await;
        self.inner.close_connection();
        info!("Controller released");
    }
}
