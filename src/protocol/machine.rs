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

//! Protocol state machine.
//!
//! Consumes one [`Event`] at a time and drives either the unlock task or the
//! key exchange task to completion:
//!
//! ```text
//! Idle -> WaitBtEnabled -> WaitDeviceSelected -> WaitConnected -> WaitServicesDiscovered
//!   unlock:       -> WaitNonce -> WaitHmacPart1Ack -> WaitHmacPart2Ack -> Idle
//!   key exchange: -> WaitCfgOutSubscribeAck -> WaitKeyPart1Ack -> WaitKeyPart2Ack
//!                 -> WaitServerKeyPart1 -> WaitServerKeyPart2 -> Idle
//! ```
//!
//! A derived key is not committed when the exchange finishes. It waits as the
//! pending key until the user confirms the displayed checksum while idle.
//!
//! Any failure or disconnect tears the link down and returns to idle with an
//! error tied to the failing step. Nothing is retried.

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::{debug, error, info, warn};

use super::state::{
    KeyExchangeSession, KeyExchangeStep, KeyMaterial, LinkStep, SessionContext, State, UnlockStep,
};
use super::StateStore;
use crate::bluetooth::reassembler::{chunk_part, ReassemblyError};
use crate::bluetooth::{Channel, Transport};
use crate::crypto::{hmac_sha512_256, Checksum, EcdhKeypair, NONCE_LENGTH, SECRET_LENGTH};
use crate::error::TaskError;
use crate::events::{Event, EventSender, Outcome, TaskKind, UiEvent, UiSender};

/// Cryptographically secure random source for key generation.
pub trait RngSource: RngCore + CryptoRng + Send {}

impl<R: RngCore + CryptoRng + Send> RngSource for R {}

/// The protocol state machine. Owns the active key and the session state.
pub struct ProtocolMachine<T: Transport> {
    state: State,
    transport: T,
    store: Box<dyn StateStore>,
    ui: UiSender,
    loopback: EventSender,
    rng: Box<dyn RngSource>,
    key: Option<KeyMaterial>,
    endpoint: Option<String>,
    pending_key: Option<KeyMaterial>,
    session: SessionContext,
}

impl<T: Transport> ProtocolMachine<T> {
    /// Create an idle machine.
    ///
    /// `loopback` must feed the same queue the machine is driven from; the
    /// machine posts follow-up events to it.
    pub fn new(
        transport: T,
        store: Box<dyn StateStore>,
        ui: UiSender,
        loopback: EventSender,
    ) -> Self {
        let key = store.key();
        let endpoint = store.endpoint();
        Self {
            state: State::Idle,
            transport,
            store,
            ui,
            loopback,
            rng: Box::new(OsRng),
            key,
            endpoint,
            pending_key: None,
            session: SessionContext::default(),
        }
    }

    /// Replace the random source used for key generation.
    pub fn with_rng(mut self, rng: impl RngSource + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Active key used for unlocking.
    pub fn key(&self) -> Option<&KeyMaterial> {
        self.key.as_ref()
    }

    /// Derived key waiting for confirmation.
    pub fn pending_key(&self) -> Option<&KeyMaterial> {
        self.pending_key.as_ref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Process one event to completion.
    pub fn handle(&mut self, event: Event) {
        debug!("Event {:?} in state {:?}", event, self.state);

        if !self.state.is_idle() {
            match event {
                Event::StartUnlock
                | Event::StartKeyExchange(_)
                | Event::KeyConfirmed
                | Event::KeyDenied => {
                    warn!("Rejecting {:?}: a task is in progress", event);
                    self.notify(UiEvent::Rejected(TaskError::TaskAlreadyInProgress));
                    return;
                }
                _ => {}
            }
        }

        match self.state {
            State::Idle => self.on_idle(event),
            State::Unlock(step) => self.on_unlock(step, event),
            State::KeyExchange(step) => self.on_key_exchange(step, event),
        }
    }

    fn on_idle(&mut self, event: Event) {
        match event {
            Event::StartUnlock => self.start_unlock(),
            Event::StartKeyExchange(key_number) => self.start_key_exchange(key_number),
            Event::KeyConfirmed => self.confirm_key(),
            Event::KeyDenied => self.deny_key(),
            Event::DeviceSelected(address) => self.remember_endpoint(&address),
            other => debug!("Ignoring {:?} while idle", other),
        }
    }

    fn start_unlock(&mut self) {
        let Some(key_number) = self.key.as_ref().map(|k| k.key_number) else {
            warn!("Unlock requested without a key");
            self.notify(UiEvent::Rejected(TaskError::NoKeyConfigured));
            return;
        };

        info!("Starting unlock with key {}", key_number);
        self.session.clear();
        self.notify(UiEvent::TaskStarted(TaskKind::Unlock));
        self.begin_link(TaskKind::Unlock);
    }

    fn start_key_exchange(&mut self, key_number: u8) {
        info!("Starting key exchange for key {}", key_number);
        self.pending_key = None;
        self.session.clear();
        self.session.key_exchange = Some(KeyExchangeSession::new(key_number));
        self.notify(UiEvent::TaskStarted(TaskKind::KeyExchange));
        self.begin_link(TaskKind::KeyExchange);
    }

    fn confirm_key(&mut self) {
        let Some(key) = self.pending_key.clone() else {
            warn!("Key confirmation without an exchanged key");
            self.notify(UiEvent::Rejected(TaskError::NoSharedSecretToConfirm));
            return;
        };

        let key_number = key.key_number;
        if let Err(e) = self.store.store_key(&key) {
            error!("Failed to persist key {}: {:#}", key_number, e);
        }
        self.key = Some(key);
        info!("Key {} confirmed and activated", key_number);
        self.notify(UiEvent::KeyCommitted { key_number });
    }

    fn deny_key(&mut self) {
        match self.pending_key.take() {
            Some(key) => {
                info!("Exchanged key {} denied, discarding it", key.key_number);
                self.notify(UiEvent::KeyDiscarded);
            }
            None => debug!("Key denied, but no exchanged key is pending"),
        }
    }

    fn remember_endpoint(&mut self, address: &str) {
        if self.endpoint.as_deref() == Some(address) {
            return;
        }

        info!("Lock selected: {}", address);
        self.endpoint = Some(address.to_string());
        if let Err(e) = self.store.store_endpoint(address) {
            error!("Failed to persist lock address: {:#}", e);
        }
    }

    fn begin_link(&mut self, task: TaskKind) {
        self.set_state(State::link(task, LinkStep::WaitBtEnabled));

        if self.transport.is_enabled() {
            self.post(Event::BluetoothEnabled);
        } else {
            info!("Bluetooth is off, requesting it to be enabled");
            if let Err(e) = self.transport.request_enable() {
                error!("Cannot enable Bluetooth: {}", e);
                self.abort(TaskError::TransportUnavailable);
            }
        }
    }

    /// Link setup steps shared by both tasks.
    fn on_link(&mut self, task: TaskKind, step: LinkStep, event: Event) {
        match (step, event) {
            (LinkStep::WaitBtEnabled, Event::BluetoothEnabled) => {
                self.set_state(State::link(task, LinkStep::WaitDeviceSelected));
                match self.endpoint.clone() {
                    Some(address) => self.post(Event::DeviceSelected(address)),
                    None => {
                        info!("No lock known, asking for one");
                        self.notify(UiEvent::SelectDevice);
                    }
                }
            }
            (LinkStep::WaitDeviceSelected, Event::DeviceSelected(address)) => {
                self.remember_endpoint(&address);
                match self.transport.connect(&address) {
                    Ok(()) => self.set_state(State::link(task, LinkStep::WaitConnected)),
                    Err(e) => {
                        error!("Cannot connect to {}: {}", address, e);
                        self.abort(TaskError::ConnectionFailed);
                    }
                }
            }
            (LinkStep::WaitConnected, Event::Connected) => match self.transport.discover_services() {
                Ok(()) => self.set_state(State::link(task, LinkStep::WaitServicesDiscovered)),
                Err(e) => {
                    error!("Cannot start service discovery: {}", e);
                    self.abort(TaskError::ConnectionFailed);
                }
            },
            (LinkStep::WaitServicesDiscovered, Event::ServicesDiscovered) => {
                self.on_services_discovered(task)
            }
            (step, event) => debug!("Ignoring {:?} in link step {:?}", event, step),
        }
    }

    fn on_services_discovered(&mut self, task: TaskKind) {
        if !self.transport.has_service() {
            self.abort(TaskError::RequiredServiceMissing);
            return;
        }

        let (incoming, outgoing) = match task {
            TaskKind::Unlock => (Channel::Nonce, Channel::Unlock),
            TaskKind::KeyExchange => (Channel::CfgOut, Channel::CfgIn),
        };
        if !self.transport.has_channel(incoming) || !self.transport.has_channel(outgoing) {
            self.abort(TaskError::RequiredCharacteristicMissing);
            return;
        }

        if let Err(e) = self.transport.subscribe(incoming) {
            error!("Cannot subscribe to {}: {}", incoming, e);
            self.abort(TaskError::SubscribeFailed);
            return;
        }

        match task {
            // The nonce indication can overtake the subscription
            // acknowledgment, so wait for the nonce directly.
            TaskKind::Unlock => self.set_state(State::Unlock(UnlockStep::WaitNonce)),
            TaskKind::KeyExchange => {
                self.set_state(State::KeyExchange(KeyExchangeStep::WaitCfgOutSubscribeAck))
            }
        }
    }

    fn on_unlock(&mut self, step: UnlockStep, event: Event) {
        match (step, event) {
            (_, Event::Failure | Event::Disconnected) => self.abort(step.failure()),
            (UnlockStep::Link(link), event) => self.on_link(TaskKind::Unlock, link, event),
            (UnlockStep::WaitNonce, Event::NotificationReceived(Channel::Nonce, value)) => {
                self.on_nonce(&value)
            }
            (UnlockStep::WaitHmacPart1Ack, Event::WriteAck(Channel::Unlock)) => {
                self.send_hmac_part(1, UnlockStep::WaitHmacPart2Ack)
            }
            (UnlockStep::WaitHmacPart2Ack, Event::WriteAck(Channel::Unlock)) => {
                info!("Unlock request delivered");
                self.transport.close();
                self.finish(TaskKind::Unlock, Ok(Outcome::DoorUnlocked));
            }
            (step, event) => debug!("Ignoring {:?} in unlock step {:?}", event, step),
        }
    }

    fn on_nonce(&mut self, value: &[u8]) {
        let nonce = match <[u8; NONCE_LENGTH]>::try_from(value) {
            Ok(nonce) => nonce,
            Err(_) => {
                warn!("Nonce has invalid length {}", value.len());
                self.abort(TaskError::MalformedNotification);
                return;
            }
        };

        let Some(secret) = self.key.as_ref().map(|k| k.secret) else {
            self.abort(TaskError::NoKeyConfigured);
            return;
        };

        match hmac_sha512_256(&secret, &nonce) {
            Ok(hmac) => {
                debug!("Nonce received, HMAC computed");
                self.session.nonce = Some(nonce);
                self.session.hmac = Some(hmac);
                self.send_hmac_part(0, UnlockStep::WaitHmacPart1Ack);
            }
            Err(e) => {
                error!("HMAC computation failed: {}", e);
                self.abort(TaskError::ComputationFailed);
            }
        }
    }

    fn send_hmac_part(&mut self, part: u8, next: UnlockStep) {
        let key_number = self.key.as_ref().map(|k| k.key_number);
        let (Some(hmac), Some(key_number)) = (self.session.hmac, key_number) else {
            error!("No HMAC to send");
            self.abort(TaskError::ComputationFailed);
            return;
        };

        let chunk = chunk_part(&hmac, key_number, part);
        match self.transport.write(Channel::Unlock, &chunk) {
            Ok(()) => {
                debug!("HMAC part {} submitted", part);
                self.set_state(State::Unlock(next));
            }
            Err(e) => {
                error!("Cannot write HMAC part {}: {}", part, e);
                self.abort(TaskError::WriteFailed);
            }
        }
    }

    fn on_key_exchange(&mut self, step: KeyExchangeStep, event: Event) {
        match (step, event) {
            (_, Event::Failure | Event::Disconnected) => self.abort(step.failure()),
            (KeyExchangeStep::Link(link), event) => {
                self.on_link(TaskKind::KeyExchange, link, event)
            }
            (KeyExchangeStep::WaitCfgOutSubscribeAck, Event::SubscribeAck(Channel::CfgOut)) => {
                self.on_cfg_out_subscribed()
            }
            (KeyExchangeStep::WaitKeyPart1Ack, Event::WriteAck(Channel::CfgIn)) => {
                self.send_client_key_part(1, KeyExchangeStep::WaitKeyPart2Ack)
            }
            (KeyExchangeStep::WaitKeyPart2Ack, Event::WriteAck(Channel::CfgIn)) => {
                debug!("Client key delivered, waiting for the lock's key");
                self.set_state(State::KeyExchange(KeyExchangeStep::WaitServerKeyPart1));
            }
            (
                KeyExchangeStep::WaitServerKeyPart1 | KeyExchangeStep::WaitServerKeyPart2,
                Event::NotificationReceived(Channel::CfgOut, value),
            ) => self.on_server_key_part(&value),
            (step, event) => debug!("Ignoring {:?} in key exchange step {:?}", event, step),
        }
    }

    fn on_cfg_out_subscribed(&mut self) {
        let Some(session) = self.session.key_exchange.as_mut() else {
            error!("Key exchange session missing");
            self.abort(TaskError::ComputationFailed);
            return;
        };

        session.client = Some(EcdhKeypair::generate(&mut *self.rng));
        debug!("Client key pair generated");
        self.send_client_key_part(0, KeyExchangeStep::WaitKeyPart1Ack);
    }

    fn send_client_key_part(&mut self, part: u8, next: KeyExchangeStep) {
        let outgoing = self.session.key_exchange.as_ref().and_then(|session| {
            session
                .client
                .as_ref()
                .map(|client| (session.target_key_number, client.public_bytes()))
        });
        let Some((key_number, public)) = outgoing else {
            error!("No client key to send");
            self.abort(TaskError::ComputationFailed);
            return;
        };

        let chunk = chunk_part(&public, key_number, part);
        match self.transport.write(Channel::CfgIn, &chunk) {
            Ok(()) => {
                debug!("Client key part {} submitted", part);
                self.set_state(State::KeyExchange(next));
            }
            Err(e) => {
                error!("Cannot write client key part {}: {}", part, e);
                self.abort(TaskError::WriteFailed);
            }
        }
    }

    fn on_server_key_part(&mut self, value: &[u8]) {
        let Some(session) = self.session.key_exchange.as_mut() else {
            error!("Key exchange session missing");
            self.abort(TaskError::ComputationFailed);
            return;
        };

        match session.server_key.process_chunk(value) {
            Ok(None) => self.set_state(State::KeyExchange(KeyExchangeStep::WaitServerKeyPart2)),
            Ok(Some(server_public)) => self.complete_key_exchange(server_public),
            Err(ReassemblyError::InvalidLength(len)) => {
                warn!("Server key part has invalid length {}", len);
                self.abort(TaskError::MalformedNotification);
            }
            Err(e) => {
                warn!("Server key part rejected: {}", e);
                self.abort(TaskError::ProtocolViolation);
            }
        }
    }

    fn complete_key_exchange(&mut self, server_public: [u8; SECRET_LENGTH]) {
        // Everything needed from the lock has arrived.
        self.transport.close();

        let Some(session) = self.session.key_exchange.as_mut() else {
            self.abort(TaskError::ComputationFailed);
            return;
        };
        let Some(client) = session.client.as_ref() else {
            error!("Server key arrived before the client key was generated");
            self.abort(TaskError::ComputationFailed);
            return;
        };

        let shared_secret = client.shared_secret(&server_public);
        session.shared_secret = Some(shared_secret);
        let key_number = session.target_key_number;

        let checksum = Checksum::of_secret(&shared_secret);
        info!(
            "Key exchange for key {} complete, checksum {}",
            key_number, checksum
        );
        self.pending_key = Some(KeyMaterial {
            key_number,
            secret: shared_secret,
        });
        self.notify(UiEvent::DisplayChecksum(checksum));
        self.finish(
            TaskKind::KeyExchange,
            Ok(Outcome::KeyExchanged {
                key_number,
                checksum,
            }),
        );
    }

    /// Tear down the link and end the running task with an error.
    fn abort(&mut self, error: TaskError) {
        let Some(task) = self.state.task() else {
            return;
        };

        error!("{} failed in {:?}: {}", task, self.state, error);
        self.transport.close();
        self.finish(task, Err(error));
    }

    fn finish(&mut self, task: TaskKind, result: Result<Outcome, TaskError>) {
        self.session.clear();
        self.set_state(State::Idle);
        if result.is_ok() {
            info!("Task {} finished", task);
        }
        self.notify(UiEvent::TaskFinished { task, result });
    }

    fn set_state(&mut self, state: State) {
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn post(&self, event: Event) {
        if self.loopback.send(event).is_err() {
            error!("Event queue closed");
        }
    }

    fn notify(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::reassembler::split_value;
    use crate::events::{event_channel, EventLoop};
    use crate::protocol::MemoryStore;
    use crate::bluetooth::TransportError;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const LOCK: &str = "AA:BB:CC:DD:EE:FF";
    const SECRET: [u8; 32] = [7u8; 32];

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        RequestEnable,
        Connect(String),
        DiscoverServices,
        Subscribe(Channel),
        Write(Channel, Vec<u8>),
        Close,
    }

    /// Records requests; completions are injected by the test.
    #[derive(Debug)]
    struct RecordingTransport {
        calls: Vec<Call>,
        enabled: bool,
        service: bool,
        missing: Vec<Channel>,
        reject_writes: bool,
        /// Set once a background close finishes; `None` closes at once.
        slow_close: Option<Arc<AtomicBool>>,
        close_task: Option<JoinHandle<()>>,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                enabled: true,
                service: true,
                missing: Vec::new(),
                reject_writes: false,
                slow_close: None,
                close_task: None,
            }
        }
    }

    impl Transport for RecordingTransport {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn request_enable(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::RequestEnable);
            Ok(())
        }

        fn connect(&mut self, address: &str) -> Result<(), TransportError> {
            self.calls.push(Call::Connect(address.to_string()));
            Ok(())
        }

        fn discover_services(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::DiscoverServices);
            Ok(())
        }

        fn has_service(&self) -> bool {
            self.service
        }

        fn has_channel(&self, channel: Channel) -> bool {
            !self.missing.contains(&channel)
        }

        fn subscribe(&mut self, channel: Channel) -> Result<(), TransportError> {
            self.calls.push(Call::Subscribe(channel));
            Ok(())
        }

        fn write(&mut self, channel: Channel, value: &[u8]) -> Result<(), TransportError> {
            if self.reject_writes {
                return Err(TransportError::Backend("write rejected".into()));
            }
            self.calls.push(Call::Write(channel, value.to_vec()));
            Ok(())
        }

        fn close(&mut self) {
            self.calls.push(Call::Close);
            if let Some(closed) = self.slow_close.clone() {
                self.close_task = Some(tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    closed.store(true, Ordering::SeqCst);
                }));
            }
        }

        fn take_close_task(&mut self) -> Option<JoinHandle<()>> {
            self.close_task.take()
        }
    }

    /// Store shared with the test so persisted values can be inspected.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<MemoryStore>>);

    impl StateStore for SharedStore {
        fn key(&self) -> Option<KeyMaterial> {
            self.0.lock().key()
        }

        fn endpoint(&self) -> Option<String> {
            self.0.lock().endpoint()
        }

        fn store_key(&mut self, key: &KeyMaterial) -> anyhow::Result<()> {
            self.0.lock().store_key(key)
        }

        fn store_endpoint(&mut self, address: &str) -> anyhow::Result<()> {
            self.0.lock().store_endpoint(address)
        }
    }

    struct Harness {
        event_loop: EventLoop<RecordingTransport>,
        events: EventSender,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        store: SharedStore,
    }

    impl Harness {
        fn new(store: MemoryStore, transport: RecordingTransport) -> Self {
            let store = SharedStore(Arc::new(Mutex::new(store)));
            let (events, event_rx) = event_channel();
            let (ui_tx, ui) = mpsc::unbounded_channel();
            let machine =
                ProtocolMachine::new(transport, Box::new(store.clone()), ui_tx, events.clone())
                    .with_rng(StdRng::seed_from_u64(20));
            Self {
                event_loop: EventLoop::new(machine, event_rx),
                events,
                ui,
                store,
            }
        }

        fn configured() -> Self {
            Self::new(
                MemoryStore {
                    key: Some(KeyMaterial {
                        key_number: 1,
                        secret: SECRET,
                    }),
                    endpoint: Some(LOCK.to_string()),
                },
                RecordingTransport::default(),
            )
        }

        fn send(&mut self, event: Event) {
            self.events.send(event).unwrap();
            self.event_loop.process_pending();
        }

        fn machine(&self) -> &ProtocolMachine<RecordingTransport> {
            self.event_loop.machine()
        }

        fn state(&self) -> State {
            self.machine().state()
        }

        fn calls(&self) -> Vec<Call> {
            self.machine().transport().calls.clone()
        }

        fn ui_events(&mut self) -> Vec<UiEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.ui.try_recv() {
                out.push(event);
            }
            out
        }

        fn writes(&self, channel: Channel) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Write(c, value) if c == channel => Some(value),
                    _ => None,
                })
                .collect()
        }

        /// Drive a task through link setup up to its first protocol step.
        fn connect(&mut self) {
            self.send(Event::Connected);
            self.send(Event::ServicesDiscovered);
        }

        fn run_key_exchange_to_server_key(&mut self, key_number: u8) {
            self.send(Event::StartKeyExchange(key_number));
            self.connect();
            self.send(Event::SubscribeAck(Channel::CfgOut));
            self.send(Event::WriteAck(Channel::CfgIn));
            self.send(Event::WriteAck(Channel::CfgIn));
        }

        fn client_public_key(&self) -> [u8; 32] {
            let writes = self.writes(Channel::CfgIn);
            let mut public = [0u8; 32];
            public[..16].copy_from_slice(&writes[0][2..]);
            public[16..].copy_from_slice(&writes[1][2..]);
            public
        }
    }

    fn nonce() -> Vec<u8> {
        (100..116).collect()
    }

    #[test]
    fn test_unlock_happy_path() {
        let mut h = Harness::configured();

        h.send(Event::StartUnlock);
        assert_eq!(
            h.state(),
            State::Unlock(UnlockStep::Link(LinkStep::WaitConnected))
        );
        assert_eq!(h.calls(), vec![Call::Connect(LOCK.to_string())]);

        h.connect();
        assert_eq!(h.state(), State::Unlock(UnlockStep::WaitNonce));
        assert!(h.calls().contains(&Call::Subscribe(Channel::Nonce)));

        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        assert_eq!(h.state(), State::Unlock(UnlockStep::WaitHmacPart1Ack));
        assert_eq!(h.writes(Channel::Unlock).len(), 1);

        h.send(Event::WriteAck(Channel::Unlock));
        assert_eq!(h.state(), State::Unlock(UnlockStep::WaitHmacPart2Ack));
        h.send(Event::WriteAck(Channel::Unlock));
        assert_eq!(h.state(), State::Idle);

        let hmac = hmac_sha512_256(&SECRET, &nonce()).unwrap();
        let writes = h.writes(Channel::Unlock);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][..2], [1, 0]);
        assert_eq!(writes[0][2..], hmac[..16]);
        assert_eq!(writes[1][..2], [1, 1]);
        assert_eq!(writes[1][2..], hmac[16..]);
        assert_eq!(h.calls().last(), Some(&Call::Close));

        assert_eq!(
            h.ui_events(),
            vec![
                UiEvent::TaskStarted(TaskKind::Unlock),
                UiEvent::TaskFinished {
                    task: TaskKind::Unlock,
                    result: Ok(Outcome::DoorUnlocked)
                },
            ]
        );
        assert!(h.machine().session().hmac.is_none());
        assert!(h.machine().session().nonce.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_link_close() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut h = Harness::configured();
        h.event_loop.machine_mut().transport_mut().slow_close = Some(closed.clone());

        h.send(Event::StartUnlock);
        h.connect();
        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        h.send(Event::WriteAck(Channel::Unlock));
        h.send(Event::WriteAck(Channel::Unlock));
        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.calls().last(), Some(&Call::Close));
        assert!(!closed.load(Ordering::SeqCst));

        h.event_loop.shutdown().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_late_nonce_subscribe_ack_is_ignored() {
        let mut h = Harness::configured();
        h.send(Event::StartUnlock);
        h.connect();

        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        h.send(Event::SubscribeAck(Channel::Nonce));
        assert_eq!(h.state(), State::Unlock(UnlockStep::WaitHmacPart1Ack));
        assert_eq!(h.writes(Channel::Unlock).len(), 1);
    }

    #[test]
    fn test_unlock_without_key_is_rejected() {
        let mut h = Harness::new(MemoryStore::default(), RecordingTransport::default());

        h.send(Event::StartUnlock);
        assert_eq!(h.state(), State::Idle);
        assert!(h.calls().is_empty());
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::Rejected(TaskError::NoKeyConfigured)]
        );
    }

    #[test]
    fn test_start_events_rejected_while_busy() {
        let mut h = Harness::configured();
        let steps: Vec<Event> = vec![
            Event::StartUnlock,
            Event::Connected,
            Event::ServicesDiscovered,
            Event::NotificationReceived(Channel::Nonce, nonce()),
            Event::WriteAck(Channel::Unlock),
        ];

        for step in steps {
            h.send(step);
            let state = h.state();
            let calls = h.calls().len();
            h.ui_events();

            for intruder in [
                Event::StartUnlock,
                Event::StartKeyExchange(0),
                Event::KeyConfirmed,
            ] {
                h.send(intruder);
                assert_eq!(h.state(), state);
                assert_eq!(h.calls().len(), calls);
                assert_eq!(
                    h.ui_events(),
                    vec![UiEvent::Rejected(TaskError::TaskAlreadyInProgress)]
                );
            }
        }
    }

    #[test]
    fn test_disconnect_mid_unlock() {
        let mut h = Harness::configured();
        h.send(Event::StartUnlock);
        h.connect();
        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        h.ui_events();

        h.send(Event::Disconnected);
        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.calls().last(), Some(&Call::Close));
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::Unlock,
                result: Err(TaskError::WriteFailed)
            }]
        );

        let calls = h.calls().len();
        h.send(Event::WriteAck(Channel::Unlock));
        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        assert_eq!(h.calls().len(), calls);
        assert!(h.ui_events().is_empty());
    }

    /// Events completing every step of both tracks, with the step each one
    /// leads to.
    fn unlock_steps() -> Vec<(Event, State)> {
        vec![
            (
                Event::StartUnlock,
                State::Unlock(UnlockStep::Link(LinkStep::WaitConnected)),
            ),
            (
                Event::Connected,
                State::Unlock(UnlockStep::Link(LinkStep::WaitServicesDiscovered)),
            ),
            (
                Event::ServicesDiscovered,
                State::Unlock(UnlockStep::WaitNonce),
            ),
            (
                Event::NotificationReceived(Channel::Nonce, nonce()),
                State::Unlock(UnlockStep::WaitHmacPart1Ack),
            ),
            (
                Event::WriteAck(Channel::Unlock),
                State::Unlock(UnlockStep::WaitHmacPart2Ack),
            ),
        ]
    }

    fn key_exchange_steps() -> Vec<(Event, State)> {
        let server = EcdhKeypair::generate(&mut StdRng::seed_from_u64(99));
        let [first, _] = split_value(&server.public_bytes(), 0);
        vec![
            (
                Event::StartKeyExchange(0),
                State::KeyExchange(KeyExchangeStep::Link(LinkStep::WaitConnected)),
            ),
            (
                Event::Connected,
                State::KeyExchange(KeyExchangeStep::Link(LinkStep::WaitServicesDiscovered)),
            ),
            (
                Event::ServicesDiscovered,
                State::KeyExchange(KeyExchangeStep::WaitCfgOutSubscribeAck),
            ),
            (
                Event::SubscribeAck(Channel::CfgOut),
                State::KeyExchange(KeyExchangeStep::WaitKeyPart1Ack),
            ),
            (
                Event::WriteAck(Channel::CfgIn),
                State::KeyExchange(KeyExchangeStep::WaitKeyPart2Ack),
            ),
            (
                Event::WriteAck(Channel::CfgIn),
                State::KeyExchange(KeyExchangeStep::WaitServerKeyPart1),
            ),
            (
                Event::NotificationReceived(Channel::CfgOut, first.to_vec()),
                State::KeyExchange(KeyExchangeStep::WaitServerKeyPart2),
            ),
        ]
    }

    /// Completions a backend could still deliver after the link is gone.
    fn late_events() -> Vec<Event> {
        vec![
            Event::Connected,
            Event::ServicesDiscovered,
            Event::SubscribeAck(Channel::Nonce),
            Event::SubscribeAck(Channel::CfgOut),
            Event::WriteAck(Channel::Unlock),
            Event::WriteAck(Channel::CfgIn),
            Event::NotificationReceived(Channel::Nonce, nonce()),
            Event::NotificationReceived(Channel::CfgOut, vec![0u8; 18]),
        ]
    }

    fn expected_failure(state: State) -> (TaskKind, TaskError) {
        match state {
            State::Unlock(step) => (TaskKind::Unlock, step.failure()),
            State::KeyExchange(step) => (TaskKind::KeyExchange, step.failure()),
            State::Idle => unreachable!("no task runs while idle"),
        }
    }

    #[test]
    fn test_disconnect_in_every_step_returns_to_idle() {
        for steps in [unlock_steps(), key_exchange_steps()] {
            for prefix in 1..=steps.len() {
                let mut h = Harness::configured();
                for (event, state) in &steps[..prefix] {
                    h.send(event.clone());
                    assert_eq!(h.state(), *state);
                }
                let step = h.state();
                let (task, error) = expected_failure(step);
                h.ui_events();

                h.send(Event::Disconnected);
                assert_eq!(h.state(), State::Idle, "disconnect in {:?}", step);
                assert_eq!(h.calls().last(), Some(&Call::Close));
                assert_eq!(
                    h.ui_events(),
                    vec![UiEvent::TaskFinished {
                        task,
                        result: Err(error)
                    }],
                    "disconnect in {:?}",
                    step
                );
                assert!(h.machine().pending_key().is_none());

                let calls = h.calls().len();
                for event in late_events() {
                    h.send(event);
                }
                assert_eq!(h.state(), State::Idle);
                assert_eq!(h.calls().len(), calls, "late events after {:?}", step);
                assert!(h.ui_events().is_empty());
            }
        }
    }

    #[test]
    fn test_key_exchange_disconnect_errors() {
        let errors: Vec<TaskError> = key_exchange_steps()
            .into_iter()
            .map(|(_, state)| expected_failure(state).1)
            .collect();
        assert_eq!(
            errors,
            vec![
                TaskError::ConnectionFailed,
                TaskError::ServiceDiscoveryFailed,
                TaskError::SubscribeFailed,
                TaskError::WriteFailed,
                TaskError::WriteFailed,
                TaskError::SubscribeFailed,
                TaskError::SubscribeFailed,
            ]
        );
    }

    #[test]
    fn test_start_events_rejected_in_every_key_exchange_step() {
        let mut h = Harness::configured();

        for (event, expected) in key_exchange_steps() {
            h.send(event);
            assert_eq!(h.state(), expected);
            let calls = h.calls().len();
            h.ui_events();

            for intruder in [
                Event::StartUnlock,
                Event::StartKeyExchange(1),
                Event::KeyConfirmed,
                Event::KeyDenied,
            ] {
                h.send(intruder);
                assert_eq!(h.state(), expected);
                assert_eq!(h.calls().len(), calls);
                assert_eq!(
                    h.ui_events(),
                    vec![UiEvent::Rejected(TaskError::TaskAlreadyInProgress)]
                );
            }
        }
        assert_eq!(
            h.machine()
                .session()
                .key_exchange
                .as_ref()
                .map(|s| s.target_key_number),
            Some(0)
        );
    }

    #[test]
    fn test_malformed_nonce_aborts() {
        let mut h = Harness::configured();
        h.send(Event::StartUnlock);
        h.connect();
        h.ui_events();

        h.send(Event::NotificationReceived(Channel::Nonce, vec![0u8; 15]));
        assert_eq!(h.state(), State::Idle);
        assert!(h.writes(Channel::Unlock).is_empty());
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::Unlock,
                result: Err(TaskError::MalformedNotification)
            }]
        );
    }

    #[test]
    fn test_rejected_write_aborts() {
        let mut h = Harness::configured();
        h.event_loop.machine_mut().transport_mut().reject_writes = true;
        h.send(Event::StartUnlock);
        h.connect();
        h.ui_events();

        h.send(Event::NotificationReceived(Channel::Nonce, nonce()));
        assert_eq!(h.state(), State::Idle);
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::Unlock,
                result: Err(TaskError::WriteFailed)
            }]
        );
    }

    #[test]
    fn test_key_exchange_happy_path_and_confirmation() {
        let mut h = Harness::configured();
        h.send(Event::StartKeyExchange(2));
        h.connect();
        assert_eq!(
            h.state(),
            State::KeyExchange(KeyExchangeStep::WaitCfgOutSubscribeAck)
        );
        assert!(h.calls().contains(&Call::Subscribe(Channel::CfgOut)));
        assert!(h.writes(Channel::CfgIn).is_empty());

        h.send(Event::SubscribeAck(Channel::CfgOut));
        assert_eq!(h.state(), State::KeyExchange(KeyExchangeStep::WaitKeyPart1Ack));
        h.send(Event::WriteAck(Channel::CfgIn));
        assert_eq!(h.state(), State::KeyExchange(KeyExchangeStep::WaitKeyPart2Ack));
        h.send(Event::WriteAck(Channel::CfgIn));
        assert_eq!(
            h.state(),
            State::KeyExchange(KeyExchangeStep::WaitServerKeyPart1)
        );

        let writes = h.writes(Channel::CfgIn);
        assert_eq!(writes[0][..2], [2, 0]);
        assert_eq!(writes[1][..2], [2, 1]);

        let server = EcdhKeypair::generate(&mut StdRng::seed_from_u64(99));
        let [first, second] = split_value(&server.public_bytes(), 2);
        h.send(Event::NotificationReceived(Channel::CfgOut, first.to_vec()));
        assert_eq!(
            h.state(),
            State::KeyExchange(KeyExchangeStep::WaitServerKeyPart2)
        );
        h.send(Event::NotificationReceived(Channel::CfgOut, second.to_vec()));
        assert_eq!(h.state(), State::Idle);

        let expected_secret = server.shared_secret(&h.client_public_key());
        let checksum = Checksum::of_secret(&expected_secret);
        let ui = h.ui_events();
        assert_eq!(
            ui,
            vec![
                UiEvent::TaskStarted(TaskKind::KeyExchange),
                UiEvent::DisplayChecksum(checksum),
                UiEvent::TaskFinished {
                    task: TaskKind::KeyExchange,
                    result: Ok(Outcome::KeyExchanged {
                        key_number: 2,
                        checksum
                    })
                },
            ]
        );

        // Not committed until confirmed.
        assert_eq!(h.machine().key().map(|k| k.key_number), Some(1));
        assert!(h.machine().session().key_exchange.is_none());

        h.send(Event::KeyConfirmed);
        let expected = KeyMaterial {
            key_number: 2,
            secret: expected_secret,
        };
        assert_eq!(h.machine().key(), Some(&expected));
        assert_eq!(h.store.0.lock().key, Some(expected));
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::KeyCommitted { key_number: 2 }]
        );
    }

    #[test]
    fn test_cfg_out_notification_before_subscribe_ack_is_ignored() {
        let mut h = Harness::configured();
        h.send(Event::StartKeyExchange(0));
        h.connect();

        h.send(Event::NotificationReceived(Channel::CfgOut, vec![0u8; 18]));
        assert_eq!(
            h.state(),
            State::KeyExchange(KeyExchangeStep::WaitCfgOutSubscribeAck)
        );
        assert!(h.writes(Channel::CfgIn).is_empty());
    }

    #[test]
    fn test_server_key_out_of_order_is_protocol_violation() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(3);
        h.ui_events();

        let server = EcdhKeypair::generate(&mut StdRng::seed_from_u64(1));
        let [_, second] = split_value(&server.public_bytes(), 3);
        h.send(Event::NotificationReceived(Channel::CfgOut, second.to_vec()));

        assert_eq!(h.state(), State::Idle);
        assert!(h.machine().pending_key().is_none());
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::KeyExchange,
                result: Err(TaskError::ProtocolViolation)
            }]
        );
    }

    #[test]
    fn test_server_key_for_other_slot_is_protocol_violation() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(3);
        h.ui_events();

        let [first, _] = split_value(&[5u8; 32], 2);
        h.send(Event::NotificationReceived(Channel::CfgOut, first.to_vec()));
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::KeyExchange,
                result: Err(TaskError::ProtocolViolation)
            }]
        );
    }

    #[test]
    fn test_short_server_key_is_malformed() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(0);
        h.ui_events();

        h.send(Event::NotificationReceived(Channel::CfgOut, vec![0u8; 17]));
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::KeyExchange,
                result: Err(TaskError::MalformedNotification)
            }]
        );
    }

    #[test]
    fn test_stale_confirmation_rejected() {
        let mut h = Harness::configured();
        h.send(Event::KeyConfirmed);

        assert_eq!(
            h.ui_events(),
            vec![UiEvent::Rejected(TaskError::NoSharedSecretToConfirm)]
        );
        assert_eq!(
            h.machine().key(),
            Some(&KeyMaterial {
                key_number: 1,
                secret: SECRET
            })
        );
        assert_eq!(h.state(), State::Idle);
    }

    #[test]
    fn test_failed_exchange_leaves_nothing_to_confirm() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(0);
        h.send(Event::Failure);
        h.ui_events();

        h.send(Event::KeyConfirmed);
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::Rejected(TaskError::NoSharedSecretToConfirm)]
        );
        assert_eq!(h.machine().key().map(|k| k.key_number), Some(1));
    }

    #[test]
    fn test_denied_key_is_discarded() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(0);
        let server = EcdhKeypair::generate(&mut StdRng::seed_from_u64(5));
        for chunk in split_value(&server.public_bytes(), 0) {
            h.send(Event::NotificationReceived(Channel::CfgOut, chunk.to_vec()));
        }
        assert!(h.machine().pending_key().is_some());
        h.ui_events();

        h.send(Event::KeyDenied);
        assert!(h.machine().pending_key().is_none());
        assert_eq!(h.ui_events(), vec![UiEvent::KeyDiscarded]);

        h.send(Event::KeyConfirmed);
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::Rejected(TaskError::NoSharedSecretToConfirm)]
        );
    }

    #[test]
    fn test_new_exchange_clears_pending_key() {
        let mut h = Harness::configured();
        h.run_key_exchange_to_server_key(0);
        let server = EcdhKeypair::generate(&mut StdRng::seed_from_u64(6));
        for chunk in split_value(&server.public_bytes(), 0) {
            h.send(Event::NotificationReceived(Channel::CfgOut, chunk.to_vec()));
        }
        assert!(h.machine().pending_key().is_some());

        h.send(Event::StartKeyExchange(1));
        assert!(h.machine().pending_key().is_none());
    }

    #[test]
    fn test_device_selection_requested_when_unknown() {
        let mut h = Harness::new(
            MemoryStore {
                key: Some(KeyMaterial {
                    key_number: 0,
                    secret: SECRET,
                }),
                endpoint: None,
            },
            RecordingTransport::default(),
        );

        h.send(Event::StartUnlock);
        assert_eq!(
            h.state(),
            State::Unlock(UnlockStep::Link(LinkStep::WaitDeviceSelected))
        );
        assert_eq!(
            h.ui_events(),
            vec![
                UiEvent::TaskStarted(TaskKind::Unlock),
                UiEvent::SelectDevice
            ]
        );

        h.send(Event::DeviceSelected("11:22:33:44:55:66".into()));
        assert_eq!(h.calls(), vec![Call::Connect("11:22:33:44:55:66".into())]);
        assert_eq!(
            h.store.0.lock().endpoint.as_deref(),
            Some("11:22:33:44:55:66")
        );
    }

    #[test]
    fn test_device_selection_cancelled() {
        let mut h = Harness::new(
            MemoryStore {
                key: Some(KeyMaterial {
                    key_number: 0,
                    secret: SECRET,
                }),
                endpoint: None,
            },
            RecordingTransport::default(),
        );
        h.send(Event::StartUnlock);
        h.ui_events();

        h.send(Event::Failure);
        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::Unlock,
                result: Err(TaskError::NoEndpointSelected)
            }]
        );
    }

    #[test]
    fn test_device_selected_while_idle_updates_endpoint() {
        let mut h = Harness::configured();
        h.send(Event::DeviceSelected("01:02:03:04:05:06".into()));

        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.machine().endpoint(), Some("01:02:03:04:05:06"));
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_bluetooth_disabled_requests_enable() {
        let mut h = Harness::new(
            MemoryStore {
                key: Some(KeyMaterial {
                    key_number: 0,
                    secret: SECRET,
                }),
                endpoint: Some(LOCK.into()),
            },
            RecordingTransport {
                enabled: false,
                ..RecordingTransport::default()
            },
        );

        h.send(Event::StartUnlock);
        assert_eq!(h.calls(), vec![Call::RequestEnable]);
        assert_eq!(
            h.state(),
            State::Unlock(UnlockStep::Link(LinkStep::WaitBtEnabled))
        );

        h.send(Event::Failure);
        assert!(h.ui_events().contains(&UiEvent::TaskFinished {
            task: TaskKind::Unlock,
            result: Err(TaskError::TransportUnavailable)
        }));
    }

    #[test]
    fn test_bluetooth_enabled_later_continues() {
        let mut h = Harness::new(
            MemoryStore {
                key: Some(KeyMaterial {
                    key_number: 0,
                    secret: SECRET,
                }),
                endpoint: Some(LOCK.into()),
            },
            RecordingTransport {
                enabled: false,
                ..RecordingTransport::default()
            },
        );

        h.send(Event::StartUnlock);
        h.send(Event::BluetoothEnabled);
        assert_eq!(
            h.state(),
            State::Unlock(UnlockStep::Link(LinkStep::WaitConnected))
        );
    }

    #[test]
    fn test_missing_service() {
        let mut h = Harness::new(
            MemoryStore {
                key: Some(KeyMaterial {
                    key_number: 0,
                    secret: SECRET,
                }),
                endpoint: Some(LOCK.into()),
            },
            RecordingTransport {
                service: false,
                ..RecordingTransport::default()
            },
        );
        h.send(Event::StartUnlock);
        h.connect();

        assert_eq!(h.state(), State::Idle);
        assert!(h.ui_events().contains(&UiEvent::TaskFinished {
            task: TaskKind::Unlock,
            result: Err(TaskError::RequiredServiceMissing)
        }));
    }

    #[test]
    fn test_missing_characteristic() {
        let mut h = Harness::new(
            MemoryStore::default(),
            RecordingTransport {
                missing: vec![Channel::CfgIn],
                ..RecordingTransport::default()
            },
        );
        h.send(Event::DeviceSelected(LOCK.into()));
        h.send(Event::StartKeyExchange(0));
        h.connect();

        assert_eq!(h.state(), State::Idle);
        assert!(!h.calls().contains(&Call::Subscribe(Channel::CfgOut)));
        assert!(h.ui_events().contains(&UiEvent::TaskFinished {
            task: TaskKind::KeyExchange,
            result: Err(TaskError::RequiredCharacteristicMissing)
        }));
    }

    #[test]
    fn test_connection_failure() {
        let mut h = Harness::configured();
        h.send(Event::StartKeyExchange(0));
        h.ui_events();
        h.send(Event::Failure);

        assert_eq!(
            h.ui_events(),
            vec![UiEvent::TaskFinished {
                task: TaskKind::KeyExchange,
                result: Err(TaskError::ConnectionFailed)
            }]
        );
    }
}
