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

//! Event vocabulary and the serialized event loop.

use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bluetooth::{Channel, Transport};
use crate::crypto::Checksum;
use crate::error::TaskError;
use crate::protocol::ProtocolMachine;

/// Everything that can drive the protocol machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // User intents.
    /// Unlock the door with the configured key.
    StartUnlock,
    /// Exchange a new key for the given key slot.
    StartKeyExchange(u8),
    /// User confirmed the displayed checksum.
    KeyConfirmed,
    /// User rejected the displayed checksum.
    KeyDenied,
    /// An endpoint address was chosen.
    DeviceSelected(String),
    /// The radio is powered.
    BluetoothEnabled,

    // Transport events.
    Connected,
    Disconnected,
    ServicesDiscovered,
    SubscribeAck(Channel),
    NotificationReceived(Channel, Vec<u8>),
    WriteAck(Channel),
    /// The last request failed.
    Failure,
}

/// Sending half of the event queue.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending half of the UI notification channel.
pub type UiSender = mpsc::UnboundedSender<UiEvent>;

/// The two tasks the machine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Unlock,
    KeyExchange,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Unlock => f.write_str("unlock"),
            TaskKind::KeyExchange => f.write_str("key exchange"),
        }
    }
}

/// Successful result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    DoorUnlocked,
    /// A shared secret was derived and awaits user confirmation.
    KeyExchanged { key_number: u8, checksum: Checksum },
}

/// Notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    TaskStarted(TaskKind),
    TaskFinished {
        task: TaskKind,
        result: Result<Outcome, TaskError>,
    },
    /// Checksum of a freshly derived shared secret.
    DisplayChecksum(Checksum),
    /// No endpoint is known; the UI should let the user pick one.
    SelectDevice,
    /// A confirmed key became the active key.
    KeyCommitted { key_number: u8 },
    /// A derived key was denied and dropped.
    KeyDiscarded,
    /// A request was refused without starting a task.
    Rejected(TaskError),
}

/// Create the event queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Feeds queued events into the machine one at a time.
pub struct EventLoop<T: Transport> {
    machine: ProtocolMachine<T>,
    events: EventReceiver,
}

impl<T: Transport> EventLoop<T> {
    pub fn new(machine: ProtocolMachine<T>, events: EventReceiver) -> Self {
        Self { machine, events }
    }

    pub fn machine(&self) -> &ProtocolMachine<T> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut ProtocolMachine<T> {
        &mut self.machine
    }

    /// Handle every event already queued, including events queued while
    /// handling. Returns the number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.machine.handle(event);
            handled += 1;
        }
        handled
    }

    /// Run until the queue closes. The machine holds a sender of its own,
    /// so in practice this runs until the task is aborted.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await;
    }

    /// Run until `stop` completes or the queue closes, then hand the loop
    /// back. Events queued before `stop` fires are still handled.
    pub async fn run_until<F: Future<Output = ()>>(mut self, stop: F) -> Self {
        info!("Event loop started");
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.machine.handle(event),
                    None => {
                        debug!("Event queue closed, exiting event loop");
                        break;
                    }
                },
                () = &mut stop => {
                    debug!("Event loop stopped");
                    break;
                }
            }
        }
        self
    }

    /// Wait for the transport to finish closing the link.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.machine.transport_mut().take_close_task() {
            debug!("Waiting for the link to close");
            if let Err(e) = task.await {
                warn!("Closing the link failed: {}", e);
            }
        }
    }
}
