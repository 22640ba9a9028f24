// Transport abstraction
//
// The session never talks to a BLE stack directly. It issues requests
// through `Transport` and learns about their outcome from `TransportEvent`s
// delivered on a channel. Requests return once the request has been issued;
// completion (connected, services found, write done, value arrived) always
// comes back as an event, so the session reacts to real and mock stacks
// the same way.

#[cfg(feature = "btle")]
pub mod btle;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{OtaError, OtaResult};
use crate::scanner::{Advertisement, PeripheralIdentity};

/// Depth of the transport -> session event queue. Notifications arrive in
/// bursts during a transfer; the session drains them quickly.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Tag attached to a write so its completion can be matched to the request
/// that is still outstanding. Completions carrying any other ticket are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WriteTicket(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }

    /// Comma-separated list for display, e.g. `"read, notify"`.
    pub fn describe(&self) -> String {
        let flags = [
            (self.read, "read"),
            (self.write, "write"),
            (self.write_without_response, "write without response"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service: Uuid,
    pub properties: CharProperties,
}

/// Everything the stack reports back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Discovered(Advertisement),
    Connected,
    ServicesFound(Vec<Uuid>),
    CharacteristicsFound {
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    /// Notification, indication or read result.
    ValueUpdated { channel: Uuid, value: Vec<u8> },
    WriteCompleted { channel: Uuid, ticket: WriteTicket },
    Disconnected,
    /// An issued request failed after it was accepted.
    Failed(OtaError),
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_DEPTH)
}

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait Transport: Send {
    /// Begin reporting advertisements as `Discovered` events.
    async fn start_scan(&mut self) -> OtaResult<()>;

    async fn stop_scan(&mut self) -> OtaResult<()>;

    /// Completes with `Connected` or `Failed`.
    async fn connect(&mut self, peripheral: &PeripheralIdentity) -> OtaResult<()>;

    /// Drop the link. Not reported back as an event; only link loss
    /// produces `Disconnected`. Safe to call when not connected.
    async fn disconnect(&mut self) -> OtaResult<()>;

    /// Completes with `ServicesFound`.
    async fn discover_services(&mut self) -> OtaResult<()>;

    /// Completes with `CharacteristicsFound` for `service`.
    async fn discover_characteristics(&mut self, service: Uuid) -> OtaResult<()>;

    /// Enable or disable notifications. Values arrive as `ValueUpdated`.
    async fn set_notify(&mut self, channel: Uuid, enabled: bool) -> OtaResult<()>;

    /// Read a characteristic. The value arrives as `ValueUpdated`.
    async fn read(&mut self, channel: Uuid) -> OtaResult<()>;

    /// Completes with `WriteCompleted` carrying `ticket`.
    async fn write(
        &mut self,
        channel: Uuid,
        bytes: Vec<u8>,
        mode: WriteMode,
        ticket: WriteTicket,
    ) -> OtaResult<()>;

    /// Largest single write the link accepts on `channel`.
    fn max_payload_size(&self, channel: Uuid, mode: WriteMode) -> usize;
}
