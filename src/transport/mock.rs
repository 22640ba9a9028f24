// Recording transport for session tests
//
// Records every request and never produces events on its own. Tests drive
// the session by feeding it the `TransportEvent`s a real stack would send.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{Transport, WriteMode, WriteTicket};
use crate::error::{OtaError, OtaResult};
use crate::scanner::PeripheralIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    SetNotify(Uuid, bool),
    Read(Uuid),
    Write {
        channel: Uuid,
        bytes: Vec<u8>,
        mode: WriteMode,
        ticket: WriteTicket,
    },
}

/// Clones share the call log, so a test can keep one handle while the
/// session owns the other.
#[derive(Debug, Clone)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    max_payload: usize,
    fail_writes: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            max_payload: 512,
            fail_writes: false,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Writes issued to `channel`, in order.
    pub fn writes_to(&self, channel: Uuid) -> Vec<(Vec<u8>, WriteTicket)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::Write {
                    channel: c,
                    bytes,
                    ticket,
                    ..
                } if *c == channel => Some((bytes.clone(), *ticket)),
                _ => None,
            })
            .collect()
    }

    pub fn last_write_to(&self, channel: Uuid) -> Option<(Vec<u8>, WriteTicket)> {
        self.writes_to(channel).pop()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(&mut self) -> OtaResult<()> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&mut self) -> OtaResult<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&mut self, peripheral: &PeripheralIdentity) -> OtaResult<()> {
        self.record(Call::Connect(peripheral.id.clone()));
        Ok(())
    }

    async fn disconnect(&mut self) -> OtaResult<()> {
        self.record(Call::Disconnect);
        Ok(())
    }

    async fn discover_services(&mut self) -> OtaResult<()> {
        self.record(Call::DiscoverServices);
        Ok(())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> OtaResult<()> {
        self.record(Call::DiscoverCharacteristics(service));
        Ok(())
    }

    async fn set_notify(&mut self, channel: Uuid, enabled: bool) -> OtaResult<()> {
        self.record(Call::SetNotify(channel, enabled));
        Ok(())
    }

    async fn read(&mut self, channel: Uuid) -> OtaResult<()> {
        self.record(Call::Read(channel));
        Ok(())
    }

    async fn write(
        &mut self,
        channel: Uuid,
        bytes: Vec<u8>,
        mode: WriteMode,
        ticket: WriteTicket,
    ) -> OtaResult<()> {
        self.record(Call::Write {
            channel,
            bytes,
            mode,
            ticket,
        });
        if self.fail_writes {
            return Err(OtaError::WriteFailed("mock write rejected".to_string()));
        }
        Ok(())
    }

    fn max_payload_size(&self, _channel: Uuid, _mode: WriteMode) -> usize {
        self.max_payload
    }
}
