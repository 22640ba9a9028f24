// OTA session state machine
//
// One `Session` drives one peripheral through connect, GATT discovery, the
// START handshake, the lock-step frame transfer and the END handshake.
// It is mutated only by its own task (see `handle.rs`); observers read
// `SessionSnapshot`s published through a watch channel.

mod handle;

pub use handle::{Command, SessionHandle};

use serde::{Serialize, Serializer};
use std::fmt;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble_common::short_uuid;
use crate::command::{
    decode_ack, decode_ack_checked, decode_sector_ack, encode_end, encode_start, AckStatus,
    CommandId, SectorAckStatus,
};
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::framer::{build_frames, FirmwareImage, Frame, FRAME_OVERHEAD, MAX_CHUNK_SIZE};
use crate::scanner::{Advertisement, PeripheralIdentity, PeripheralRegistry};
use crate::transport::{CharacteristicInfo, Transport, TransportEvent, WriteMode, WriteTicket};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Ready,
    Handshaking,
    Transferring,
    Completing,
    Error,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::ServiceDiscovery => "service discovery",
            Phase::CharacteristicDiscovery => "characteristic discovery",
            Phase::Ready => "ready",
            Phase::Handshaking => "handshaking",
            Phase::Transferring => "transferring",
            Phase::Completing => "completing",
            Phase::Error => "error",
        }
    }

    /// Phases in which the current link's characteristics are known.
    fn has_characteristics(self) -> bool {
        matches!(
            self,
            Phase::CharacteristicDiscovery
                | Phase::Ready
                | Phase::Handshaking
                | Phase::Transferring
                | Phase::Completing
        )
    }

    /// Phases with no deadline running.
    fn is_resting(self) -> bool {
        matches!(self, Phase::Idle | Phase::Ready | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything an observer may read about a session, as one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub status: String,
    pub connecting: bool,
    pub target: Option<PeripheralIdentity>,
    pub characteristics: Vec<CharacteristicInfo>,
    pub firmware_version: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub frames_sent: usize,
    pub total_frames: usize,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<OtaError>,
    pub scanning: bool,
    pub peripherals: Vec<PeripheralIdentity>,
}

fn serialize_error<S: Serializer>(error: &Option<OtaError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            status: "Idle".to_string(),
            connecting: false,
            target: None,
            characteristics: Vec::new(),
            firmware_version: None,
            progress: 0,
            frames_sent: 0,
            total_frames: 0,
            last_error: None,
            scanning: false,
            peripherals: Vec::new(),
        }
    }
}

/// The image being sent and the single write slot.
struct Transfer {
    image: FirmwareImage,
    frames: Vec<Frame>,
    next: usize,
    in_flight: Option<WriteTicket>,
    end_sent: bool,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    phase: Phase,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session<T: Transport> {
    transport: T,
    config: OtaConfig,
    phase: Phase,
    status: String,
    connecting: bool,
    target: Option<PeripheralIdentity>,
    characteristics: Vec<CharacteristicInfo>,
    pending_services: Vec<Uuid>,
    firmware_version: Option<String>,
    progress: u8,
    frames_sent: usize,
    total_frames: usize,
    last_error: Option<OtaError>,
    transfer: Option<Transfer>,
    registry: PeripheralRegistry,
    scanning: bool,
    next_ticket: u64,
    deadline: Option<Deadline>,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: OtaConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            transport,
            registry: PeripheralRegistry::new(config.scan.service_filter),
            config,
            phase: Phase::Idle,
            status: "Idle".to_string(),
            connecting: false,
            target: None,
            characteristics: Vec::new(),
            pending_services: Vec::new(),
            firmware_version: None,
            progress: 0,
            frames_sent: 0,
            total_frames: 0,
            last_error: None,
            transfer: None,
            scanning: false,
            next_ticket: 0,
            deadline: None,
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            status: self.status.clone(),
            connecting: self.connecting,
            target: self.target.clone(),
            characteristics: self.characteristics.clone(),
            firmware_version: self.firmware_version.clone(),
            progress: self.progress,
            frames_sent: self.frames_sent,
            total_frames: self.total_frames,
            last_error: self.last_error.clone(),
            scanning: self.scanning,
            peripherals: self.registry.peripherals().to_vec(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the next frame to send; equals the number of frames whose
    /// writes have completed.
    pub fn current_frame_index(&self) -> usize {
        self.frames_sent
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// When the running phase deadline expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn connect(&mut self, peripheral: PeripheralIdentity) -> OtaResult<()> {
        if !matches!(self.phase, Phase::Idle | Phase::Error) {
            tlog!(
                "[session] Connect requested in {} phase, dropping current session",
                self.phase
            );
            if let Err(e) = self.transport.disconnect().await {
                tlog!("[session] Disconnect before reconnect failed: {}", e);
            }
        }
        self.clear_session();

        tlog!(
            "[session] Connecting to {} ({})",
            peripheral.name,
            peripheral.id
        );
        let status = format!("Connecting to {}", peripheral.name);
        self.target = Some(peripheral.clone());
        self.connecting = true;
        self.enter(Phase::Connecting, status);
        self.arm_deadline(self.config.timeouts.connect());

        let result = self.transport.connect(&peripheral).await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        self.publish();
        result
    }

    /// Validate `image`, build its frames and send START.
    /// Rejections leave the session untouched.
    pub async fn start_ota(&mut self, image: FirmwareImage) -> OtaResult<()> {
        if self.phase != Phase::Ready {
            return Err(OtaError::NotReady(self.phase));
        }
        let gatt = &self.config.gatt;
        // Both OTA characteristics must live under the configured OTA service
        for required in [gatt.data_char, gatt.command_char] {
            let found = self
                .characteristics
                .iter()
                .any(|c| c.uuid == required && c.service == gatt.service);
            if !found {
                return Err(OtaError::MissingCharacteristic(required));
            }
        }
        let data_char = gatt.data_char;
        let command_char = gatt.command_char;

        let link_limit = self
            .transport
            .max_payload_size(data_char, WriteMode::WithResponse)
            .saturating_sub(FRAME_OVERHEAD);
        let chunk_size = self
            .config
            .transfer
            .chunk_size
            .min(MAX_CHUNK_SIZE)
            .min(link_limit);
        let layout = self.config.layout(chunk_size)?;
        layout.check_image(image.len())?;
        let image_len = u32::try_from(image.len()).map_err(|_| OtaError::ImageTooLarge {
            len: image.len(),
            max: u32::MAX as usize,
        })?;

        let frames = build_frames(image.as_bytes(), &layout);
        tlog!(
            "[session] Starting OTA: {} bytes, sha256 {}, {} sectors, {} frames of {} bytes",
            image.len(),
            image.sha256_hex(),
            layout.sector_count(image.len()),
            frames.len(),
            chunk_size
        );

        self.progress = 0;
        self.frames_sent = 0;
        self.total_frames = frames.len();
        self.last_error = None;
        self.transfer = Some(Transfer {
            image,
            frames,
            next: 0,
            in_flight: None,
            end_sent: false,
        });
        self.enter(Phase::Handshaking, "Waiting for START acknowledgement");
        self.arm_deadline(self.config.timeouts.ack());

        let packet = encode_start(image_len);
        let ticket = self.take_ticket();
        tlog!("[session] START -> {}", hex::encode(packet));
        let result = self
            .transport
            .write(command_char, packet.to_vec(), WriteMode::WithResponse, ticket)
            .await;
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        self.publish();
        result
    }

    /// Back to `Idle` without touching the transport.
    pub fn reset(&mut self) {
        tlog!("[session] Reset in {} phase", self.phase);
        self.clear_session();
        self.enter(Phase::Idle, "Idle");
        self.publish();
    }

    pub async fn disconnect(&mut self) -> OtaResult<()> {
        let result = self.transport.disconnect().await;
        if let Err(e) = &result {
            tlog!("[session] Disconnect failed: {}", e);
        }
        self.clear_session();
        self.enter(Phase::Idle, "Disconnected");
        self.publish();
        result
    }

    /// Forget discovered peripherals and scan again.
    pub async fn rescan(&mut self) -> OtaResult<()> {
        self.registry.clear();
        if self.scanning {
            if let Err(e) = self.transport.stop_scan().await {
                tlog!("[session] Stopping previous scan failed: {}", e);
            }
        }
        let result = self.transport.start_scan().await;
        self.scanning = result.is_ok();
        self.publish();
        result
    }

    pub async fn stop_scan(&mut self) -> OtaResult<()> {
        self.scanning = false;
        let result = self.transport.stop_scan().await;
        self.publish();
        result
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(advertisement) => self.on_discovered(advertisement),
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::ServicesFound(services) => self.on_services(services).await,
            TransportEvent::CharacteristicsFound {
                service,
                characteristics,
            } => self.on_characteristics(service, characteristics).await,
            TransportEvent::ValueUpdated { channel, value } => {
                self.on_value(channel, value).await
            }
            TransportEvent::WriteCompleted { channel, ticket } => {
                self.on_write_completed(channel, ticket).await
            }
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Failed(error) => {
                if self.phase == Phase::Idle {
                    tlog!("[session] Ignoring transport failure while idle: {}", error);
                } else {
                    tlog!("[session] Transport failure: {}", error);
                    self.fail(error);
                }
            }
        }
        self.publish();
    }

    /// Fire the running deadline if it still belongs to the current phase.
    pub async fn expire_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        if deadline.phase != self.phase {
            return;
        }
        tlog!("[session] Deadline expired in {} phase", self.phase);
        if self.phase == Phase::Connecting {
            if let Err(e) = self.transport.disconnect().await {
                tlog!("[session] Cancelling connect failed: {}", e);
            }
        }
        self.fail(OtaError::Timeout(deadline.phase));
        self.publish();
    }

    fn on_discovered(&mut self, advertisement: Advertisement) {
        if let Some(peripheral) = self.registry.record(advertisement) {
            tlog!(
                "[session] Discovered {} ({}) rssi {:?}",
                peripheral.name,
                peripheral.id,
                peripheral.rssi
            );
        }
    }

    async fn on_connected(&mut self) {
        if self.phase != Phase::Connecting {
            tlog!("[session] Ignoring Connected in {} phase", self.phase);
            return;
        }
        self.connecting = false;
        self.enter(Phase::ServiceDiscovery, "Discovering services");
        self.arm_deadline(self.config.timeouts.discovery());
        if let Err(e) = self.transport.discover_services().await {
            self.fail(e);
        }
    }

    async fn on_services(&mut self, services: Vec<Uuid>) {
        if self.phase != Phase::ServiceDiscovery {
            tlog!("[session] Ignoring ServicesFound in {} phase", self.phase);
            return;
        }
        if services.is_empty() {
            self.fail_with(
                "no services",
                OtaError::DiscoveryFailed("peripheral exposes no services".to_string()),
            );
            return;
        }

        let listed: Vec<String> = services.iter().map(short_uuid).collect();
        tlog!("[session] Services: {}", listed.join(", "));
        self.pending_services = services.clone();
        let deadline = self.deadline;
        self.enter(Phase::CharacteristicDiscovery, "Discovering characteristics");
        // Discovery shares one deadline across both phases
        self.deadline = deadline.map(|d| Deadline {
            phase: Phase::CharacteristicDiscovery,
            ..d
        });

        for service in services {
            if let Err(e) = self.transport.discover_characteristics(service).await {
                self.fail(e);
                return;
            }
        }
    }

    async fn on_characteristics(&mut self, service: Uuid, found: Vec<CharacteristicInfo>) {
        if self.phase != Phase::CharacteristicDiscovery {
            tlog!(
                "[session] Ignoring characteristics of {} in {} phase",
                short_uuid(&service),
                self.phase
            );
            return;
        }
        let Some(position) = self.pending_services.iter().position(|s| *s == service) else {
            tlog!(
                "[session] Ignoring characteristics of unrequested service {}",
                short_uuid(&service)
            );
            return;
        };
        self.pending_services.remove(position);

        for characteristic in found {
            tlog!(
                "[session]   {} / {} [{}]",
                short_uuid(&characteristic.service),
                short_uuid(&characteristic.uuid),
                characteristic.properties.describe()
            );
            if characteristic.properties.can_notify() {
                if let Err(e) = self.transport.set_notify(characteristic.uuid, true).await {
                    tlog!(
                        "[session] Enabling notifications on {} failed: {}",
                        short_uuid(&characteristic.uuid),
                        e
                    );
                }
            }
            if characteristic.uuid == self.config.gatt.firmware_version_char {
                if let Err(e) = self.transport.read(characteristic.uuid).await {
                    tlog!("[session] Firmware version read failed: {}", e);
                }
            }
            match self
                .characteristics
                .iter_mut()
                .find(|c| c.uuid == characteristic.uuid)
            {
                Some(existing) => *existing = characteristic,
                None => self.characteristics.push(characteristic),
            }
        }

        if !self.pending_services.is_empty() {
            return;
        }
        if self.characteristics.is_empty() {
            self.fail(OtaError::DiscoveryFailed(
                "peripheral exposes no characteristics".to_string(),
            ));
            return;
        }
        self.enter(Phase::Ready, "Ready");
    }

    async fn on_value(&mut self, channel: Uuid, value: Vec<u8>) {
        let gatt = &self.config.gatt;
        if channel == gatt.firmware_version_char {
            // Only reads issued during this link's discovery count
            if self.target.is_none() || !self.phase.has_characteristics() {
                tlog!("[session] Ignoring firmware version in {} phase", self.phase);
                return;
            }
            let version = String::from_utf8_lossy(&value)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            tlog!("[session] Firmware version: {}", version);
            self.firmware_version = Some(version);
        } else if channel == gatt.command_char {
            self.on_command_notification(&value).await;
        } else if channel == gatt.data_char {
            match decode_sector_ack(&value) {
                Ok(ack) if ack.status == SectorAckStatus::Success => {
                    tlog!("[session] Sector {} acknowledged", ack.sector);
                }
                Ok(ack) => {
                    tlog!(
                        "[session] Sector {} reported {:?}",
                        ack.sector,
                        ack.status
                    );
                }
                Err(e) => tlog!("[session] Dropping data notification: {}", e),
            }
        } else {
            tlog!(
                "[session] {} -> {}",
                short_uuid(&channel),
                hex::encode(&value)
            );
        }
    }

    async fn on_command_notification(&mut self, value: &[u8]) {
        let decoded = if self.config.transfer.verify_ack_crc {
            decode_ack_checked(value)
        } else {
            decode_ack(value)
        };
        let ack = match decoded {
            Ok(ack) => ack,
            Err(e) => {
                tlog!(
                    "[session] Dropping command notification {}: {}",
                    hex::encode(value),
                    e
                );
                return;
            }
        };
        if ack.command != CommandId::Ack {
            tlog!("[session] Ignoring {} on command channel", ack.command);
            return;
        }
        let end_sent = self.transfer.as_ref().is_some_and(|t| t.end_sent);

        match (self.phase, ack.acked) {
            (Phase::Handshaking, CommandId::Start) => {
                if ack.status == AckStatus::Accept {
                    self.enter(Phase::Transferring, "Transferring");
                    self.send_next().await;
                } else {
                    tlog!("[session] START refused with {:?}", ack.status);
                    self.fail_with("start refused", OtaError::CommandRefused(CommandId::Start));
                }
            }
            (Phase::Transferring, CommandId::End) if end_sent => {
                if ack.status == AckStatus::Accept {
                    self.enter(Phase::Completing, "Completing");
                    self.finish();
                } else {
                    tlog!("[session] END refused with {:?}", ack.status);
                    self.fail_with("end refused", OtaError::CommandRefused(CommandId::End));
                }
            }
            (phase, acked) => {
                tlog!("[session] Ignoring ACK for {} in {} phase", acked, phase);
            }
        }
    }

    async fn on_write_completed(&mut self, channel: Uuid, ticket: WriteTicket) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if self.phase != Phase::Transferring || transfer.in_flight != Some(ticket) {
            if channel == self.config.gatt.data_char {
                tlog!("[session] Ignoring stale write completion {:?}", ticket);
            }
            return;
        }
        transfer.in_flight = None;
        transfer.next += 1;
        let total = transfer.frames.len();
        self.frames_sent = transfer.next;
        self.progress = (self.frames_sent * 100 / total) as u8;
        self.send_next().await;
    }

    fn on_disconnected(&mut self) {
        if self.phase == Phase::Idle && self.target.is_none() {
            return;
        }
        tlog!("[session] Peripheral disconnected in {} phase", self.phase);
        self.clear_session();
        self.enter(Phase::Idle, "Disconnected");
    }

    // ------------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------------

    /// Send the frame at the cursor, or END once every frame is written.
    async fn send_next(&mut self) {
        let ticket = self.take_ticket();
        let gatt = &self.config.gatt;
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        let (channel, bytes, timeout) = match transfer.frames.get(transfer.next) {
            Some(frame) => {
                transfer.in_flight = Some(ticket);
                (gatt.data_char, frame.encode(), self.config.timeouts.write())
            }
            None => {
                transfer.end_sent = true;
                let packet = encode_end();
                tlog!(
                    "[session] All {} frames written, END -> {}",
                    transfer.frames.len(),
                    hex::encode(packet)
                );
                (gatt.command_char, packet.to_vec(), self.config.timeouts.ack())
            }
        };
        self.arm_deadline(timeout);

        if let Err(e) = self
            .transport
            .write(channel, bytes, WriteMode::WithResponse, ticket)
            .await
        {
            self.fail(e);
        }
    }

    fn finish(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            tlog!(
                "[session] OTA of {} bytes completed",
                transfer.image.len()
            );
        }
        self.progress = 100;
        self.enter(Phase::Idle, "OTA completed");
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn enter(&mut self, phase: Phase, status: impl Into<String>) {
        let status = status.into();
        if phase != self.phase {
            tlog!("[session] {} -> {}: {}", self.phase, phase, status);
        }
        self.phase = phase;
        self.status = status;
        if phase.is_resting() {
            self.deadline = None;
        }
    }

    fn fail(&mut self, error: OtaError) {
        let status = error.to_string();
        self.fail_with(&status, error);
    }

    fn fail_with(&mut self, status: &str, error: OtaError) {
        self.connecting = false;
        self.transfer = None;
        self.pending_services.clear();
        self.last_error = Some(error);
        self.enter(Phase::Error, status);
    }

    fn clear_session(&mut self) {
        self.connecting = false;
        self.target = None;
        self.characteristics.clear();
        self.pending_services.clear();
        self.firmware_version = None;
        self.progress = 0;
        self.frames_sent = 0;
        self.total_frames = 0;
        self.last_error = None;
        self.transfer = None;
        self.deadline = None;
    }

    fn arm_deadline(&mut self, timeout: Option<std::time::Duration>) {
        self.deadline = timeout.map(|after| Deadline {
            at: Instant::now() + after,
            phase: self.phase,
        });
    }

    fn take_ticket(&mut self) -> WriteTicket {
        self.next_ticket += 1;
        WriteTicket(self.next_ticket)
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_common::{
        FIRMWARE_VERSION_CHAR_UUID, OTA_COMMAND_CHAR_UUID, OTA_DATA_CHAR_UUID, OTA_SERVICE_UUID,
    };
    use crate::ble_common::uuid_from_u16;
    use crate::command::{encode_ack, encode_command};
    use crate::framer::FrameLayout;
    use crate::framer::SectorAddressing;
    use crate::transport::mock::{Call, MockTransport};
    use crate::transport::CharProperties;

    const DEVICE_INFO_SERVICE: Uuid = uuid_from_u16(0x180A);

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new((0..len).map(|i| (i * 7 % 251) as u8).collect::<Vec<u8>>())
    }

    fn peripheral() -> PeripheralIdentity {
        PeripheralIdentity::new("AA:BB:CC:DD:EE:FF", "ota-target")
    }

    fn ota_characteristics() -> Vec<CharacteristicInfo> {
        vec![
            CharacteristicInfo {
                uuid: OTA_DATA_CHAR_UUID,
                service: OTA_SERVICE_UUID,
                properties: CharProperties {
                    write: true,
                    write_without_response: true,
                    notify: true,
                    ..Default::default()
                },
            },
            CharacteristicInfo {
                uuid: OTA_COMMAND_CHAR_UUID,
                service: OTA_SERVICE_UUID,
                properties: CharProperties {
                    write: true,
                    indicate: true,
                    ..Default::default()
                },
            },
        ]
    }

    fn version_characteristic() -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: FIRMWARE_VERSION_CHAR_UUID,
            service: DEVICE_INFO_SERVICE,
            properties: CharProperties {
                read: true,
                ..Default::default()
            },
        }
    }

    fn ack(acked: CommandId, status: AckStatus) -> TransportEvent {
        TransportEvent::ValueUpdated {
            channel: OTA_COMMAND_CHAR_UUID,
            value: encode_ack(acked, status).to_vec(),
        }
    }

    fn completed(ticket: WriteTicket) -> TransportEvent {
        TransportEvent::WriteCompleted {
            channel: OTA_DATA_CHAR_UUID,
            ticket,
        }
    }

    async fn ready_session(mock: &MockTransport) -> Session<MockTransport> {
        ready_session_with(mock, OtaConfig::default()).await
    }

    async fn ready_session_with(
        mock: &MockTransport,
        config: OtaConfig,
    ) -> Session<MockTransport> {
        let mut session = Session::new(mock.clone(), config);
        session.connect(peripheral()).await.unwrap();
        session.handle_event(TransportEvent::Connected).await;
        session
            .handle_event(TransportEvent::ServicesFound(vec![
                OTA_SERVICE_UUID,
                DEVICE_INFO_SERVICE,
            ]))
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: OTA_SERVICE_UUID,
                characteristics: ota_characteristics(),
            })
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: DEVICE_INFO_SERVICE,
                characteristics: vec![version_characteristic()],
            })
            .await;
        assert_eq!(session.phase(), Phase::Ready);
        mock.clear();
        session
    }

    /// Ready session that has had START accepted and frame 0 in flight.
    async fn transferring_session(mock: &MockTransport, len: usize) -> Session<MockTransport> {
        let mut session = ready_session(mock).await;
        session.start_ota(image(len)).await.unwrap();
        session.handle_event(ack(CommandId::Start, AckStatus::Accept)).await;
        assert_eq!(session.phase(), Phase::Transferring);
        session
    }

    /// Complete the in-flight frame write.
    async fn complete_last_frame(session: &mut Session<MockTransport>, mock: &MockTransport) {
        let (_, ticket) = mock.last_write_to(OTA_DATA_CHAR_UUID).unwrap();
        session.handle_event(completed(ticket)).await;
    }

    #[tokio::test]
    async fn test_connect_and_discovery() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        let state = session.subscribe();

        session.connect(peripheral()).await.unwrap();
        assert_eq!(session.phase(), Phase::Connecting);
        assert!(state.borrow().connecting);
        assert_eq!(state.borrow().target, Some(peripheral()));
        assert!(session.deadline().is_some());

        session.handle_event(TransportEvent::Connected).await;
        assert_eq!(session.phase(), Phase::ServiceDiscovery);
        assert!(!state.borrow().connecting);

        session
            .handle_event(TransportEvent::ServicesFound(vec![
                OTA_SERVICE_UUID,
                DEVICE_INFO_SERVICE,
            ]))
            .await;
        assert_eq!(session.phase(), Phase::CharacteristicDiscovery);

        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: OTA_SERVICE_UUID,
                characteristics: ota_characteristics(),
            })
            .await;
        // Still waiting for the second service
        assert_eq!(session.phase(), Phase::CharacteristicDiscovery);

        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: DEVICE_INFO_SERVICE,
                characteristics: vec![version_characteristic()],
            })
            .await;
        assert_eq!(session.phase(), Phase::Ready);
        assert!(session.deadline().is_none());
        assert_eq!(state.borrow().characteristics.len(), 3);

        assert_eq!(
            mock.calls(),
            vec![
                Call::Connect("AA:BB:CC:DD:EE:FF".to_string()),
                Call::DiscoverServices,
                Call::DiscoverCharacteristics(OTA_SERVICE_UUID),
                Call::DiscoverCharacteristics(DEVICE_INFO_SERVICE),
                Call::SetNotify(OTA_DATA_CHAR_UUID, true),
                Call::SetNotify(OTA_COMMAND_CHAR_UUID, true),
                Call::Read(FIRMWARE_VERSION_CHAR_UUID),
            ]
        );
    }

    #[tokio::test]
    async fn test_firmware_version_published() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: FIRMWARE_VERSION_CHAR_UUID,
                value: b"v1.4.2\0".to_vec(),
            })
            .await;
        assert_eq!(session.snapshot().firmware_version.as_deref(), Some("v1.4.2"));
    }

    #[tokio::test]
    async fn test_firmware_version_from_previous_link_ignored() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session
            .connect(PeripheralIdentity::new("11:22", "other"))
            .await
            .unwrap();
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: FIRMWARE_VERSION_CHAR_UUID,
                value: b"v0.9.0".to_vec(),
            })
            .await;
        assert_eq!(session.phase(), Phase::Connecting);
        assert_eq!(session.snapshot().firmware_version, None);
    }

    #[tokio::test]
    async fn test_no_services_is_error() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.handle_event(TransportEvent::Connected).await;
        session.handle_event(TransportEvent::ServicesFound(Vec::new())).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Error);
        assert_eq!(snapshot.status, "no services");
        assert!(matches!(snapshot.last_error, Some(OtaError::DiscoveryFailed(_))));
    }

    #[tokio::test]
    async fn test_no_characteristics_is_error() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.handle_event(TransportEvent::Connected).await;
        session
            .handle_event(TransportEvent::ServicesFound(vec![OTA_SERVICE_UUID]))
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: OTA_SERVICE_UUID,
                characteristics: Vec::new(),
            })
            .await;
        assert_eq!(session.phase(), Phase::Error);
    }

    #[tokio::test]
    async fn test_happy_path() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        let firmware = image(5000);

        session.start_ota(firmware.clone()).await.unwrap();
        assert_eq!(session.phase(), Phase::Handshaking);
        let start = mock.writes_to(OTA_COMMAND_CHAR_UUID);
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].0, encode_start(5000).to_vec());
        assert!(mock.writes_to(OTA_DATA_CHAR_UUID).is_empty());

        session.handle_event(ack(CommandId::Start, AckStatus::Accept)).await;
        assert_eq!(session.phase(), Phase::Transferring);
        assert_eq!(session.snapshot().total_frames, 251);

        for sent in 1..=251 {
            complete_last_frame(&mut session, &mock).await;
            assert_eq!(session.current_frame_index(), sent);
        }
        assert_eq!(session.snapshot().progress, 100);

        let layout = FrameLayout::new(4096, 20, SectorAddressing::ByteOffset).unwrap();
        let expected: Vec<Vec<u8>> = build_frames(firmware.as_bytes(), &layout)
            .iter()
            .map(Frame::encode)
            .collect();
        let written: Vec<Vec<u8>> = mock
            .writes_to(OTA_DATA_CHAR_UUID)
            .into_iter()
            .map(|(bytes, _)| bytes)
            .collect();
        assert_eq!(written, expected);

        let commands = mock.writes_to(OTA_COMMAND_CHAR_UUID);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].0, encode_end().to_vec());
        assert_eq!(session.phase(), Phase::Transferring);

        session.handle_event(ack(CommandId::End, AckStatus::Accept)).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(snapshot.status, "OTA completed");
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.frames_sent, 251);
        assert!(session.deadline().is_none());
    }

    #[tokio::test]
    async fn test_start_refused() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session.start_ota(image(5000)).await.unwrap();
        session.handle_event(ack(CommandId::Start, AckStatus::Refuse)).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Error);
        assert_eq!(snapshot.status, "start refused");
        assert_eq!(
            snapshot.last_error,
            Some(OtaError::CommandRefused(CommandId::Start))
        );
        assert_eq!(session.current_frame_index(), 0);
        assert!(mock.writes_to(OTA_DATA_CHAR_UUID).is_empty());
    }

    #[tokio::test]
    async fn test_end_refused() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 100).await;
        for _ in 0..5 {
            complete_last_frame(&mut session, &mock).await;
        }
        session.handle_event(ack(CommandId::End, AckStatus::Refuse)).await;
        assert_eq!(session.snapshot().status, "end refused");
        assert_eq!(session.phase(), Phase::Error);
    }

    #[tokio::test]
    async fn test_end_ack_before_end_sent_is_ignored() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        session.handle_event(ack(CommandId::End, AckStatus::Accept)).await;
        assert_eq!(session.phase(), Phase::Transferring);
    }

    #[tokio::test]
    async fn test_lock_step() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        assert_eq!(mock.writes_to(OTA_DATA_CHAR_UUID).len(), 1);

        // Unrelated events do not advance the transfer
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_DATA_CHAR_UUID,
                value: vec![0, 0, 0, 0],
            })
            .await;
        session.handle_event(completed(WriteTicket(9999))).await;
        assert_eq!(mock.writes_to(OTA_DATA_CHAR_UUID).len(), 1);

        let (_, first) = mock.last_write_to(OTA_DATA_CHAR_UUID).unwrap();
        session.handle_event(completed(first)).await;
        assert_eq!(mock.writes_to(OTA_DATA_CHAR_UUID).len(), 2);

        // A repeated completion for frame 0 is stale
        session.handle_event(completed(first)).await;
        assert_eq!(mock.writes_to(OTA_DATA_CHAR_UUID).len(), 2);
        assert_eq!(session.current_frame_index(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        for _ in 0..10 {
            complete_last_frame(&mut session, &mock).await;
        }
        assert_eq!(session.current_frame_index(), 10);
        let (_, in_flight) = mock.last_write_to(OTA_DATA_CHAR_UUID).unwrap();
        let written = mock.writes_to(OTA_DATA_CHAR_UUID).len();

        session.handle_event(TransportEvent::Disconnected).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(snapshot.progress, 0);
        assert!(snapshot.characteristics.is_empty());
        assert!(!snapshot.connecting);

        session.handle_event(completed(in_flight)).await;
        assert_eq!(mock.writes_to(OTA_DATA_CHAR_UUID).len(), written);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_reset_keeps_transport() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        let (_, in_flight) = mock.last_write_to(OTA_DATA_CHAR_UUID).unwrap();
        mock.clear();

        session.reset();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.snapshot().target.is_none());

        session.handle_event(completed(in_flight)).await;
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_short_ack_dropped() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session.start_ota(image(5000)).await.unwrap();
        let before = session.snapshot();

        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_COMMAND_CHAR_UUID,
                value: vec![0x03, 0x00, 0x01, 0x00, 0x00],
            })
            .await;
        assert_eq!(session.snapshot(), before);
        assert!(mock.writes_to(OTA_DATA_CHAR_UUID).is_empty());
    }

    #[tokio::test]
    async fn test_ack_crc_enforced_by_default() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session.start_ota(image(5000)).await.unwrap();

        let mut corrupted = encode_ack(CommandId::Start, AckStatus::Accept);
        corrupted[19] ^= 0xFF;
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_COMMAND_CHAR_UUID,
                value: corrupted.to_vec(),
            })
            .await;
        assert_eq!(session.phase(), Phase::Handshaking);

        // A bare 6-byte ack has no CRC to check
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_COMMAND_CHAR_UUID,
                value: vec![0x03, 0x00, 0x01, 0x00, 0x00, 0x00],
            })
            .await;
        assert_eq!(session.phase(), Phase::Handshaking);
    }

    #[tokio::test]
    async fn test_unchecked_acks_when_disabled() {
        let mock = MockTransport::new();
        let mut config = OtaConfig::default();
        config.transfer.verify_ack_crc = false;
        let mut session = ready_session_with(&mock, config).await;
        session.start_ota(image(64)).await.unwrap();

        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_COMMAND_CHAR_UUID,
                value: vec![0x03, 0x00, 0x01, 0x00, 0x00, 0x00],
            })
            .await;
        assert_eq!(session.phase(), Phase::Transferring);
    }

    #[tokio::test]
    async fn test_non_ack_command_ignored() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session.start_ota(image(64)).await.unwrap();
        let echoed_start = encode_command(CommandId::Start, &[0, 0]).unwrap();
        session
            .handle_event(TransportEvent::ValueUpdated {
                channel: OTA_COMMAND_CHAR_UUID,
                value: echoed_start.to_vec(),
            })
            .await;
        assert_eq!(session.phase(), Phase::Handshaking);
    }

    #[tokio::test]
    async fn test_start_ota_rejections_leave_state() {
        let mock = MockTransport::new();
        let mut idle = Session::new(mock.clone(), OtaConfig::default());
        assert_eq!(
            idle.start_ota(image(10)).await,
            Err(OtaError::NotReady(Phase::Idle))
        );

        let mut session = ready_session(&mock).await;
        assert_eq!(
            session.start_ota(FirmwareImage::new(Vec::new())).await,
            Err(OtaError::EmptyImage)
        );
        assert!(matches!(
            session.start_ota(image(70_000)).await,
            Err(OtaError::ImageTooLarge { .. })
        ));
        assert_eq!(session.phase(), Phase::Ready);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_ota_requires_ota_characteristics() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.handle_event(TransportEvent::Connected).await;
        session
            .handle_event(TransportEvent::ServicesFound(vec![DEVICE_INFO_SERVICE]))
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: DEVICE_INFO_SERVICE,
                characteristics: vec![version_characteristic()],
            })
            .await;
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(
            session.start_ota(image(10)).await,
            Err(OtaError::MissingCharacteristic(OTA_DATA_CHAR_UUID))
        );
    }

    #[tokio::test]
    async fn test_start_ota_requires_configured_service() {
        let mock = MockTransport::new();
        let mut config = OtaConfig::default();
        config.gatt.service = uuid_from_u16(0xFFE0);
        let mut session = ready_session_with(&mock, config).await;
        assert_eq!(
            session.start_ota(image(10)).await,
            Err(OtaError::MissingCharacteristic(OTA_DATA_CHAR_UUID))
        );
        assert_eq!(session.phase(), Phase::Ready);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_size_follows_link_limit() {
        let mock = MockTransport::new().with_max_payload(23);
        let mut session = ready_session(&mock).await;
        session.start_ota(image(5000)).await.unwrap();
        // 18-byte chunks: 228 frames for the first sector, 51 for the rest
        assert_eq!(session.snapshot().total_frames, 279);

        session.handle_event(ack(CommandId::Start, AckStatus::Accept)).await;
        let (frame, _) = mock.last_write_to(OTA_DATA_CHAR_UUID).unwrap();
        assert_eq!(frame.len(), 3 + 18);
    }

    #[tokio::test]
    async fn test_write_error_fails_session() {
        let mock = MockTransport::new().failing_writes();
        let mut session = ready_session(&mock).await;
        let result = session.start_ota(image(64)).await;
        assert!(matches!(result, Err(OtaError::WriteFailed(_))));
        assert_eq!(session.phase(), Phase::Error);
    }

    #[tokio::test]
    async fn test_transport_failure_event() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session
            .handle_event(TransportEvent::Failed(OtaError::ConnectFailed(
                "peripheral not found".to_string(),
            )))
            .await;
        assert_eq!(session.phase(), Phase::Error);
        assert_eq!(session.snapshot().status, "connect failed: peripheral not found");
        assert!(!session.snapshot().connecting);
    }

    #[tokio::test]
    async fn test_reconnect_drops_current_session() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session
            .connect(PeripheralIdentity::new("11:22", "other"))
            .await
            .unwrap();
        assert_eq!(
            mock.calls(),
            vec![Call::Disconnect, Call::Connect("11:22".to_string())]
        );
        assert!(session.snapshot().characteristics.is_empty());
        assert_eq!(session.phase(), Phase::Connecting);
    }

    #[tokio::test]
    async fn test_expired_connect_deadline() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.expire_deadline().await;

        assert_eq!(session.phase(), Phase::Error);
        assert_eq!(
            session.snapshot().last_error,
            Some(OtaError::Timeout(Phase::Connecting))
        );
        assert_eq!(mock.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_discovery_deadline_spans_both_phases() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.handle_event(TransportEvent::Connected).await;
        let armed = session.deadline().unwrap();

        session
            .handle_event(TransportEvent::ServicesFound(vec![
                OTA_SERVICE_UUID,
                DEVICE_INFO_SERVICE,
            ]))
            .await;
        session
            .handle_event(TransportEvent::CharacteristicsFound {
                service: OTA_SERVICE_UUID,
                characteristics: ota_characteristics(),
            })
            .await;
        assert_eq!(session.phase(), Phase::CharacteristicDiscovery);
        assert_eq!(session.deadline(), Some(armed));

        session.expire_deadline().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Error);
        assert_eq!(
            snapshot.last_error,
            Some(OtaError::Timeout(Phase::CharacteristicDiscovery))
        );
    }

    #[tokio::test]
    async fn test_start_ack_deadline() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock).await;
        session.start_ota(image(5000)).await.unwrap();
        assert!(session.deadline().is_some());

        session.expire_deadline().await;
        assert_eq!(session.phase(), Phase::Error);
        assert_eq!(
            session.snapshot().last_error,
            Some(OtaError::Timeout(Phase::Handshaking))
        );
        assert!(mock.writes_to(OTA_DATA_CHAR_UUID).is_empty());
    }

    #[tokio::test]
    async fn test_end_ack_deadline() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 64).await;
        while mock.writes_to(OTA_COMMAND_CHAR_UUID).len() < 2 {
            complete_last_frame(&mut session, &mock).await;
        }
        let (end, _) = mock.last_write_to(OTA_COMMAND_CHAR_UUID).unwrap();
        assert_eq!(end, encode_end().to_vec());
        assert!(session.deadline().is_some());

        session.expire_deadline().await;
        assert_eq!(session.phase(), Phase::Error);
        assert_eq!(
            session.snapshot().last_error,
            Some(OtaError::Timeout(Phase::Transferring))
        );
    }

    #[tokio::test]
    async fn test_deadline_from_previous_phase_is_stale() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        session.deadline = Some(Deadline {
            at: Instant::now(),
            phase: Phase::Handshaking,
        });
        session.expire_deadline().await;
        assert_eq!(session.phase(), Phase::Transferring);
    }

    #[tokio::test]
    async fn test_write_deadline_rearmed_per_frame() {
        let mock = MockTransport::new();
        let mut session = transferring_session(&mock, 5000).await;
        assert!(session.deadline().is_some());
        complete_last_frame(&mut session, &mock).await;
        assert!(session.deadline().is_some());
        session.expire_deadline().await;
        assert_eq!(
            session.snapshot().last_error,
            Some(OtaError::Timeout(Phase::Transferring))
        );
    }

    #[tokio::test]
    async fn test_scan_registry_published() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), OtaConfig::default());
        session.rescan().await.unwrap();
        assert!(session.snapshot().scanning);

        let advertisement = Advertisement {
            id: "AA:01".to_string(),
            name: Some("ESP32".to_string()),
            rssi: Some(-48),
            manufacturer_data: None,
            services: vec![OTA_SERVICE_UUID],
        };
        session
            .handle_event(TransportEvent::Discovered(advertisement.clone()))
            .await;
        session
            .handle_event(TransportEvent::Discovered(advertisement))
            .await;
        assert_eq!(session.snapshot().peripherals.len(), 1);

        session.rescan().await.unwrap();
        assert!(session.snapshot().peripherals.is_empty());
        assert_eq!(
            mock.calls(),
            vec![Call::StartScan, Call::StopScan, Call::StartScan]
        );

        session.stop_scan().await.unwrap();
        assert!(!session.snapshot().scanning);
    }

    #[tokio::test]
    async fn test_snapshot_serialises_error_as_text() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock, OtaConfig::default());
        session.connect(peripheral()).await.unwrap();
        session.expire_deadline().await;

        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["phase"], "error");
        assert_eq!(json["last_error"], "timed out in connecting phase");
        assert_eq!(json["target"]["name"], "ota-target");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::CharacteristicDiscovery.to_string(), "characteristic discovery");
        assert_eq!(Phase::Handshaking.to_string(), "handshaking");
    }
}
