// btleplug transport
//
// BlueZ on Linux, CoreBluetooth on macOS, WinRT on Windows. Connect,
// service discovery, reads and writes run on spawned tasks that post their
// outcome as `TransportEvent`s. Notification subscriptions are awaited on
// the caller's task so they are in place before START is written.

use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    CharProperties, CharacteristicInfo, EventSender, Transport, TransportEvent, WriteMode,
    WriteTicket,
};
use crate::ble_common::short_uuid;
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::framer::MAX_CHUNK_SIZE;
use crate::scanner::{Advertisement, ManufacturerData, PeripheralIdentity};

/// ATT header bytes taken from every write (opcode + handle).
const ATT_WRITE_HEADER: usize = 3;

// ============================================================================
// Link
// ============================================================================

/// The transport's physical handle. `Connected` holds the peripheral from
/// the moment a connect is issued until it is dropped or lost.
enum Link {
    Disconnected,
    Connected(LinkedPeripheral),
}

struct LinkedPeripheral {
    peripheral: Peripheral,
    id: String,
    /// Cleared when this link is dropped; background tasks for a dropped
    /// link stop without reporting.
    alive: Arc<AtomicBool>,
}

// ============================================================================
// Transport
// ============================================================================

pub struct BtleTransport {
    _manager: Manager,
    adapter: Adapter,
    events: EventSender,
    link: Link,
    /// Bumped on every scan start/stop; a poll task exits once it no longer
    /// matches the generation it was started with.
    scan_generation: Arc<AtomicU64>,
    scan_poll_interval: Duration,
    watchdog_interval: Duration,
    att_mtu: usize,
}

impl BtleTransport {
    /// Open the first adapter the platform reports.
    pub async fn from_first_adapter(events: EventSender, config: &OtaConfig) -> OtaResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| OtaError::Adapter(format!("BLE manager init failed: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| OtaError::Adapter(format!("Failed to list BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| OtaError::Adapter("No BLE adapter found".to_string()))?;

        Ok(Self {
            _manager: manager,
            adapter,
            events,
            link: Link::Disconnected,
            scan_generation: Arc::new(AtomicU64::new(0)),
            scan_poll_interval: Duration::from_millis(config.scan.poll_interval_ms.max(50)),
            watchdog_interval: Duration::from_millis(
                config.transport.watchdog_interval_ms.max(100),
            ),
            att_mtu: config.transport.att_mtu,
        })
    }

    fn linked(&self) -> OtaResult<&LinkedPeripheral> {
        match &self.link {
            Link::Connected(linked) => Ok(linked),
            Link::Disconnected => Err(OtaError::ConnectFailed("no peripheral connected".to_string())),
        }
    }

    fn characteristic(&self, channel: Uuid) -> OtaResult<(Peripheral, Characteristic)> {
        let linked = self.linked()?;
        let characteristic = find_characteristic(&linked.peripheral, channel)
            .ok_or(OtaError::MissingCharacteristic(channel))?;
        Ok((linked.peripheral.clone(), characteristic))
    }

    /// Post an event from the session's own task. Never waits: the session
    /// is the consumer, so waiting on a full queue would deadlock.
    fn post(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            tlog!("[btle] Dropping event, queue unavailable: {}", e);
        }
    }

    async fn drop_link(&mut self) -> OtaResult<()> {
        let Link::Connected(linked) = std::mem::replace(&mut self.link, Link::Disconnected) else {
            return Ok(());
        };
        linked.alive.store(false, Ordering::SeqCst);
        tlog!("[btle] Disconnecting {}", linked.id);
        linked
            .peripheral
            .disconnect()
            .await
            .map_err(|e| OtaError::Adapter(format!("Failed to disconnect: {e}")))
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn start_scan(&mut self) -> OtaResult<()> {
        // Unfiltered: OS scan filters only see the primary advertisement,
        // and many devices put 128-bit service UUIDs in the scan response.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| OtaError::Adapter(format!("Failed to start BLE scan: {e}")))?;

        let generation = self.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.scan_generation.clone();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let interval = self.scan_poll_interval;
        tlog!("[btle] Scan started");

        tokio::spawn(async move {
            // Last reported (name, services) per id; resend only on change
            let mut reported: HashMap<String, (Option<String>, Vec<Uuid>)> = HashMap::new();
            loop {
                tokio::time::sleep(interval).await;
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let Ok(peripherals) = adapter.peripherals().await else {
                    continue;
                };
                for peripheral in peripherals {
                    let Some(props) = peripheral.properties().await.ok().flatten() else {
                        continue;
                    };
                    let id = peripheral.id().to_string();
                    let key = (props.local_name.clone(), props.services.clone());
                    if reported.get(&id) == Some(&key) {
                        continue;
                    }
                    reported.insert(id.clone(), key);

                    let manufacturer_data = props
                        .manufacturer_data
                        .iter()
                        .min_by_key(|(company_id, _)| **company_id)
                        .map(|(company_id, data)| ManufacturerData {
                            company_id: *company_id,
                            data: data.clone(),
                        });
                    let advertisement = Advertisement {
                        id,
                        name: props.local_name,
                        rssi: props.rssi,
                        manufacturer_data,
                        services: props.services,
                    };
                    if events
                        .send(TransportEvent::Discovered(advertisement))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            tlog!("[btle] Scan poller stopped");
        });
        Ok(())
    }

    async fn stop_scan(&mut self) -> OtaResult<()> {
        self.scan_generation.fetch_add(1, Ordering::SeqCst);
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| OtaError::Adapter(format!("Failed to stop BLE scan: {e}")))
    }

    async fn connect(&mut self, target: &PeripheralIdentity) -> OtaResult<()> {
        if let Err(e) = self.drop_link().await {
            tlog!("[btle] Dropping previous link failed: {}", e);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| OtaError::Adapter(format!("Failed to list peripherals: {e}")))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == target.id)
            .ok_or_else(|| OtaError::ConnectFailed(format!("Device '{}' not found", target.id)))?;

        let alive = Arc::new(AtomicBool::new(true));
        self.link = Link::Connected(LinkedPeripheral {
            peripheral: peripheral.clone(),
            id: target.id.clone(),
            alive: alive.clone(),
        });

        let events = self.events.clone();
        let watchdog_interval = self.watchdog_interval;
        let device_id = target.id.clone();
        tlog!("[btle] Connecting to {device_id}...");

        tokio::spawn(async move {
            let result = peripheral.connect().await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = result {
                let _ = events
                    .send(TransportEvent::Failed(OtaError::ConnectFailed(e.to_string())))
                    .await;
                return;
            }
            tlog!("[btle] Connected to {device_id}");
            spawn_notification_forwarder(peripheral.clone(), alive.clone(), events.clone());
            spawn_watchdog(peripheral, device_id, alive, events.clone(), watchdog_interval);
            let _ = events.send(TransportEvent::Connected).await;
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> OtaResult<()> {
        self.drop_link().await
    }

    async fn discover_services(&mut self) -> OtaResult<()> {
        let linked = self.linked()?;
        let peripheral = linked.peripheral.clone();
        let alive = linked.alive.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => TransportEvent::ServicesFound(
                    peripheral.services().iter().map(|s| s.uuid).collect(),
                ),
                Err(e) => TransportEvent::Failed(OtaError::DiscoveryFailed(format!(
                    "Failed to discover services: {e}"
                ))),
            };
            if alive.load(Ordering::SeqCst) {
                let _ = events.send(event).await;
            }
        });
        Ok(())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> OtaResult<()> {
        // btleplug resolves every characteristic during service discovery
        let linked = self.linked()?;
        let characteristics = linked
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        service: c.service_uuid,
                        properties: char_properties(c.properties),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.post(TransportEvent::CharacteristicsFound {
            service,
            characteristics,
        });
        Ok(())
    }

    async fn set_notify(&mut self, channel: Uuid, enabled: bool) -> OtaResult<()> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        if !characteristic
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(OtaError::DiscoveryFailed(format!(
                "{} does not support notifications",
                short_uuid(&channel)
            )));
        }
        let result = if enabled {
            peripheral.subscribe(&characteristic).await
        } else {
            peripheral.unsubscribe(&characteristic).await
        };
        result.map_err(|e| {
            OtaError::Adapter(format!(
                "Failed to set notify on {}: {e}",
                short_uuid(&channel)
            ))
        })?;
        tlog!(
            "[btle] Notifications {} on {}",
            if enabled { "enabled" } else { "disabled" },
            short_uuid(&channel)
        );
        Ok(())
    }

    async fn read(&mut self, channel: Uuid) -> OtaResult<()> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        let alive = self.linked()?.alive.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) if alive.load(Ordering::SeqCst) => {
                    let _ = events
                        .send(TransportEvent::ValueUpdated { channel, value })
                        .await;
                }
                Ok(_) => tlog!(
                    "[btle] Dropping read of {} from a closed link",
                    short_uuid(&channel)
                ),
                Err(e) => tlog!("[btle] Read of {} failed: {e}", short_uuid(&channel)),
            }
        });
        Ok(())
    }

    async fn write(
        &mut self,
        channel: Uuid,
        bytes: Vec<u8>,
        mode: WriteMode,
        ticket: WriteTicket,
    ) -> OtaResult<()> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        let alive = self.linked()?.alive.clone();
        let events = self.events.clone();
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };

        tokio::spawn(async move {
            let event = match peripheral.write(&characteristic, &bytes, write_type).await {
                Ok(()) => TransportEvent::WriteCompleted { channel, ticket },
                Err(e) => TransportEvent::Failed(OtaError::WriteFailed(format!(
                    "{} ({} bytes): {e}",
                    short_uuid(&channel),
                    bytes.len()
                ))),
            };
            if alive.load(Ordering::SeqCst) {
                let _ = events.send(event).await;
            }
        });
        Ok(())
    }

    fn max_payload_size(&self, _channel: Uuid, mode: WriteMode) -> usize {
        let payload = self.att_mtu.saturating_sub(ATT_WRITE_HEADER);
        match mode {
            // Long writes are capped by the ATT attribute length limit
            WriteMode::WithResponse => payload.min(MAX_CHUNK_SIZE),
            WriteMode::WithoutResponse => payload,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

fn char_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// Forward every notification from `peripheral` as `ValueUpdated`. The
/// stream is multiplexed across all subscribed characteristics.
fn spawn_notification_forwarder(
    peripheral: Peripheral,
    alive: Arc<AtomicBool>,
    events: EventSender,
) {
    tokio::spawn(async move {
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                tlog!("[btle] Failed to open notification stream: {e}");
                return;
            }
        };
        while let Some(notification) = stream.next().await {
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            let event = TransportEvent::ValueUpdated {
                channel: notification.uuid,
                value: notification.value,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    });
}

/// Poll the link and report `Disconnected` when it drops underneath us
/// (out of range, device reset after flashing).
fn spawn_watchdog(
    peripheral: Peripheral,
    device_id: String,
    alive: Arc<AtomicBool>,
    events: EventSender,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            let connected = peripheral.is_connected().await.unwrap_or(false);
            if !connected {
                // Only the task that clears the flag reports the loss
                if alive.swap(false, Ordering::SeqCst) {
                    tlog!("[btle] Watchdog: peripheral {device_id} disconnected unexpectedly");
                    let _ = events.send(TransportEvent::Disconnected).await;
                }
                break;
            }
        }
    });
}
