// ota_cli: scan for, inspect and flash ESP BLE OTA peripherals.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

use ble_ota::logging::{init_file_logging, stop_file_logging};
use ble_ota::transport::btle::BtleTransport;
use ble_ota::{
    event_channel, tlog, FirmwareImage, OtaConfig, OtaError, OtaResult, PeripheralIdentity,
    Phase, Session, SessionHandle,
};

/// BLE firmware-over-the-air update tool
#[derive(Parser, Debug)]
#[command(name = "ota_cli", version, about, long_about = None)]
struct Args {
    /// Config file (default: <config dir>/ble-ota/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write the log to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List named peripherals in range
    Scan {
        /// How long to scan for
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,

        /// Print the list as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Connect and list characteristics and the firmware version
    Info {
        /// Peripheral id or advertised name
        device: String,

        /// How long to look for the device
        #[arg(long, default_value_t = 10)]
        scan_seconds: u64,
    },
    /// Send a firmware image
    Flash {
        /// Peripheral id or advertised name
        device: String,

        /// Firmware binary
        image: PathBuf,

        /// How long to look for the device
        #[arg(long, default_value_t = 10)]
        scan_seconds: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(dir) = &args.log_dir {
        if let Err(e) = init_file_logging(dir) {
            eprintln!("{e}");
        }
    }

    let result = run(args).await;
    stop_file_logging();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> OtaResult<()> {
    let config = OtaConfig::load_or_default(args.config.as_deref())?;
    let (events_tx, events_rx) = event_channel();
    let transport = BtleTransport::from_first_adapter(events_tx, &config).await?;
    let ota_service = config.gatt.service;
    let session = Session::new(transport, config).spawn(events_rx);

    match args.command {
        CliCommand::Scan { seconds, json } => {
            scan(&session, &ota_service, seconds, json).await
        }
        CliCommand::Info {
            device,
            scan_seconds,
        } => info(&session, &device, scan_seconds).await,
        CliCommand::Flash {
            device,
            image,
            scan_seconds,
        } => flash(&session, &device, &image, scan_seconds).await,
    }
}

async fn scan(
    session: &SessionHandle,
    ota_service: &Uuid,
    seconds: u64,
    json: bool,
) -> OtaResult<()> {
    session.rescan().await?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    session.stop_scan().await?;

    let peripherals = session.snapshot().peripherals;
    if json {
        let text = serde_json::to_string_pretty(&peripherals)
            .map_err(|e| OtaError::Config(format!("Failed to serialise scan results: {e}")))?;
        println!("{text}");
        return Ok(());
    }
    for p in &peripherals {
        let rssi = p.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "-".to_string());
        let ota = if p.advertises(ota_service) { "OTA" } else { "" };
        println!("{:<40} {:<24} {:<8} {}", p.id, p.name, rssi, ota);
    }
    println!("{} peripheral(s)", peripherals.len());
    Ok(())
}

async fn info(session: &SessionHandle, device: &str, scan_seconds: u64) -> OtaResult<()> {
    let target = find_device(session, device, scan_seconds).await?;
    connect_ready(session, target).await?;

    // The version read completes shortly after discovery
    let wait = session.wait_for(|s| s.firmware_version.is_some());
    let snapshot = match tokio::time::timeout(Duration::from_secs(2), wait).await {
        Ok(result) => result?,
        Err(_) => session.snapshot(),
    };

    println!(
        "Firmware version: {}",
        snapshot.firmware_version.as_deref().unwrap_or("unknown")
    );
    for c in &snapshot.characteristics {
        println!("  {} / {}  [{}]", c.service, c.uuid, c.properties.describe());
    }
    session.disconnect().await
}

async fn flash(
    session: &SessionHandle,
    device: &str,
    image_path: &Path,
    scan_seconds: u64,
) -> OtaResult<()> {
    let bytes = std::fs::read(image_path).map_err(|e| {
        OtaError::Config(format!("Failed to read {}: {e}", image_path.display()))
    })?;
    let image = FirmwareImage::new(bytes);
    tlog!(
        "[ota_cli] {} ({} bytes, sha256 {})",
        image_path.display(),
        image.len(),
        image.sha256_hex()
    );

    let target = find_device(session, device, scan_seconds).await?;
    connect_ready(session, target).await?;
    session.start_ota(image).await?;

    let mut state = session.subscribe();
    let mut last_progress = None;
    loop {
        let snapshot = state.borrow_and_update().clone();
        if last_progress != Some(snapshot.progress) && snapshot.phase == Phase::Transferring {
            println!(
                "{:>3}%  {}/{} frames",
                snapshot.progress, snapshot.frames_sent, snapshot.total_frames
            );
            last_progress = Some(snapshot.progress);
        }
        match snapshot.phase {
            Phase::Idle if snapshot.status == "OTA completed" => {
                println!("{}", snapshot.status);
                return session.disconnect().await;
            }
            Phase::Idle => {
                return Err(OtaError::ConnectFailed(format!(
                    "link lost during update ({})",
                    snapshot.status
                )));
            }
            Phase::Error => {
                return Err(snapshot
                    .last_error
                    .unwrap_or_else(|| OtaError::WriteFailed(snapshot.status)));
            }
            _ => {}
        }
        state.changed().await.map_err(|_| OtaError::SessionClosed)?;
    }
}

/// Scan until a peripheral whose id or name equals `device` shows up.
async fn find_device(
    session: &SessionHandle,
    device: &str,
    scan_seconds: u64,
) -> OtaResult<PeripheralIdentity> {
    session.rescan().await?;
    let is_target = |p: &PeripheralIdentity| p.id == device || p.name == device;
    let wait = session.wait_for(|s| s.peripherals.iter().any(is_target));
    let found = tokio::time::timeout(Duration::from_secs(scan_seconds), wait).await;
    session.stop_scan().await?;

    let snapshot = found
        .map_err(|_| OtaError::ConnectFailed(format!("Device '{device}' not found")))??;
    snapshot
        .peripherals
        .into_iter()
        .find(|p| is_target(p))
        .ok_or_else(|| OtaError::ConnectFailed(format!("Device '{device}' not found")))
}

async fn connect_ready(session: &SessionHandle, target: PeripheralIdentity) -> OtaResult<()> {
    println!("Connecting to {} ({})", target.name, target.id);
    session.connect(target).await?;
    let snapshot = session
        .wait_for(|s| matches!(s.phase, Phase::Ready | Phase::Error | Phase::Idle))
        .await?;
    match snapshot.phase {
        Phase::Ready => Ok(()),
        Phase::Error => Err(snapshot
            .last_error
            .unwrap_or_else(|| OtaError::ConnectFailed(snapshot.status))),
        _ => Err(OtaError::ConnectFailed(snapshot.status)),
    }
}
