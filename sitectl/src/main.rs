#[macro_use]
extern crate log;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use clap::Parser;
use flyweight::{
    Channel, ControlCommand, Controller, ControllerConfig, ControllerListener, DeviceRegistry,
    NetAddress, NetGuid, NetworkDevice, NetworkId, SerialConnector, SlipTransport,
    TcpClientConnector, TcpServerConnector, Transport, DEFAULT_BAUD, DEFAULT_TCP_PORT,
};
use serde::Deserialize;

/// sitectl - runs a flyweight device network over a radio dongle or simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device of the radio dongle
    #[arg(short, long)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Radio simulator to connect to
    #[arg(long)]
    tcp: Option<String>,

    /// Wait for a radio to connect on this address
    #[arg(long)]
    listen: Option<Option<String>>,

    /// Network id to run on
    #[arg(short, long)]
    network_id: Option<NetworkId>,

    /// Radio channel to use instead of scanning
    #[arg(short, long)]
    channel: Option<Channel>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Device allowed to associate; may be repeated
    #[arg(short, long)]
    allow: Vec<NetGuid>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration file format.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    transport: TransportSection,
    #[serde(default)]
    devices: DevicesSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TransportSection {
    serial: Option<String>,
    baud: Option<u32>,
    tcp: Option<String>,
    listen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DevicesSection {
    allow: Vec<String>,
    known: Vec<KnownDevice>,
}

#[derive(Debug, Deserialize)]
struct KnownDevice {
    guid: String,
    address: Option<u8>,
}

fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: ConfigFile =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let filters = if verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

/// Devices known to this site, kept in memory for the life of the process.
struct MemoryRegistry {
    devices: Mutex<HashMap<NetGuid, NetworkDevice>>,
}

impl MemoryRegistry {
    fn new(devices: Vec<NetworkDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| (device.guid, device))
            .collect();
        Self {
            devices: Mutex::new(devices),
        }
    }

    fn devices(&self) -> Vec<NetworkDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn find_device_by_guid(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(guid)
            .cloned()
    }

    fn find_device_by_address(&self, address: NetAddress) -> Option<NetworkDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|device| device.address == Some(address))
            .cloned()
    }

    fn on_device_changed(&self, device: &NetworkDevice, persistent_fields_changed: bool) {
        if persistent_fields_changed {
            info!("device updated: {}", device);
        } else {
            debug!("device changed: {}", device);
        }
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.guid, device.clone());
    }
}

/// Lets listed devices associate, or every device when the list is empty, and logs what they do.
struct SiteListener {
    allowed: HashSet<NetGuid>,
}

impl ControllerListener for SiteListener {
    fn can_device_associate(&self, guid: &NetGuid) -> bool {
        self.allowed.is_empty() || self.allowed.contains(guid)
    }

    fn on_device_lost(&self, device: &NetworkDevice) {
        warn!("lost {}", device);
    }

    fn on_device_became_active(&self, device: &NetworkDevice) {
        info!("active {}", device);
    }

    fn on_control_command(
        &self,
        source: NetAddress,
        device: Option<&NetworkDevice>,
        command: &ControlCommand,
    ) {
        match (device, command) {
            (Some(device), ControlCommand::Scan(text)) => {
                info!("{} scanned {:?}", device.guid, text)
            }
            (Some(device), ControlCommand::ButtonPress { button, value }) => {
                info!("{} pressed button {} ({})", device.guid, button, value)
            }
            (_, command) => debug!("control command from {}: {:?}", source, command),
        }
    }
}

async fn open_transport(
    args: &Args,
    section: &TransportSection,
    config: &ControllerConfig,
) -> Result<Arc<dyn Transport>> {
    let cooldown = config.reset_cooldown();

    let serial = args.serial.clone().or_else(|| section.serial.clone());
    let tcp = args.tcp.clone().or_else(|| section.tcp.clone());
    let listen = match &args.listen {
        Some(Some(addr)) => Some(addr.clone()),
        Some(None) => Some(format!("0.0.0.0:{}", DEFAULT_TCP_PORT)),
        None => section.listen.clone(),
    };

    let transport: Arc<dyn Transport> = match (serial, tcp, listen) {
        (Some(path), None, None) => {
            let baud = args.baud.or(section.baud).unwrap_or(DEFAULT_BAUD);
            Arc::new(SlipTransport::new(SerialConnector::new(path, baud), cooldown))
        }
        (None, Some(addr), None) => {
            Arc::new(SlipTransport::new(TcpClientConnector::new(addr), cooldown))
        }
        (None, None, Some(addr)) => {
            let connector = TcpServerConnector::bind(addr.clone())
                .await
                .with_context(|| format!("listening on {}", addr))?;
            info!("waiting for a radio on {}", addr);
            Arc::new(SlipTransport::new(connector, cooldown))
        }
        (None, None, None) => bail!("no radio given: use --serial, --tcp or --listen"),
        _ => bail!("use only one of --serial, --tcp and --listen"),
    };
    Ok(transport)
}

fn known_devices(section: &DevicesSection) -> Result<Vec<NetworkDevice>> {
    section
        .known
        .iter()
        .map(|known| {
            let guid: NetGuid = known
                .guid
                .parse()
                .with_context(|| format!("device guid {:?}", known.guid))?;
            Ok(match known.address {
                Some(address) => NetworkDevice::with_address(guid, NetAddress(address)),
                None => NetworkDevice::new(guid),
            })
        })
        .collect()
}

fn allowed_devices(args: &Args, section: &DevicesSection) -> Result<HashSet<NetGuid>> {
    let mut allowed = HashSet::new();
    for guid in &section.allow {
        let guid: NetGuid = guid
            .parse()
            .with_context(|| format!("allowed guid {:?}", guid))?;
        allowed.insert(guid);
    }
    allowed.extend(args.allow.iter().copied());
    Ok(allowed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file = match &args.config {
        Some(path) => load_config(path)?,
        None => ConfigFile::default(),
    };

    let mut config = file.controller;
    if let Some(network_id) = args.network_id {
        config.network_id = network_id;
    }
    if let Some(channel) = args.channel {
        config.preferred_channel = channel;
    }

    let transport = open_transport(&args, &file.transport, &config).await?;
    let registry = Arc::new(MemoryRegistry::new(known_devices(&file.devices)?));
    let allowed = allowed_devices(&args, &file.devices)?;
    if allowed.is_empty() {
        warn!("no allow list: any device may associate");
    }
    let listener = Arc::new(SiteListener { allowed });

    let controller = Controller::new(config, vec![transport], registry.clone(), listener);
    for device in registry.devices() {
        controller.add_network_device(device);
    }

    tokio::select! {
        result = controller.start() => result.context("starting controller")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted while starting");
            controller.stop().await;
            return Ok(());
        }
    }
    match controller.radio_channel() {
        Some(channel) => info!(
            "running on network {} channel {}",
            controller.network_id(),
            channel
        ),
        None => warn!("running without a radio channel"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    controller.stop().await;

    Ok(())
}
