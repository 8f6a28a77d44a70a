// ============================================================================
// MAIN.RS - COMMAND LINE ENTRY POINT
// Wires the library's pairing flow, control clients and servers to clap
// subcommands. Logging is set up here once for the whole process.
// ============================================================================

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sengled_tool::commands::{BulbCommand, GroupCommand};
use sengled_tool::config::default_config_dir;
use sengled_tool::control::{estimate_brightness, UdpCommand, UdpControl};
use sengled_tool::firmware::{firmware_url, prepare_firmware_bin, FIRMWARE_DOWNLOAD_TIMEOUT};
use sengled_tool::handshake::AccessPoint;
use sengled_tool::http_server::BrokerAdvert;
use sengled_tool::mqtt_client::{MqttClient, MqttClientOptions};
use sengled_tool::net_utils::{get_local_ip, normalize_mac};
use sengled_tool::{
    bulb_store::BulbStore, constants, ChosenNetwork, EmbeddedBroker, ExternalBroker, NetworkCredentials,
    NetworkSelector, ProvisioningOrchestrator, Selection, SetupConfig, SetupHttpServer,
};

// ============================================================================
// COMMAND LINE
// ============================================================================

#[derive(Parser)]
#[command(name = "sengled-tool")]
#[command(about = "Pair, control and flash Sengled Wi-Fi bulbs without the vendor cloud")]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// MQTT broker address given to bulbs (defaults to this machine's LAN address)
    #[arg(long, global = true, env = "SENGLED_BROKER_IP")]
    broker_ip: Option<String>,

    #[arg(long, global = true, env = "SENGLED_BROKER_PORT", default_value_t = constants::BROKER_TLS_PORT)]
    broker_port: u16,

    #[arg(long, global = true, env = "SENGLED_HTTP_PORT", default_value_t = constants::DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// Host written into the callback URLs sent to the bulb
    #[arg(long, global = true, env = "SENGLED_HTTP_SERVER_IP")]
    http_server_ip: Option<IpAddr>,

    /// Configuration directory (certificates, bulbs.json)
    #[arg(long, global = true, env = "SENGLED_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Regenerate the broker's TLS certificates
    #[arg(long, global = true)]
    regen_certs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair a bulb in access-point mode with a Wi-Fi network
    Setup {
        /// Network name for non-interactive setup
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        #[arg(long, requires = "ssid")]
        password: Option<String>,
        /// Bulb MAC, used when the bulb does not report one
        #[arg(long)]
        mac: Option<String>,
    },
    /// Control a bulb on the LAN over UDP
    Udp {
        #[arg(long)]
        ip: IpAddr,
        #[command(subcommand)]
        action: UdpAction,
    },
    /// Control a bulb through the MQTT broker
    Mqtt {
        #[arg(long)]
        mac: String,
        #[command(subcommand)]
        action: MqttAction,
    },
    /// Control several bulbs at once through the first one
    Group {
        #[arg(long, num_args = 1.., required = true)]
        macs: Vec<String>,
        #[arg(long, default_value_t = 10)]
        gradient_time: u32,
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Serve a firmware image and tell the bulb to download it
    Upgrade {
        #[arg(long)]
        mac: String,
        /// Path to the .bin image
        #[arg(long)]
        firmware: PathBuf,
    },
    /// Keep the broker and callback server up so paired bulbs can reconnect
    RunServers,
    /// Only regenerate the broker certificates
    RegenCerts,
}

#[derive(Subcommand)]
enum UdpAction {
    On,
    Off,
    Brightness { percent: i64 },
    Color { r: i64, g: i64, b: i64 },
    Status,
    Search,
    /// Send a raw JSON object
    Json { payload: String },
}

#[derive(Subcommand)]
enum MqttAction {
    On,
    Off,
    Brightness { percent: i64 },
    Color { r: i64, g: i64, b: i64 },
    ColorTemp { percent: i64 },
    Effect { status: u32 },
    Reset,
    /// Firmware URL the bulb should fetch
    Update { url: String },
    /// JSON array of {dn, type, value, time} entries
    Custom { payload: String },
}

#[derive(Subcommand)]
enum GroupAction {
    On,
    Off,
    Brightness { percent: i64 },
    ColorTemp { percent: i64 },
}

// ============================================================================
// MAIN FUNCTION
// ============================================================================

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(cli.verbose)
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli.common);

    if cli.common.regen_certs || matches!(cli.command, Commands::RegenCerts) {
        let broker = EmbeddedBroker::new(config.cert_dir(), config.broker_port, true, get_local_ip());
        let certs = broker.ensure_certificates()?;
        info!("Certificates regenerated in {}", certs.ca_cert.parent().map(|p| p.display().to_string()).unwrap_or_default());
    }

    match cli.command {
        Commands::Setup { ssid, password, mac } => run_setup(config, ssid, password, mac).await,
        Commands::Udp { ip, action } => run_udp(&config, ip, action).await,
        Commands::Mqtt { mac, action } => run_mqtt(&config, &cli.common, &mac, action).await,
        Commands::Group { macs, gradient_time, action } => {
            run_group(&config, &cli.common, &macs, gradient_time, action).await
        }
        Commands::Upgrade { mac, firmware } => run_upgrade(&config, &cli.common, &mac, &firmware).await,
        Commands::RunServers => run_servers(&config, &cli.common).await,
        Commands::RegenCerts => Ok(()),
    }
}

fn build_config(common: &CommonArgs) -> SetupConfig {
    let config_dir = common.config_dir.clone().unwrap_or_else(default_config_dir);
    SetupConfig {
        http_port: common.http_port,
        broker_port: common.broker_port,
        external_broker: common.broker_ip.as_ref().map(|host| ExternalBroker {
            host: host.clone(),
            port: common.broker_port,
        }),
        callback_host: common.http_server_ip,
        firmware_dir: config_dir.join("firmware"),
        config_dir,
        ..SetupConfig::default()
    }
}

// ============================================================================
// SETUP
// ============================================================================

/// Reads the network choice from stdin
struct StdinSelector;

impl NetworkSelector for StdinSelector {
    async fn select(&mut self, access_points: &[AccessPoint]) -> Selection {
        println!();
        println!("Available networks found (enter 0 to rescan):");
        for (i, ap) in access_points.iter().enumerate() {
            println!("  [{}] {:<32} {}", i + 1, ap.ssid, "▮".repeat(usize::from(ap.bars())));
        }

        let Some(choice) = prompt("Select a network: ").await else {
            return Selection::Cancel;
        };
        let index = match choice.parse::<usize>() {
            Ok(0) => return Selection::Rescan,
            Ok(n) if n <= access_points.len() => n - 1,
            _ => {
                warn!("Invalid selection: {}", choice);
                return Selection::Rescan;
            }
        };

        let ap = &access_points[index];
        let Some(password) = prompt(&format!("Password for '{}': ", ap.ssid)).await else {
            return Selection::Cancel;
        };
        Selection::Network(ChosenNetwork {
            ssid: ap.ssid.clone(),
            bssid: Some(ap.bssid.clone()).filter(|b| !b.is_empty()),
            password,
        })
    }
}

/// One trimmed line from stdin; `None` on EOF
async fn prompt(text: &str) -> Option<String> {
    print!("{}", text);
    let _ = std::io::stdout().flush();
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

async fn run_setup(
    mut config: SetupConfig,
    ssid: Option<String>,
    password: Option<String>,
    mac: Option<String>,
) -> anyhow::Result<()> {
    if let Some(mac) = mac {
        config.mac_override = Some(normalize_mac(&mac).context("invalid --mac")?);
    }
    if let (Some(ssid), Some(password)) = (ssid, password) {
        config.interactive = false;
        config.credentials = Some(NetworkCredentials { ssid, password, bssid: None });
    }

    info!("Connect to the bulb's 'Sengled_Wi-Fi Bulb_XXXXXX' network");
    if config.interactive
        && prompt("Press Enter to continue (Ctrl+C to cancel)...").await.is_none()
    {
        bail!("setup cancelled");
    }

    let mut orchestrator = ProvisioningOrchestrator::new(config, StdinSelector);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let outcome = orchestrator.run_until(shutdown).await?;

    info!("Wi-Fi setup complete for {}", outcome.mac);
    match outcome.last_client_ip {
        Some(ip) => info!("Bulb IP: {} (try: sengled-tool udp --ip {} on)", ip, ip),
        None => warn!("Bulb IP unknown"),
    }
    info!("Control over MQTT: sengled-tool mqtt --mac {} on", outcome.mac);
    info!(
        "Flashing compatibility: {} (model {}, module {})",
        outcome.support.category, outcome.support.model, outcome.support.module
    );
    if outcome.degraded {
        warn!("The bulb did not call back in time; pairing may be incomplete");
    }
    Ok(())
}

// ============================================================================
// CONTROL
// ============================================================================

async fn run_udp(config: &SetupConfig, ip: IpAddr, action: UdpAction) -> anyhow::Result<()> {
    let command = match action {
        UdpAction::On => UdpCommand::Switch(true),
        UdpAction::Off => UdpCommand::Switch(false),
        UdpAction::Brightness { percent } => UdpCommand::brightness(percent),
        UdpAction::Color { r, g, b } => UdpCommand::color(r, g, b),
        UdpAction::Status => UdpCommand::GetBrightness,
        UdpAction::Search => UdpCommand::SearchDevices,
        UdpAction::Json { payload } => match serde_json::from_str::<Value>(&payload)? {
            Value::Object(map) => UdpCommand::Raw(map),
            _ => bail!("UDP payload must be a JSON object"),
        },
    };
    let is_status = matches!(command, UdpCommand::GetBrightness);

    let control = UdpControl::new(config.control_port, config.control_timeout);
    match control.send(ip, &command).await {
        Some(response) => {
            info!("Response: {}", response);
            if is_status {
                let result = response.get("result").cloned().unwrap_or(Value::Null);
                let explicit = result
                    .get("brightness")
                    .and_then(Value::as_u64)
                    .map(|b| b.min(100) as u8);
                let channels: Vec<u32> = ["r", "g", "b", "w"]
                    .iter()
                    .filter_map(|k| result.get(*k).and_then(Value::as_u64))
                    .map(|v| v as u32)
                    .collect();
                let is_on = result.get("switch").and_then(Value::as_u64).map_or(true, |s| s != 0);
                info!("Estimated brightness: {}/255", estimate_brightness(explicit, &channels, is_on));
            }
        }
        None => warn!("No response from {}", ip),
    }
    Ok(())
}

/// Connect to the broker the bulb was paired with, else the configured one
async fn connect_mqtt(config: &SetupConfig, common: &CommonArgs, mac: &str) -> anyhow::Result<MqttClient> {
    let host = match &common.broker_ip {
        Some(host) => host.clone(),
        None => {
            let lan_ip = get_local_ip().to_string();
            match BulbStore::new(&config.config_dir).broker_for(mac) {
                Some(broker) if broker != lan_ip => broker,
                _ => "127.0.0.1".to_string(),
            }
        }
    };
    let client = MqttClient::connect(&MqttClientOptions::tls(host, config.broker_port)).await?;
    Ok(client)
}

async fn run_mqtt(config: &SetupConfig, common: &CommonArgs, mac: &str, action: MqttAction) -> anyhow::Result<()> {
    let mac = normalize_mac(mac)?;
    let client = connect_mqtt(config, common, &mac).await?;

    let result = match action {
        MqttAction::Custom { payload } => {
            let entries: Value = serde_json::from_str(&payload)?;
            if !entries.is_array() {
                bail!("custom payload must be a JSON array");
            }
            client.publish_custom(&mac, &entries).await
        }
        other => {
            let command = match other {
                MqttAction::On => BulbCommand::Switch(true),
                MqttAction::Off => BulbCommand::Switch(false),
                MqttAction::Brightness { percent } => BulbCommand::brightness(percent),
                MqttAction::Color { r, g, b } => BulbCommand::color(r, g, b),
                MqttAction::ColorTemp { percent } => BulbCommand::color_temperature(percent),
                MqttAction::Effect { status } => BulbCommand::EffectStatus(status),
                MqttAction::Reset => BulbCommand::Reset,
                MqttAction::Update { url } => BulbCommand::Update(url),
                MqttAction::Custom { .. } => return Err(anyhow!("unreachable custom payload")),
            };
            client.publish_command(&mac, &command).await
        }
    };
    result?;
    info!("Command sent to {}", mac);

    // QoS 1 needs the event loop running long enough to flush
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.disconnect().await;
    Ok(())
}

async fn run_group(
    config: &SetupConfig,
    common: &CommonArgs,
    macs: &[String],
    gradient_time: u32,
    action: GroupAction,
) -> anyhow::Result<()> {
    let macs = macs
        .iter()
        .map(|m| normalize_mac(m))
        .collect::<Result<Vec<_>, _>>()?;
    let command = match action {
        GroupAction::On => GroupCommand::Switch(true),
        GroupAction::Off => GroupCommand::Switch(false),
        GroupAction::Brightness { percent } => GroupCommand::brightness(percent),
        GroupAction::ColorTemp { percent } => GroupCommand::color_temperature(percent),
    };

    let first = macs.first().ok_or_else(|| anyhow!("at least one MAC is required"))?;
    let client = connect_mqtt(config, common, first).await?;
    client.publish_group(&macs, &command, gradient_time).await?;
    info!("Group command sent to {} bulbs", macs.len());
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.disconnect().await;
    Ok(())
}

// ============================================================================
// SERVERS
// ============================================================================

async fn run_upgrade(config: &SetupConfig, common: &CommonArgs, mac: &str, firmware: &Path) -> anyhow::Result<()> {
    let mac = normalize_mac(mac)?;
    let name = prepare_firmware_bin(firmware, &config.firmware_dir)?;

    let lan_ip = get_local_ip();
    let advert = BrokerAdvert {
        host: common.broker_ip.clone().unwrap_or_else(|| lan_ip.to_string()),
        port: config.broker_port,
    };
    let mut server = SetupHttpServer::new(advert, config.firmware_dir.clone());
    let addr = server.start(config.http_port).await.map_err(|e| anyhow!("{} ({})", e, e.guidance()))?;
    let url = firmware_url(config.callback_host.unwrap_or(lan_ip), addr.port(), &name);
    info!("Serving firmware from: {}", url);

    warn!("Firmware upgrades are dangerous: the image must target the ota_1 slot or the bulb will be bricked");
    if prompt("Press Enter to send the update, or Ctrl+C to cancel...").await.is_none() {
        server.stop().await;
        bail!("upgrade cancelled");
    }

    let client = connect_mqtt(config, common, &mac).await?;
    client.publish_command(&mac, &BulbCommand::Update(url)).await?;
    info!("Upgrade command sent. Look for the 'Sengled-Rescue' Wi-Fi network once the image is fetched");

    tokio::select! {
        served = server.wait_for_firmware_download(FIRMWARE_DOWNLOAD_TIMEOUT) => {
            if served {
                info!("Firmware download initiated by bulb");
            } else {
                warn!("Bulb did not download the firmware within {:?}", FIRMWARE_DOWNLOAD_TIMEOUT);
            }
        }
        _ = tokio::signal::ctrl_c() => warn!("Interrupted by user"),
    }

    client.disconnect().await;
    server.stop().await;
    Ok(())
}

async fn run_servers(config: &SetupConfig, common: &CommonArgs) -> anyhow::Result<()> {
    info!("You might need to wait up to a minute for the bulb to reconnect");
    let lan_ip = get_local_ip();
    let broker_host = common.broker_ip.clone().unwrap_or_else(|| lan_ip.to_string());

    let mut broker = EmbeddedBroker::new(config.cert_dir(), config.broker_port, false, lan_ip);
    broker.start().await.map_err(|e| anyhow!("{} ({})", e, e.guidance()))?;

    let advert = BrokerAdvert { host: broker_host.clone(), port: config.broker_port };
    let mut server = SetupHttpServer::new(advert, config.firmware_dir.clone());
    let addr = match server.start(config.http_port).await {
        Ok(addr) => addr,
        Err(e) => {
            broker.stop().await;
            return Err(anyhow!("{} ({})", e, e.guidance()));
        }
    };

    info!("Servers are running. Bulbs can connect to:");
    info!("  MQTT: {}:{}", broker_host, config.broker_port);
    info!("  HTTP: {}:{}", config.callback_host.unwrap_or(lan_ip), addr.port());
    info!("Press Ctrl+C to stop both servers");

    let _ = tokio::signal::ctrl_c().await;
    server.stop().await;
    broker.stop().await;
    info!("Servers stopped");
    Ok(())
}
