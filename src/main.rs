// src/main.rs
//! Hardware wallet command line tool
//! Discovers devices and drives address derivation and message signing.
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use defi_hardware_wallet::core::config::HardwareWalletConfig;
use defi_hardware_wallet::hardware::{DeviceBackend, HardwareWalletManager, HardwareWalletType};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Device ids used when no physical transport is selected.
const SIMULATED_LEDGER_ID: &str = "ledger-sim-0";
const SIMULATED_TREZOR_ID: &str = "trezor-sim-0";

#[derive(Parser)]
#[command(name = "hwctl")]
#[command(about = "Hardware wallet device manager")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Talk to USB HID devices instead of the built-in synthetic ones
    #[arg(long, global = true)]
    hid: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices of every enabled vendor
    Discover,
    /// Print the address derived at a path
    Address(DeviceArgs),
    /// Print the uncompressed public key derived at a path
    PublicKey(DeviceArgs),
    /// Sign a UTF-8 message with the EIP-191 prefix
    SignMessage {
        #[command(flatten)]
        device: DeviceArgs,
        /// Message to sign
        #[arg(long)]
        message: String,
    },
    /// Check a BIP44 path without touching any device
    ValidatePath {
        path: String,
    },
}

#[derive(ClapArgs)]
struct DeviceArgs {
    /// Device id as reported by `discover`
    #[arg(long)]
    device: String,
    /// Vendor of the device (ledger or trezor)
    #[arg(long)]
    vendor: HardwareWalletType,
    /// Derivation path; defaults to the configured one
    #[arg(long)]
    path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging()?;

    let config = HardwareWalletConfig::load_from_env().context("Failed to load configuration")?;
    info!("Starting hwctl v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::ValidatePath { path } = &args.command {
        defi_hardware_wallet::core::bip44::validate_derivation_path(path)?;
        println!("{} is a valid BIP44 path", path);
        return Ok(());
    }

    let manager = build_manager(config, args.hid)?;

    match args.command {
        Commands::Discover => {
            let devices = manager.discover_wallets().await;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Commands::Address(device) => {
            let path = connect(&manager, &device).await?;
            let address = manager.get_address_from_hardware_wallet(&device.device, &path).await?;
            println!("{}", address);
        }
        Commands::PublicKey(device) => {
            let path = connect(&manager, &device).await?;
            let key = manager.get_public_key_from_hardware_wallet(&device.device, &path).await?;
            println!("0x{}", hex::encode(key));
        }
        Commands::SignMessage { device, message } => {
            let path = connect(&manager, &device).await?;
            let signature = manager
                .sign_message_with_hardware_wallet(&device.device, message.as_bytes(), &path)
                .await?;
            println!("0x{}", hex::encode(signature));
        }
        Commands::ValidatePath { .. } => unreachable!("handled before the manager is built"),
    }

    Ok(())
}

/// Connects the device and returns the path to use.
async fn connect(manager: &HardwareWalletManager, device: &DeviceArgs) -> Result<String> {
    manager
        .connect_wallet(&device.device, device.vendor)
        .await
        .with_context(|| format!("Failed to connect {} {}", device.vendor, device.device))?;
    Ok(device
        .path
        .clone()
        .unwrap_or_else(|| manager.config().default_derivation_path.clone()))
}

fn build_manager(config: HardwareWalletConfig, hid: bool) -> Result<HardwareWalletManager> {
    if !hid {
        return Ok(HardwareWalletManager::with_simulated_devices(
            config,
            &[SIMULATED_LEDGER_ID],
            &[SIMULATED_TREZOR_ID],
        ));
    }

    let backends = hid_backends(&config)?;
    if backends.is_empty() {
        anyhow::bail!("hwctl was built without HID support; rebuild with --features ledger,trezor");
    }
    Ok(HardwareWalletManager::new(config, backends))
}

#[allow(unused_variables, unused_mut)]
fn hid_backends(config: &HardwareWalletConfig) -> Result<Vec<Arc<dyn DeviceBackend>>> {
    let mut backends: Vec<Arc<dyn DeviceBackend>> = Vec::new();
    #[cfg(feature = "ledger")]
    backends.push(Arc::new(defi_hardware_wallet::hardware::LedgerBackend::hid(
        config.device_read_timeout(),
    )?));
    #[cfg(feature = "trezor")]
    backends.push(Arc::new(defi_hardware_wallet::hardware::TrezorBackend::hid(
        config.device_read_timeout(),
    )?));
    Ok(backends)
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;
    Ok(())
}
