use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vento_core::checker::{CheckerConfig, FirmwareChecker};
use vento_core::config::UpdaterConfig;
use vento_core::store::FirmwareStore;
use vento_core::transport::HttpTransport;
use vento_core::uploader::{CancelHandle, FirmwareUploader, RESTART_POLL_INTERVAL};
use vento_core::version::ControllerFamily;

#[derive(Parser, Debug)]
#[command(author, version, about = "Komfovent firmware update tool", long_about = None)]
struct Args {
    /// Directory for firmware records and downloaded binaries
    #[arg(long, default_value = ".vento")]
    store: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the vendor feed for the latest firmware of a family
    Check {
        /// Controller family (C6 or C8)
        #[arg(long, default_value = "C6")]
        family: ControllerFamily,
    },

    /// Upload the cached latest firmware to a device and wait for it to
    /// come back
    Install {
        /// Device host, name-or-ip or name-or-ip:port
        #[arg(long)]
        host: String,

        /// Controller family (C6 or C8)
        #[arg(long, default_value = "C6")]
        family: ControllerFamily,

        /// Web UI username
        #[arg(long, default_value = "user")]
        username: String,

        /// Web UI password
        #[arg(long, default_value = "user")]
        password: String,

        /// Seconds to wait for the device to restart
        #[arg(long, default_value_t = 300)]
        restart_timeout: u64,
    },

    /// Run scheduled firmware checks for every device in a config file
    Watch {
        /// Path to a TOML config file
        #[arg(long, default_value = "vento.toml")]
        config: String,
    },

    /// Wait until a device accepts TCP connections again
    WaitRestart {
        /// Device host, name-or-ip or name-or-ip:port
        #[arg(long)]
        host: String,

        /// Seconds to wait
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        tracing::error!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let store = FirmwareStore::new(&args.store);

    match args.command {
        Command::Check { family } => {
            let checker = FirmwareChecker::new(HttpTransport::new(), store, CheckerConfig::default());
            let record = checker.check_now(family).await?;
            println!(
                "{}: latest firmware {} ({})",
                family, record.controller_version, record.filename
            );
            Ok(())
        }

        Command::Install { host, family, username, password, restart_timeout } => {
            let checker = FirmwareChecker::new(HttpTransport::new(), store, CheckerConfig::default());

            let record = match checker.store().load(family) {
                Some(record) if checker.store().binary_exists(&record) => record,
                _ => {
                    info!(family = %family, "No usable cached firmware, checking vendor feed");
                    checker.check_now(family).await?
                }
            };
            info!(version = %record.controller_version, "Installing firmware");

            let binary = tokio::fs::read(&record.binary_path)
                .await
                .with_context(|| format!("read {}", record.binary_path.display()))?;

            let uploader = FirmwareUploader::new(host);
            let session = uploader.login(&username, &password).await?;

            let mut last_reported = 0u64;
            uploader
                .upload_firmware(
                    &session,
                    &binary,
                    &record.filename,
                    |sent, total| {
                        let percent = if total > 0 { sent * 100 / total } else { 0 };
                        if percent >= last_reported + 10 || sent == total {
                            info!("Upload progress: {percent}%");
                            last_reported = percent;
                        }
                    },
                    &CancelHandle::new(),
                )
                .await?;
            uploader.logout().await;

            info!("Device confirmed upload, waiting for restart");
            if !uploader
                .wait_for_restart(std::time::Duration::from_secs(restart_timeout))
                .await
            {
                bail!("device did not come back within {restart_timeout}s");
            }

            println!("Installed {} on {}", record.controller_version, family);
            println!("Verify the running version in the device web UI before relying on it.");
            Ok(())
        }

        Command::Watch { config } => {
            let config = UpdaterConfig::load_from_file(&config)
                .with_context(|| format!("load config {config}"))?;
            if config.devices.is_empty() {
                bail!("no devices configured");
            }

            let checker = FirmwareChecker::new(
                HttpTransport::new(),
                FirmwareStore::new(&config.store_dir),
                CheckerConfig { check_interval: config.check_interval(), ..CheckerConfig::default() },
            );
            for device in &config.devices {
                info!(host = %device.host, family = %device.family, "Watching device");
                checker.register(device.family);
            }

            // Check jobs run on their own tasks until the process is killed
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        }

        Command::WaitRestart { host, timeout } => {
            // No flash-window grace here: the caller just wants to know
            // when the device answers again.
            let uploader = FirmwareUploader::new(host);
            if uploader
                .wait_for_restart_with(
                    std::time::Duration::ZERO,
                    std::time::Duration::from_secs(timeout),
                    RESTART_POLL_INTERVAL,
                )
                .await
            {
                println!("Device is reachable");
                Ok(())
            } else {
                warn!("Device still unreachable after {timeout}s");
                bail!("device did not come back within {timeout}s")
            }
        }
    }
}
