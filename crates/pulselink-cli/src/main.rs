use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use pulselink_core::{
    BleLink, ConditionerOptions, HeartRateMonitor, MonitorOptions, ScanOptions, Scanner,
    WetDrySource, conditioner,
};

#[derive(Parser)]
#[command(name = "pulselink")]
#[command(author, version, about = "Stream heart-rate telemetry as a control signal", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby heart-rate sensors
    Scan {
        /// Scan timeout in seconds
        #[arg(short, long, default_value = "8")]
        timeout: u64,

        /// List every peripheral, not just heart-rate candidates
        #[arg(long)]
        all: bool,
    },

    /// Connect to a sensor and stream conditioned metric frames
    Monitor {
        /// Sensor address, identifier, or name fragment
        #[arg(short, long)]
        device: Option<String>,

        /// Read samples from a bridge helper socket instead of the radio
        #[arg(long, conflicts_with = "device")]
        bridge: Option<PathBuf>,

        /// Smoothing factor (0.1-10.0, higher is smoother)
        #[arg(long, default_value = "0.1")]
        smoothing: f64,

        /// Additive BPM offset (-100 to 100)
        #[arg(long, default_value = "0")]
        hr_offset: f64,

        /// Additive wet/dry offset (-100 to 100)
        #[arg(long, default_value = "0")]
        wet_dry_offset: f64,

        /// Source feeding the wet/dry derivation
        #[arg(long, value_enum, default_value = "smoothed")]
        source: SourceArg,

        /// Keep the signal alive across link loss: simulate and reconnect
        #[arg(long)]
        lock: bool,

        /// Emit frames as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Raw,
    Smoothed,
}

impl From<SourceArg> for WetDrySource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Raw => WetDrySource::Raw,
            SourceArg::Smoothed => WetDrySource::Smoothed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Scan { timeout, all } => scan(timeout, all).await,
        Commands::Monitor {
            device,
            bridge,
            smoothing,
            hr_offset,
            wet_dry_offset,
            source,
            lock,
            json,
        } => {
            let options = MonitorOptions::new()
                .hr_offset(hr_offset)
                .hold_lock(lock)
                .conditioner(
                    ConditionerOptions::new()
                        .smoothing_factor(smoothing)
                        .wet_dry_offset(wet_dry_offset)
                        .source(source.into()),
                );
            monitor(device, bridge, options, smoothing, json).await
        }
    }
}

async fn scan(timeout: u64, all: bool) -> Result<()> {
    let scanner = Scanner::new().await.context("no usable Bluetooth adapter")?;
    let mut options = ScanOptions::new().duration(Duration::from_secs(timeout));
    if all {
        options = options.all_devices();
    }

    let sensors = scanner.scan(options).await?;
    if sensors.is_empty() {
        println!("No heart-rate sensors found.");
        return Ok(());
    }

    for sensor in sensors {
        let name = sensor.name.as_deref().unwrap_or("(unnamed)");
        let rssi = sensor
            .rssi
            .map(|v| format!("{} dBm", v))
            .unwrap_or_else(|| "-".to_string());
        let service = if sensor.advertises_hr_service {
            "HR service"
        } else {
            "name match"
        };
        println!("{:<28} {:<20} {:>8}  {}", name, sensor.identifier, rssi, service);
    }
    Ok(())
}

async fn monitor(
    device: Option<String>,
    bridge: Option<PathBuf>,
    options: MonitorOptions,
    smoothing: f64,
    json: bool,
) -> Result<()> {
    let mut monitor = match bridge {
        Some(_) => HeartRateMonitor::detached(options)?,
        None => {
            let link = BleLink::new().await.context("no usable Bluetooth adapter")?;
            HeartRateMonitor::new(Box::new(link), options)?
        }
    };

    let alpha = 1.0 / (1.0 + smoothing);
    tracing::info!(
        "smoothing: alpha={:.3}, half-life {:.2} sample(s)",
        alpha,
        conditioner::half_life_samples(alpha)
    );

    let mut frames = monitor.take_frames().expect("fresh monitor");
    let cancel = monitor.cancellation_token();
    let session = monitor.session();
    let events = monitor.event_sender();
    let run = tokio::spawn(monitor.run());

    match (&bridge, &device) {
        (Some(path), _) => {
            #[cfg(unix)]
            {
                let path = path.clone();
                tokio::spawn(async move {
                    if let Err(e) = pulselink_core::bridge::connect_and_pump(path, events).await {
                        tracing::error!("bridge stream failed: {}", e);
                    }
                });
            }
            #[cfg(not(unix))]
            {
                let _ = (path, events);
                bail!("the bridge transport requires a Unix domain socket");
            }
        }
        (None, Some(device)) => {
            let session = session.clone().expect("radio-backed monitor");
            session.lock().await.connect(device).await?;
        }
        (None, None) => bail!("either --device or --bridge is required"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if json {
                        println!("{}", serde_json::to_string(&frame)?);
                    } else {
                        println!(
                            "raw {:6.1} bpm | smoothed {:6.1} bpm | wet/dry {:5.1} ({:.2} norm)",
                            frame.raw_bpm,
                            frame.smoothed_bpm,
                            frame.wet_dry_ratio,
                            frame.wet_dry_norm,
                        );
                    }
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    if let Some(session) = session {
        session.lock().await.disconnect().await;
    }
    run.await?;
    Ok(())
}
