//! tofcap: stream frames from a line-scan ToF sensor

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tofcap::bus::{BusTransport, SimulatedTransport};
use tofcap::capture::BufferState;
use tofcap::trigger::{IntervalTrigger, TriggerSource};
use tofcap::{CaptureDevice, Config, TriggerKind};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the simulated bus and a timer trigger instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Stop after this many good frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tofcap=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!(sensor = %config.sensor.name, simulate = args.simulate, "tofcap starting");

    let device = Arc::new(build_device(&config, args.simulate)?);
    let format = device.negotiate_format(
        config.sensor.width,
        config.sensor.height,
        config.sensor.format,
    )?;
    info!(?format, "format negotiated");

    for buffer in device.allocate_buffers(config.stream.buffer_count as usize)? {
        device.submit(buffer)?;
    }
    device.start_stream()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut good = 0u64;
    let mut failed = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            completed = device.dequeue_completed_async() => {
                let buffer = completed?;
                match buffer.state() {
                    BufferState::Done => {
                        good += 1;
                        debug!(index = buffer.index(), sequence = ?buffer.sequence(), "frame");
                    }
                    _ => {
                        failed += 1;
                        warn!(index = buffer.index(), fault = ?buffer.fault(), "frame failed");
                    }
                }
                if let Err(e) = device.submit(buffer) {
                    warn!(error = %e, "resubmit failed");
                }
                if args.frames.is_some_and(|n| good >= n) {
                    break;
                }
            }
        }
    }

    let cancelled = {
        let device = device.clone();
        tokio::task::spawn_blocking(move || device.stop_stream()).await??
    };
    let mut returned = 0;
    while device.try_dequeue_completed().is_some() {
        returned += 1;
    }

    let metrics = device.metrics();
    metrics.publish();
    info!(good, failed, cancelled, returned, ?metrics, "tofcap shutting down");
    Ok(())
}

fn build_device(config: &Config, simulate: bool) -> Result<CaptureDevice> {
    let transport: Arc<dyn BusTransport> = if simulate {
        Arc::new(SimulatedTransport::from_config(&config.bus))
    } else {
        hardware_transport(config)?
    };

    let interval = || {
        Box::new(IntervalTrigger::with_fps(config.trigger.fps).pinned(config.trigger.pin_core))
            as Box<dyn TriggerSource>
    };
    let trigger = match config.trigger.source {
        _ if simulate => interval(),
        TriggerKind::Interval => interval(),
        TriggerKind::Gpio => gpio_trigger(config)?,
        TriggerKind::Manual => return Err(eyre!("manual trigger has no edge source here")),
    };

    Ok(CaptureDevice::new(config, transport, trigger)?)
}

#[cfg(all(feature = "linux-hw", target_os = "linux"))]
fn hardware_transport(config: &Config) -> Result<Arc<dyn BusTransport>> {
    let path = if config.bus.device.is_empty() {
        tofcap::utils::auto_detect_device()?.path
    } else {
        PathBuf::from(&config.bus.device)
    };
    info!(device = %path.display(), "using SPI device");
    Ok(Arc::new(tofcap::bus::SpidevTransport::open(&path, &config.bus)?))
}

#[cfg(all(feature = "linux-hw", target_os = "linux"))]
fn gpio_trigger(config: &Config) -> Result<Box<dyn TriggerSource>> {
    let line = config
        .trigger
        .gpio_line
        .ok_or_else(|| eyre!("gpio trigger needs trigger.gpio_line"))?;
    Ok(Box::new(
        tofcap::trigger::GpioEdgeTrigger::new(line).pinned(config.trigger.pin_core),
    ))
}

#[cfg(not(all(feature = "linux-hw", target_os = "linux")))]
fn hardware_transport(_config: &Config) -> Result<Arc<dyn BusTransport>> {
    Err(eyre!("built without linux-hw support; run with --simulate"))
}

#[cfg(not(all(feature = "linux-hw", target_os = "linux")))]
fn gpio_trigger(_config: &Config) -> Result<Box<dyn TriggerSource>> {
    Err(eyre!("built without linux-hw support; use the interval trigger"))
}
