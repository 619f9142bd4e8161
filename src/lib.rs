pub mod bus;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod trigger;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureDevice, FrameBuffer, StreamState};
pub use error::{Error, Result};

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub sensor: SensorConfig,
    pub bus: BusConfig,
    pub trigger: TriggerConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    /// Pixels per line; fixed by the sensor.
    pub width: u32,
    /// Lines per frame requested at startup.
    pub height: u32,
    pub max_height: u32,
    /// Bytes clocked out per line, active pixels plus blanking.
    pub line_stride: usize,
    pub format: PixelFormat,
    pub formats: Vec<PixelFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// spidev node; empty means auto-detect.
    pub device: String,
    pub clock_hz: u32,
    pub max_clock_hz: u32,
    pub bits_per_word: u8,
    pub mode: u8,
    /// Largest single ioctl transfer the spidev driver accepts.
    pub max_transfer_bytes: usize,
    pub sim_latency_us: u64,
    pub sim_fail_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Interval,
    Gpio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerKind,
    /// Edge rate for the interval trigger.
    pub fps: u32,
    pub gpio_line: Option<u32>,
    /// CPU to pin the trigger thread to.
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub buffer_count: u32,
    /// Queue depth required before streaming may start.
    pub min_queued: usize,
    /// Size of the buffer slot table.
    pub max_buffers: usize,
    pub stop_timeout_ms: u64,
}

impl StreamConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor: SensorConfig {
                name: "tof".into(),
                width: 80,
                height: 60,
                max_height: 240,
                line_stride: 1024,
                format: PixelFormat::Argb32,
                formats: vec![PixelFormat::Argb32],
            },
            bus: BusConfig {
                device: "/dev/spidev0.0".into(),
                clock_hz: 18_000_000,
                max_clock_hz: 50_000_000,
                bits_per_word: 32,
                mode: 0,
                max_transfer_bytes: 4096,
                sim_latency_us: 2_000,
                sim_fail_every: None,
            },
            trigger: TriggerConfig {
                source: TriggerKind::Gpio,
                fps: 30,
                gpio_line: Some(17),
                pin_core: None,
            },
            stream: StreamConfig {
                buffer_count: 4,
                min_queued: 2,
                max_buffers: 16,
                stop_timeout_ms: 500,
            },
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `TOFCAP__*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix("TOFCAP").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        let s = &self.stream;
        if s.min_queued < 2 {
            return invalid(format!("min_queued must be at least 2, got {}", s.min_queued));
        }
        if s.max_buffers < s.min_queued {
            return invalid(format!(
                "max_buffers ({}) is below min_queued ({})",
                s.max_buffers, s.min_queued
            ));
        }
        if s.buffer_count as usize > s.max_buffers {
            return invalid(format!(
                "buffer_count ({}) exceeds max_buffers ({})",
                s.buffer_count, s.max_buffers
            ));
        }
        if !matches!(self.bus.bits_per_word, 8 | 16 | 32) {
            return invalid(format!("unsupported word size {}", self.bus.bits_per_word));
        }
        if self.bus.clock_hz == 0 || self.bus.clock_hz > self.bus.max_clock_hz {
            return invalid(format!(
                "clock {} Hz outside 1..={} Hz",
                self.bus.clock_hz, self.bus.max_clock_hz
            ));
        }
        let line = self.sensor.width as usize * self.sensor.format.bytes_per_pixel();
        if self.sensor.line_stride < line {
            return invalid(format!(
                "line stride {} is narrower than a {}-byte line",
                self.sensor.line_stride, line
            ));
        }
        if self.sensor.formats.is_empty() {
            return invalid("sensor lists no pixel formats".into());
        }
        if self.trigger.source == TriggerKind::Gpio && self.trigger.gpio_line.is_none() {
            return invalid("gpio trigger needs gpio_line".into());
        }
        if self.trigger.source == TriggerKind::Interval && self.trigger.fps == 0 {
            return invalid("interval trigger needs a non-zero fps".into());
        }
        Ok(())
    }
}

/// Capture counters, snapshotted from the interrupt-path statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub captured_frames: u64,
    pub transfer_errors: u64,
    /// Edges that found the pending queue empty.
    pub underruns: u64,
    /// Edges that arrived while a transfer was still active.
    pub overlapped_edges: u64,
    /// Edges that arrived after stop disarmed the queue.
    pub disarmed_edges: u64,
    pub cancelled_frames: u64,
    pub lost_deliveries: u64,
    pub avg_transfer_us: u64,
    pub max_transfer_us: u64,
}

impl Metrics {
    /// Export to the installed `metrics` recorder.
    pub fn publish(&self) {
        metrics::counter!("tofcap_frames_captured_total").absolute(self.captured_frames);
        metrics::counter!("tofcap_transfer_errors_total").absolute(self.transfer_errors);
        metrics::counter!("tofcap_underruns_total").absolute(self.underruns);
        metrics::counter!("tofcap_overlapped_edges_total").absolute(self.overlapped_edges);
        metrics::counter!("tofcap_disarmed_edges_total").absolute(self.disarmed_edges);
        metrics::counter!("tofcap_cancelled_frames_total").absolute(self.cancelled_frames);
        metrics::counter!("tofcap_lost_deliveries_total").absolute(self.lost_deliveries);
        metrics::gauge!("tofcap_transfer_avg_us").set(self.avg_transfer_us as f64);
        metrics::gauge!("tofcap_transfer_max_us").set(self.max_transfer_us as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.stream.min_queued, 2);
        assert_eq!(config.sensor.line_stride, 1024);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            [sensor]
            height = 120

            [trigger]
            source = "interval"
            fps = 60

            [stream]
            stop_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.sensor.height, 120);
        assert_eq!(config.sensor.width, 80);
        assert_eq!(config.trigger.source, TriggerKind::Interval);
        assert_eq!(config.trigger.fps, 60);
        assert_eq!(config.stream.stop_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_shallow_minimum_queue() {
        let mut config = Config::default();
        config.stream.min_queued = 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_clock_above_bus_limit() {
        let mut config = Config::default();
        config.bus.clock_hz = config.bus.max_clock_hz + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_narrow_stride() {
        let mut config = Config::default();
        config.sensor.line_stride = 100;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
