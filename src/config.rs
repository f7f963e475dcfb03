//! Engine configuration and the context shared by builder, simulator and
//! driver.
//!
//! Configuration is read from an optional TOML file, then environment
//! variables override individual fields:
//!
//! ```toml
//! # chipsim.toml
//! target_ticks_per_second = 1000.0
//! steps_per_clock_transition = 250
//! ```
//!
//! `CHIPSIM_TICK_RATE` and `CHIPSIM_STEPS_PER_CLOCK` override the two fields
//! above.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SimError};
use crate::library::{ChipLibrary, MemoryLibrary};

pub const TICK_RATE_VAR: &str = "CHIPSIM_TICK_RATE";
pub const STEPS_PER_CLOCK_VAR: &str = "CHIPSIM_STEPS_PER_CLOCK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Ticks the driver aims to run per second. Zero or less runs unthrottled.
    pub target_ticks_per_second: f64,
    /// Ticks between two transitions of every clock chip.
    pub steps_per_clock_transition: u32,
    /// How long a paused driver sleeps between checks.
    pub paused_poll_ms: u64,
    /// Window of the rolling ticks-per-second measurement.
    pub tps_window_ms: u64,
    /// Width of a pulse chip that declares none.
    pub default_pulse_width: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            target_ticks_per_second: 1000.0,
            steps_per_clock_transition: 250,
            paused_poll_ms: 16,
            tps_window_ms: 1000,
            default_pulse_width: 1,
        }
    }
}

impl SimConfig {
    /// Load the configuration file at `path` if given, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let config_error = |msg: String| {
            SimError::new(ErrorKind::Config(Some(path.to_path_buf())), msg)
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("Failed to read {}: {}", path.display(), e)))?;
        let config = toml::from_str(&content)
            .map_err(|e| config_error(format!("Failed to parse {}: {}", path.display(), e)))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from a variable source. Unparseable values are logged
    /// and ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(rate) = var(TICK_RATE_VAR) {
            match rate.trim().parse() {
                Ok(r) => {
                    log::info!("Using {} from environment: {}", TICK_RATE_VAR, r);
                    self.target_ticks_per_second = r;
                }
                Err(e) => log::warn!("Ignoring {}={:?}: {}", TICK_RATE_VAR, rate, e),
            }
        }
        if let Some(steps) = var(STEPS_PER_CLOCK_VAR) {
            match steps.trim().parse() {
                Ok(s) => {
                    log::info!("Using {} from environment: {}", STEPS_PER_CLOCK_VAR, s);
                    self.steps_per_clock_transition = s;
                }
                Err(e) => log::warn!("Ignoring {}={:?}: {}", STEPS_PER_CLOCK_VAR, steps, e),
            }
        }
    }

    /// Target duration of one tick, or None when unthrottled.
    pub fn tick_duration(&self) -> Option<Duration> {
        if self.target_ticks_per_second > 0.0 && self.target_ticks_per_second.is_finite() {
            Some(Duration::from_secs_f64(1.0 / self.target_ticks_per_second))
        } else {
            None
        }
    }

    pub fn paused_poll(&self) -> Duration {
        Duration::from_millis(self.paused_poll_ms)
    }

    pub fn tps_window(&self) -> Duration {
        Duration::from_millis(self.tps_window_ms.max(1))
    }

    pub fn sample_config() -> String {
        r#"# chipsim configuration

# Ticks per second the simulation thread aims for. 0 runs as fast as possible.
target_ticks_per_second = 1000.0

# Ticks between two transitions of a clock chip.
steps_per_clock_transition = 250

# Sleep between checks while paused, in milliseconds.
# paused_poll_ms = 16

# Window of the ticks-per-second measurement, in milliseconds.
# tps_window_ms = 1000
"#
        .to_string()
    }
}

/// Everything the engine needs besides the chip itself. Built once at
/// startup and shared by `Arc`.
#[derive(Clone)]
pub struct SimContext {
    pub config: SimConfig,
    pub library: Arc<dyn ChipLibrary>,
}

impl SimContext {
    pub fn new(config: SimConfig, library: Arc<dyn ChipLibrary>) -> SimContext {
        SimContext { config, library }
    }
}

impl Default for SimContext {
    fn default() -> Self {
        SimContext {
            config: SimConfig::default(),
            library: Arc::new(MemoryLibrary::default()),
        }
    }
}
