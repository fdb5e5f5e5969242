use crate::types::{ClampMode, PressureSource};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Initial pressure applied on state entry: either a named source (vented,
/// user line) or a numeric regulator set-point in pascals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialPressure {
    Source(PressureSource),
    Pascals(f64),
}

/// Device settings applied when a state starts. Every field is optional;
/// absent fields leave the corresponding device setting untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialConfig {
    pub pressure: Option<InitialPressure>,
    pub clamp_mode: Option<ClampMode>,
    pub clamp_holding: Option<f64>,
    pub test_pulse: Option<bool>,
}

impl InitialConfig {
    pub fn new(
        pressure: InitialPressure,
        clamp_mode: ClampMode,
        clamp_holding: f64,
        test_pulse: bool,
    ) -> Self {
        Self {
            pressure: Some(pressure),
            clamp_mode: Some(clamp_mode),
            clamp_holding: Some(clamp_holding),
            test_pulse: Some(test_pulse),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Bath stage parameters. Resistances in ohms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BathConfig {
    #[serde(flatten)]
    pub init: InitialConfig,
    /// Resistance above which the tip is considered immersed.
    pub bath_threshold: f64,
    /// Drop below baseline (negative) signalling a broken tip.
    pub break_threshold: f64,
    /// Rise above baseline signalling a clogged tip.
    pub clog_threshold: f64,
}

impl Default for BathConfig {
    fn default() -> Self {
        Self {
            // 0.5 PSI of positive pressure keeps the tip clear while entering
            init: InitialConfig::new(
                InitialPressure::Pascals(3500.0),
                ClampMode::Vc,
                0.0,
                true,
            ),
            bath_threshold: 50e6,
            break_threshold: -1e6,
            clog_threshold: 1e6,
        }
    }
}

/// Pipette advance direction while hunting for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvanceMode {
    /// Straight down.
    Vertical,
    /// Along the pipette axis.
    Axial,
    /// Toward the stored target position.
    Target,
}

/// Cell detection stage parameters. Distances in meters, durations in
/// seconds, resistances in ohms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDetectConfig {
    #[serde(flatten)]
    pub init: InitialConfig,
    pub auto_advance: bool,
    pub advance_mode: AdvanceMode,
    pub advance_interval_secs: f64,
    pub advance_step_distance: f64,
    pub max_advance_distance: f64,
    pub advance_speed: f64,
    pub fast_detection_threshold: f64,
    pub slow_detection_threshold: f64,
    pub slow_detection_steps: usize,
    pub break_threshold: f64,
}

impl Default for CellDetectConfig {
    fn default() -> Self {
        Self {
            init: InitialConfig {
                pressure: None,
                clamp_mode: Some(ClampMode::Vc),
                clamp_holding: Some(0.0),
                test_pulse: Some(true),
            },
            auto_advance: true,
            advance_mode: AdvanceMode::Vertical,
            advance_interval_secs: 0.5,
            advance_step_distance: 1e-6,
            max_advance_distance: 20e-6,
            advance_speed: 32e-6,
            fast_detection_threshold: 1e6,
            slow_detection_threshold: 0.3e6,
            slow_detection_steps: 3,
            break_threshold: -1e6,
        }
    }
}

/// Pressure control ownership during seal formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureMode {
    /// Slope-driven regulator control.
    Auto,
    /// Pressure left to the operator.
    User,
}

/// Seal stage parameters, shared by the break-in stage under its own
/// defaults. Resistances in ohms, potentials in volts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    #[serde(flatten)]
    pub init: InitialConfig,
    pub pressure_mode: PressureMode,
    /// Resistance above which the holding potential is latched on.
    pub holding_threshold: f64,
    pub holding_potential: f64,
    /// Resistance above which the seal counts as formed.
    pub seal_threshold: f64,
    /// Sliding-window length for the resistance slope estimate.
    pub n_slope_samples: usize,
    pub auto_seal_timeout_secs: f64,
    /// Time held at atmosphere before the regulator takes over.
    pub pressure_hold_secs: f64,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            init: InitialConfig {
                pressure: None,
                clamp_mode: Some(ClampMode::Vc),
                clamp_holding: Some(0.0),
                test_pulse: Some(true),
            },
            pressure_mode: PressureMode::Auto,
            holding_threshold: 100e6,
            holding_potential: -70e-3,
            seal_threshold: 1e9,
            n_slope_samples: 5,
            auto_seal_timeout_secs: 380.0,
            pressure_hold_secs: 5.0,
        }
    }
}

/// One pressure step of a cleaning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureStep {
    pub pressure: f64,
    pub dwell_secs: f64,
}

impl PressureStep {
    pub fn new(pressure: f64, dwell_secs: f64) -> Self {
        Self {
            pressure,
            dwell_secs,
        }
    }
}

/// Clean stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanConfig {
    #[serde(flatten)]
    pub init: InitialConfig,
    pub clean_sequence: Vec<PressureStep>,
    pub rinse_sequence: Vec<PressureStep>,
    /// Height above the stored well position used as a safe approach point.
    pub approach_height: f64,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            init: InitialConfig::new(
                InitialPressure::Source(PressureSource::Atmosphere),
                ClampMode::Vc,
                0.0,
                true,
            ),
            clean_sequence: vec![PressureStep::new(-5.0, 30.0), PressureStep::new(5.0, 45.0)],
            rinse_sequence: vec![PressureStep::new(-5.0, 30.0), PressureStep::new(5.0, 45.0)],
            approach_height: 5e-3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String,
    pub session_logging: bool,
    pub log_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session_logging: true,
            log_path: "./logs".to_string(),
        }
    }
}

/// Complete controller configuration: one fully resolved section per state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub out: InitialConfig,
    pub approach: InitialConfig,
    pub attached: InitialConfig,
    pub whole_cell: InitialConfig,
    pub broken: InitialConfig,
    pub fouled: InitialConfig,
    pub bath: BathConfig,
    pub cell_detect: CellDetectConfig,
    pub seal: SealConfig,
    pub break_in: SealConfig,
    pub clean: CleanConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let atmosphere = InitialPressure::Source(PressureSource::Atmosphere);
        Self {
            logging: LoggingConfig::default(),
            out: InitialConfig::new(atmosphere, ClampMode::Vc, 0.0, false),
            approach: InitialConfig::empty(),
            attached: InitialConfig::new(atmosphere, ClampMode::Vc, -70e-3, true),
            whole_cell: InitialConfig::new(atmosphere, ClampMode::Vc, -70e-3, true),
            broken: InitialConfig::new(atmosphere, ClampMode::Vc, 0.0, true),
            fouled: InitialConfig::new(atmosphere, ClampMode::Vc, 0.0, true),
            bath: BathConfig::default(),
            cell_detect: CellDetectConfig::default(),
            seal: SealConfig::default(),
            break_in: SealConfig::default(),
            clean: CleanConfig::default(),
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        // Try common config file locations
        let possible_paths = ["autopatch.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Add environment variable overrides with prefix "AUTOPATCH_"
    builder = builder.add_source(
        Environment::with_prefix("AUTOPATCH")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
