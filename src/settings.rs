//! Ambient program settings.
//!
//! Settings that tune the numerics and the runtime rather than describe a
//! simulation live in INI files. The files are applied in increasing order of
//! precedence, each one overriding only the keys it names:
//!
//! 1. Built-in defaults
//! 2. System configuration (`/etc/qmmm/qmmm.cfg`)
//! 3. User configuration (`~/.config/qmmm/qmmm.cfg`)
//! 4. Local configuration (`./qmmm.cfg`)
//!
//! # Configuration File Format
//!
//! ```ini
//! [general]
//! threads = 0
//! seed = 1234
//!
//! [logging]
//! level = info
//!
//! [eff]
//! rho = 1.0
//! scale_kinetic = false
//!
//! [montecarlo]
//! bead_weight = 0.55
//! acceptance_window = 2000
//! ```

use crate::eff::EffParams;
use crate::montecarlo::{MoveWeights, StepControl};
use configparser::ini::Ini;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of the settings file searched for in every location.
pub const SETTINGS_FILE: &str = "qmmm.cfg";

/// Errors that can occur during settings loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading settings files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid value for a known key
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

type Section = HashMap<String, Option<String>>;

/// All ambient settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Threading and randomness
    pub general: GeneralSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
    /// eFF model parameters
    pub eff: EffParams,
    /// Monte Carlo move weights
    pub moves: MoveWeights,
    /// Monte Carlo step-size control
    pub steps: StepControl,
}

/// General runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeneralSettings {
    /// Worker threads for the process (0 = all available)
    pub threads: usize,
    /// Seed for the random number generator; entropy-seeded when absent
    pub seed: Option<u64>,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: error, warn, info, debug, trace (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// Level filter for `env_logger`; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        log::LevelFilter::from_str(&self.level).unwrap_or(log::LevelFilter::Info)
    }
}

/// Loads settings and remembers where they came from.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads settings from the standard locations.
    ///
    /// Files that fail to parse are skipped with a warning; the defaults are
    /// always a valid fallback.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let candidates = [
            Self::get_system_config_path(),
            Self::get_user_config_path(),
            Some(PathBuf::from(SETTINGS_FILE)),
        ];
        for path in candidates.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            match Self::apply_file(&mut settings, &path) {
                Ok(()) => {
                    debug!("Loaded settings from: {}", path.display());
                    config_source = path.display().to_string();
                }
                Err(e) => warn!("Failed to load settings from {}: {}", path.display(), e),
            }
        }

        info!("Settings loaded from: {}", config_source);
        Ok(Self {
            settings,
            config_source,
        })
    }

    /// Loads settings from one explicit file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::apply_file(&mut settings, path)?;
        Ok(Self {
            settings,
            config_source: path.display().to_string(),
        })
    }

    /// Returns the source of the loaded settings.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Consumes the manager, returning the settings.
    pub fn into_settings(self) -> Settings {
        self.settings
    }

    fn apply_file(settings: &mut Settings, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::apply_str(settings, &content)
    }

    /// Applies INI text on top of `settings`, overriding only the keys present.
    pub fn apply_str(settings: &mut Settings, content: &str) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        let map = ini.get_map_ref();
        for key in unknown_keys(map) {
            warn!("Ignoring unknown setting {}", key);
        }

        if let Some(section) = map.get("general") {
            read_key(section, "threads", &mut settings.general.threads)?;
            if let Some(Some(seed)) = section.get("seed") {
                settings.general.seed = Some(seed.parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("Invalid seed: {}", seed))
                })?);
            }
        }

        if let Some(section) = map.get("logging") {
            read_key(section, "level", &mut settings.logging.level)?;
        }

        if let Some(section) = map.get("eff") {
            let eff = &mut settings.eff;
            read_key(section, "rho", &mut eff.rho)?;
            read_key(section, "sbar", &mut eff.sbar)?;
            read_key(section, "rbar", &mut eff.rbar)?;
            read_key(section, "cutoff", &mut eff.cutoff)?;
            read_key(section, "radius_min", &mut eff.radius_min)?;
            read_key(section, "radius_max", &mut eff.radius_max)?;
            read_key(section, "scale_kinetic", &mut eff.scale_kinetic)?;
            read_key(section, "scale_power", &mut eff.scale_power)?;
        }

        if let Some(section) = map.get("montecarlo") {
            let moves = &mut settings.moves;
            read_key(section, "bead_weight", &mut moves.bead)?;
            read_key(section, "centroid_weight", &mut moves.centroid)?;
            read_key(section, "volume_weight", &mut moves.volume)?;
            read_key(section, "electron_bead_weight", &mut moves.electron_bead)?;
            read_key(section, "electron_centroid_weight", &mut moves.electron_centroid)?;
            read_key(section, "radius_weight", &mut moves.radius)?;
            read_key(section, "swap_weight", &mut moves.spin_swap)?;
            read_key(section, "flip_weight", &mut moves.spin_flip)?;
            let steps = &mut settings.steps;
            read_key(section, "step_min", &mut steps.step_min)?;
            read_key(section, "step_max", &mut steps.step_max)?;
            read_key(section, "centroid_ratio", &mut steps.centroid_ratio)?;
            read_key(section, "acceptance_window", &mut steps.acceptance_window)?;
        }

        Ok(())
    }

    /// Writes a commented settings file holding the built-in defaults.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let eff = EffParams::default();
        let moves = MoveWeights::default();
        let steps = StepControl::default();
        format!(
            r#"# qmmm settings file
#
# Files are applied in order: /etc/qmmm/qmmm.cfg, ~/.config/qmmm/qmmm.cfg,
# ./qmmm.cfg. Later files override only the keys they set.

[general]
# 0 sizes the pool to the machine; set seed for reproducible sampling
threads = {}
# seed = 1234

[logging]
level = {}

[eff]
# Valence-bond mixing parameter
rho = {}
# Radius and distance scaling
sbar = {}
rbar = {}
# Electrostatic cutoff (Angstrom)
cutoff = {}
# Electron radius limits (Angstrom)
radius_min = {}
radius_max = {}
# Scale the kinetic energy by nbeads^scale_power
scale_kinetic = {}
scale_power = {}

[montecarlo]
# Relative move-kind weights
bead_weight = {}
centroid_weight = {}
volume_weight = {}
electron_bead_weight = {}
electron_centroid_weight = {}
radius_weight = {}
swap_weight = {}
flip_weight = {}
# Step-size control (Angstrom)
step_min = {}
step_max = {}
centroid_ratio = {}
acceptance_window = {}
"#,
            GeneralSettings::default().threads,
            LoggingSettings::default().level,
            eff.rho,
            eff.sbar,
            eff.rbar,
            eff.cutoff,
            eff.radius_min,
            eff.radius_max,
            eff.scale_kinetic,
            eff.scale_power,
            moves.bead,
            moves.centroid,
            moves.volume,
            moves.electron_bead,
            moves.electron_centroid,
            moves.radius,
            moves.spin_swap,
            moves.spin_flip,
            steps.step_min,
            steps.step_max,
            steps.centroid_ratio,
            steps.acceptance_window,
        )
    }

    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/qmmm").join(SETTINGS_FILE))
        }
        #[cfg(not(unix))]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("qmmm").join(SETTINGS_FILE))
        }
    }

    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("qmmm")
                    .join(SETTINGS_FILE)
            })
        }
        #[cfg(not(unix))]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("qmmm").join(SETTINGS_FILE))
        }
    }
}

/// Keys read by [`SettingsManager::apply_str`], per section.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("general", &["threads", "seed"]),
    ("logging", &["level"]),
    (
        "eff",
        &[
            "rho",
            "sbar",
            "rbar",
            "cutoff",
            "radius_min",
            "radius_max",
            "scale_kinetic",
            "scale_power",
        ],
    ),
    (
        "montecarlo",
        &[
            "bead_weight",
            "centroid_weight",
            "volume_weight",
            "electron_bead_weight",
            "electron_centroid_weight",
            "radius_weight",
            "swap_weight",
            "flip_weight",
            "step_min",
            "step_max",
            "centroid_ratio",
            "acceptance_window",
        ],
    ),
];

/// `section.key` names that no setting reads, sorted.
fn unknown_keys(map: &HashMap<String, Section>) -> Vec<String> {
    let mut unknown: Vec<String> = map
        .iter()
        .flat_map(|(name, section)| {
            let known = KNOWN_KEYS
                .iter()
                .find(|(section_name, _)| section_name == name)
                .map_or(&[][..], |(_, keys)| *keys);
            section
                .keys()
                .filter(move |key| !known.contains(&key.as_str()))
                .map(move |key| format!("{}.{}", name, key))
        })
        .collect();
    unknown.sort();
    unknown
}

fn read_key<T: FromStr>(section: &Section, key: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Some(Some(raw)) = section.get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_files_override_only_named_keys() {
        let mut settings = Settings::default();
        SettingsManager::apply_str(&mut settings, "[eff]\nrho = 0.5\n[general]\nseed = 7\n")
            .unwrap();
        SettingsManager::apply_str(&mut settings, "[eff]\nsbar = 2.0\n").unwrap();

        assert_eq!(settings.eff.rho, 0.5);
        assert_eq!(settings.eff.sbar, 2.0);
        assert_eq!(settings.general.seed, Some(7));
        assert_eq!(settings.eff.rbar, EffParams::default().rbar);
    }

    #[test]
    fn invalid_value_is_reported() {
        let mut settings = Settings::default();
        let err = SettingsManager::apply_str(&mut settings, "[montecarlo]\nstep_min = fast\n")
            .unwrap_err();
        assert!(err.to_string().contains("step_min"));
    }

    #[test]
    fn unread_keys_are_flagged() {
        let mut ini = Ini::new();
        ini.read("[general]\nthreads = 2\nmax_memory = 4GB\n[cleanup]\nenabled = false\n".to_string())
            .unwrap();
        assert_eq!(
            unknown_keys(ini.get_map_ref()),
            vec!["cleanup.enabled".to_string(), "general.max_memory".to_string()]
        );

        let mut settings = Settings::default();
        SettingsManager::apply_str(&mut settings, "[general]\nthreads = 2\nmax_memory = 4GB\n").unwrap();
        assert_eq!(settings.general.threads, 2);
    }

    #[test]
    fn template_names_only_read_keys() {
        let mut ini = Ini::new();
        ini.read(SettingsManager::generate_template_content()).unwrap();
        assert!(unknown_keys(ini.get_map_ref()).is_empty());
    }

    #[test]
    fn template_round_trips_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        SettingsManager::create_template(&path).unwrap();

        let loaded = SettingsManager::from_file(&path).unwrap().into_settings();
        assert_eq!(loaded.eff.cutoff, EffParams::default().cutoff);
        assert_eq!(loaded.moves.bead, MoveWeights::default().bead);
        assert_eq!(loaded.steps.acceptance_window, StepControl::default().acceptance_window);
        assert_eq!(loaded.logging.level_filter(), log::LevelFilter::Info);
    }
}
