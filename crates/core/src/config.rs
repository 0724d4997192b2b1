use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceCapacity;
use crate::error::SpawnError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Device configuration for the software SIMT device.
///
/// Defaults match the smallest standard build of the simulator:
/// 4 cores, 4 warps per core, 4 lanes per warp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub device: DeviceSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSection {
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_warps_per_core")]
    pub warps_per_core: u32,
    #[serde(default = "default_lanes_per_warp")]
    pub lanes_per_warp: u32,
}

fn default_cores() -> u32 { 4 }
fn default_warps_per_core() -> u32 { 4 }
fn default_lanes_per_warp() -> u32 { 4 }

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            warps_per_core: default_warps_per_core(),
            lanes_per_warp: default_lanes_per_warp(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            device: DeviceSection::default(),
        }
    }
}

impl DeviceConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `WARPSPAWN_PROFILE`. When set (e.g. `BIG`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("WARPSPAWN_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            device: DeviceSection {
                cores: profiled_env_u32(p, "NUM_CORES", default_cores()),
                warps_per_core: profiled_env_u32(p, "NUM_WARPS", default_warps_per_core()),
                lanes_per_warp: profiled_env_u32(p, "NUM_THREADS", default_lanes_per_warp()),
            },
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, SpawnError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpawnError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `WARPSPAWN_DEVICE_KEY` overrides `device.key`:
    /// - `WARPSPAWN_DEVICE_CORES` -> `device.cores`
    /// - `WARPSPAWN_DEVICE_WARPS_PER_CORE` -> `device.warps_per_core`
    /// - `WARPSPAWN_DEVICE_LANES_PER_WARP` -> `device.lanes_per_warp`
    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut u32); 3] = [
            ("WARPSPAWN_DEVICE_CORES", &mut self.device.cores),
            ("WARPSPAWN_DEVICE_WARPS_PER_CORE", &mut self.device.warps_per_core),
            ("WARPSPAWN_DEVICE_LANES_PER_WARP", &mut self.device.lanes_per_warp),
        ];
        for (key, slot) in overrides {
            if let Some(v) = env_opt(key).and_then(|v| v.parse::<u32>().ok()) {
                *slot = v;
            }
        }
    }

    /// Validate the config by building the capacity it describes.
    pub fn validate(&self) -> Result<(), SpawnError> {
        self.capacity().map(|_| ())
    }

    /// The device capacity this config describes.
    pub fn capacity(&self) -> Result<DeviceCapacity, SpawnError> {
        DeviceCapacity::new(
            self.device.cores,
            self.device.warps_per_core,
            self.device.lanes_per_warp,
        )
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  device:      cores={}, warps_per_core={}, lanes_per_warp={}",
            self.device.cores,
            self.device.warps_per_core,
            self.device.lanes_per_warp
        );
    }

    /// Summary suitable for JSON reports.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "device": {
                "cores": self.device.cores,
                "warps_per_core": self.device.warps_per_core,
                "lanes_per_warp": self.device.lanes_per_warp,
                "lanes_per_core": self.device.warps_per_core as u64 * self.device.lanes_per_warp as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.device.cores, 4);
        assert_eq!(cfg.device.warps_per_core, 4);
        assert_eq!(cfg.device.lanes_per_warp, 4);
        assert_eq!(cfg.profile_label(), "default");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_minimal_toml() {
        let cfg = DeviceConfig::from_toml("").unwrap();
        assert_eq!(cfg.device, DeviceSection::default());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
profile = "wide"

[device]
cores = 16
warps_per_core = 8
lanes_per_warp = 32
"#;
        let cfg = DeviceConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.profile_label(), "wide");
        let cap = cfg.capacity().unwrap();
        assert_eq!(cap.cores, 16);
        assert_eq!(cap.lanes_per_core(), 256);
    }

    #[test]
    fn partial_section_uses_field_defaults() {
        let cfg = DeviceConfig::from_toml("[device]\ncores = 2\n").unwrap();
        assert_eq!(cfg.device.cores, 2);
        assert_eq!(cfg.device.warps_per_core, 4);
    }

    #[test]
    fn invalid_capacity_rejected() {
        let err = DeviceConfig::from_toml("[device]\nlanes_per_warp = 64\n").unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCapacity(_)));
        let err = DeviceConfig::from_toml("[device]\ncores = 0\n").unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCapacity(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = DeviceConfig::from_toml("[device\ncores = ").unwrap_err();
        assert!(matches!(err, SpawnError::ConfigParse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = DeviceConfig::from_file("/nonexistent/warpspawn.toml").unwrap_err();
        assert!(matches!(err, SpawnError::ConfigIo(_)));
    }

    #[test]
    fn profiled_env_prefers_prefixed_key() {
        // Unique profile name so parallel tests never observe these vars.
        env::set_var("CFGTESTPROFILE_NUM_CORES", "12");
        env::set_var("CFGTESTPROFILE_NUM_THREADS", "16");
        let cfg = DeviceConfig::for_profile("cfgtestprofile");
        assert_eq!(cfg.profile, "CFGTESTPROFILE");
        assert_eq!(cfg.device.cores, 12);
        assert_eq!(cfg.device.lanes_per_warp, 16);
        env::remove_var("CFGTESTPROFILE_NUM_CORES");
        env::remove_var("CFGTESTPROFILE_NUM_THREADS");
    }

    #[test]
    fn summary_reports_lanes_per_core() {
        let summary = DeviceConfig::default().summary();
        assert_eq!(summary["device"]["lanes_per_core"], 16);
        assert_eq!(summary["profile"], "default");
    }
}
