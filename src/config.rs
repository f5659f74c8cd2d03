use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::err::Result;
use crate::retry::RetryPolicy;

/// Runtime settings. Every field has a default so an absent file is valid.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub wait: WaitConfig,
    pub input: InputConfig,
    pub overlay: OverlayConfig,
    pub log: LogConfig,
}

/// The module whose code section is scanned for patch sites.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    pub module: String,
    pub section: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            module: "libminecraftpe.so".to_string(),
            section: ".text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WaitConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60_000,
            interval_ms: 1,
        }
    }
}

impl WaitConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    pub preloader_module: String,
    pub preloader_symbol: String,
    pub legacy_module: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            preloader_module: "libpreloader.so".to_string(),
            preloader_symbol: "GetPreloaderInput".to_string(),
            legacy_module: "libinput.so".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlayConfig {
    pub reference_height: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub base_font_px: f32,
    pub style_factor: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            reference_height: 720.0,
            min_scale: 1.5,
            max_scale: 4.0,
            base_font_px: 18.0,
            style_factor: 0.65,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log to `directory/file_name` when set, stderr otherwise.
    pub directory: Option<PathBuf>,
    pub file_name: String,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_name: "hookpatch.log".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub const PATH_ENV: &'static str = "HOOKPATCH_CONFIG";

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads `path`, falling back to the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads from `$HOOKPATCH_CONFIG` if set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(Self::PATH_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::parse(
            r#"
            [target]
            module = "libgame.so"

            [wait]
            interval_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.target.module, "libgame.so");
        assert_eq!(config.target.section, ".text");
        assert_eq!(config.wait.interval_ms, 5);
        assert_eq!(config.wait.max_attempts, 60_000);
        assert_eq!(config.input, InputConfig::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[wait]\nmax_attempts = \"many\"").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_log_directory() {
        let config = Config::parse("[log]\ndirectory = \"/data/local/tmp\"\nlevel = \"debug\"").unwrap();
        assert_eq!(config.log.directory, Some(PathBuf::from("/data/local/tmp")));
        assert_eq!(config.log.file_name, "hookpatch.log");
        assert_eq!(config.log.level, "debug");
    }
}
