//! Configuration management for muttpu.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::{self, AppPaths};

const APP_NAME: &str = "muttpu";

/// How to run the external exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Program to execute (resolved on PATH).
    pub program: String,
    /// Script passed as the first argument, if the program is an interpreter.
    pub script: Option<String>,
    /// Token file whose presence means authentication was set up.
    pub credential_file: String,
    /// Binaries that must be on PATH for the exporter to work.
    pub dependencies: Vec<String>,
    /// Kill an exporter invocation after this many seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            script: Some("muttpu.py".to_string()),
            credential_file: paths::default_credential_file(),
            dependencies: vec!["gpg".to_string(), "neomutt".to_string()],
            timeout_secs: None,
        }
    }
}

impl ExporterConfig {
    /// Credential file path with `~` and variables expanded.
    pub fn credential_path(&self) -> Result<PathBuf> {
        paths::expand_str_path(&self.credential_file)
    }

    /// Script path with `~` and variables expanded.
    pub fn script_path(&self) -> Result<Option<PathBuf>> {
        self.script
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(paths::expand_str_path)
            .transpose()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Export queue configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of exports running at once (0 = unlimited).
    pub max_concurrent: usize,
}

impl QueueConfig {
    pub fn limit(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Exporter invocation settings.
    pub exporter: ExporterConfig,
    /// Export queue settings.
    pub queue: QueueConfig,
}

impl AppConfig {
    /// Load configuration from paths with environment overlay.
    pub fn load(paths: &AppPaths) -> Result<Self> {
        let env_prefix = env_prefix();
        let defaults = ExporterConfig::default();
        let mut builder = Config::builder()
            .add_source(
                File::from(paths.global_config.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                File::from(paths.local_config.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(&env_prefix).separator("__"));

        if let Some(cli_cfg) = &paths.cli_config {
            builder = builder.add_source(
                File::from(cli_cfg.as_path())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder
            .set_default("exporter.program", defaults.program)?
            .set_default("exporter.credential_file", defaults.credential_file)?
            .set_default("exporter.dependencies", defaults.dependencies)?
            .set_default("queue.max_concurrent", 0)?;

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Write default config to a path.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("creating config directory {parent:?}: {e}")))?;
        }
        let cfg = AppConfig::default();
        let toml = toml::to_string_pretty(&cfg)
            .map_err(|e| Error::Config(format!("serializing default config: {e}")))?;
        let mut content = String::new();
        content.push_str("# muttpu configuration\n");
        content.push_str(
            "# Place this file at $XDG_CONFIG_HOME/muttpu/config.toml (or ~/.config/muttpu/config.toml)\n",
        );
        content.push_str("# queue.max_concurrent = 0 runs every queued export at once\n\n");
        content.push_str(&toml);
        content.push('\n');
        fs::write(path, content)
            .map_err(|e| Error::Config(format!("writing config file to {}: {e}", path.display())))
    }

    /// Ensure default config exists, creating it if necessary.
    pub fn ensure_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        Self::write_default(path)
    }
}

/// Generate environment variable prefix from app name.
fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_paths(dir: &Path) -> AppPaths {
        AppPaths {
            global_config: dir.join("config.toml"),
            local_config: dir.join("local.toml"),
            cli_config: None,
            settings_file: dir.join("settings.json"),
        }
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.exporter.program, "python3");
        assert_eq!(config.exporter.dependencies, vec!["gpg", "neomutt"]);
        assert!(config.exporter.timeout().is_none());
        assert!(config.queue.limit().is_none());
    }

    #[test]
    fn test_queue_limit() {
        let queue = QueueConfig { max_concurrent: 3 };
        assert_eq!(queue.limit(), Some(3));
    }

    #[test]
    fn test_zero_timeout_is_disabled() {
        let exporter = ExporterConfig {
            timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(exporter.timeout().is_none());
    }

    #[test]
    fn test_write_default_config() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.toml");
        AppConfig::write_default(&config_path).unwrap();
        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("[exporter]"));
        assert!(content.contains("credential_file"));
        assert!(content.contains("max_concurrent"));
    }

    #[test]
    fn test_load_reads_file_over_defaults() {
        let temp = TempDir::new().unwrap();
        let paths = test_paths(temp.path());
        fs::write(
            &paths.global_config,
            "[exporter]\nprogram = \"/opt/bin/python3\"\ntimeout_secs = 30\n\n[queue]\nmax_concurrent = 2\n",
        )
        .unwrap();

        let config = AppConfig::load(&paths).unwrap();
        assert_eq!(config.exporter.program, "/opt/bin/python3");
        assert_eq!(config.exporter.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.queue.limit(), Some(2));
        assert_eq!(config.exporter.dependencies, vec!["gpg", "neomutt"]);
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "MUTTPU");
    }
}
