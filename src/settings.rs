//! Typed root-level settings, loaded once at startup.
//!
//! The group-scoped, per-printer configuration ([`crate::config::ConfigView`])
//! stays an untyped `toml::Value` tree because printer and storage-server
//! group names are operator-chosen and open-ended. The handful of values
//! that are always present and always meaningful before a single
//! association has been accepted -- the listen port, concurrency limit,
//! spool directory, log level -- are worth a real struct, deserialized the
//! same way the oxidicom service's `OxidicomEnvOptions` was: `figment`
//! layering a TOML file under environment variable overrides.

use std::num::NonZeroUsize;

use camino::Utf8PathBuf;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Process-wide settings read once at startup and handed to the supervisor.
///
/// Per-printer and per-storage-server settings are *not* part of this
/// struct; those live in the `[PrinterAE]`/`[info]`/`[tag]` groups of the
/// same file and are read on demand through [`crate::config::ConfigView`]
/// while an association is being negotiated or a dataset is being routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the TOML document backing both this struct and
    /// [`crate::config::ConfigView`].
    pub config_path: Utf8PathBuf,

    /// TCP port the Print SCP listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Our AE title, checked against the called AE title of incoming
    /// associations unless a printer-specific override matches instead.
    #[serde(default = "default_aetitle")]
    pub aetitle: String,

    /// Maximum number of associations served concurrently; additional
    /// connections queue behind a semaphore rather than being refused
    /// outright (see `SPEC_FULL.md` C8).
    #[serde(default = "default_max_associations")]
    pub max_associations: NonZeroUsize,

    /// Association idle timeout, `timeout` in the original's `QSettings`
    /// schema.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: std::time::Duration,

    /// Directory instances are spooled to pending upstream delivery.
    #[serde(default = "default_spool_path")]
    pub spool_path: Utf8PathBuf,

    /// How often the retry worker wakes to sweep the spool directory.
    #[serde(
        with = "humantime_serde",
        default = "default_spool_interval",
        rename = "spool-interval-in-seconds"
    )]
    pub spool_interval: std::time::Duration,

    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"` or
    /// `"vdicomprint=debug,dicom_ul=warn"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default upstream storage peers, used when a printer group does not
    /// list its own `storage-servers`.
    #[serde(default)]
    pub storage_servers: Vec<String>,
}

impl Settings {
    /// Load settings from `path`, with `VDICOMPRINT_`-prefixed environment
    /// variables taking precedence over the file, and built-in defaults
    /// under both.
    pub fn load(path: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let defaults = Settings {
            config_path: path.clone(),
            port: default_port(),
            aetitle: default_aetitle(),
            max_associations: default_max_associations(),
            timeout: default_timeout(),
            spool_path: default_spool_path(),
            spool_interval: default_spool_interval(),
            log_level: default_log_level(),
            storage_servers: Vec::new(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(Toml::file(path.as_std_path()))
            .merge(Env::prefixed("VDICOMPRINT_"));

        Ok(figment.extract::<Settings>()?)
    }
}

fn default_port() -> u16 {
    10005
}

fn default_aetitle() -> String {
    "VIRTUALPRINTER".to_string()
}

fn default_max_associations() -> NonZeroUsize {
    NonZeroUsize::new(16).unwrap()
}

fn default_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

fn default_spool_path() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/spool/vdicomprint")
}

fn default_spool_interval() -> std::time::Duration {
    std::time::Duration::from_secs(600)
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_file_is_sparse() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"port = 1114\n").unwrap();
        let path = Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        let settings = Settings::load(path).unwrap();
        assert_eq!(settings.port, 1114);
        assert_eq!(settings.aetitle, "VIRTUALPRINTER");
        assert_eq!(settings.spool_interval, std::time::Duration::from_secs(600));
    }

    #[test]
    fn env_override_wins_over_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"port = 1114\n").unwrap();
        let path = Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        std::env::set_var("VDICOMPRINT_PORT", "1116");
        let settings = Settings::load(path).unwrap();
        std::env::remove_var("VDICOMPRINT_PORT");

        assert_eq!(settings.port, 1116);
    }
}
