//! Runtime settings loaded via `ortho-config`.
//!
//! These are the knobs that differ between hosts but not between jobs: where
//! the backup document lives, which tool binaries to run, and where status
//! mail goes. Values merge defaults, `keel.toml` and `KEEL_*` environment
//! variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default location of the backup document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/keel/backups.json";

/// Host-wide settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KEEL",
    discovery(
        app_name = "keel",
        env_var = "KEEL_SETTINGS_PATH",
        config_file_name = "keel.toml",
        dotfile_name = ".keel.toml",
        project_file_name = "keel.toml"
    )
)]
pub struct Settings {
    /// Path to the JSON backup document.
    #[ortho_config(default = DEFAULT_CONFIG_PATH.to_owned())]
    pub config_path: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `ssh` executable used as rsync's remote shell.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `restic` executable.
    #[ortho_config(default = "restic".to_owned())]
    pub restic_bin: String,
    /// Path to the `gzip` executable used to compress captured output.
    #[ortho_config(default = "gzip".to_owned())]
    pub gzip_bin: String,
    /// Path to the `findmnt` executable.
    #[ortho_config(default = "findmnt".to_owned())]
    pub findmnt_bin: String,
    /// SMTP relay receiving status mail.
    #[ortho_config(default = "localhost".to_owned())]
    pub smtp_host: String,
    /// Port of the SMTP relay.
    #[ortho_config(default = 25)]
    pub smtp_port: u16,
    /// Sender of status mail.
    #[ortho_config(default = "root@localhost".to_owned())]
    pub mail_from: String,
    /// Recipient of status mail.
    #[ortho_config(default = "root@localhost".to_owned())]
    pub mail_to: String,
    /// Identifier matched against each job's `localHost`. Defaults to the
    /// system hostname.
    pub host_id: Option<String>,
}

/// Tool binaries handed to jobs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolPaths {
    /// `rsync` executable.
    pub rsync: String,
    /// `ssh` executable.
    pub ssh: String,
    /// `restic` executable.
    pub restic: String,
    /// `gzip` executable.
    pub gzip: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rsync: String::from("rsync"),
            ssh: String::from("ssh"),
            restic: String::from("restic"),
            gzip: String::from("gzip"),
        }
    }
}

/// Errors raised while loading or validating settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Parsing or merging configuration layers failed.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// A required value is blank.
    #[error("missing {field}: set KEEL_{env_suffix} or add {field} to keel.toml", env_suffix = field.to_uppercase())]
    InvalidValue {
        /// Setting that failed validation.
        field: String,
    },
    /// The system hostname could not be determined.
    #[error("could not determine the local hostname: {0}")]
    Hostname(String),
}

impl Settings {
    /// Loads settings from defaults, configuration files and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails and
    /// [`SettingsError::InvalidValue`] when a required value is blank.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        let settings = Self::load_from_iter([std::ffi::OsString::from("keel")])
            .map_err(|err| SettingsError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Ensures every required value is present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] naming the first blank field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (value, field) in [
            (self.config_path.as_str(), "config_path"),
            (self.rsync_bin.as_str(), "rsync_bin"),
            (self.ssh_bin.as_str(), "ssh_bin"),
            (self.restic_bin.as_str(), "restic_bin"),
            (self.gzip_bin.as_str(), "gzip_bin"),
            (self.findmnt_bin.as_str(), "findmnt_bin"),
            (self.smtp_host.as_str(), "smtp_host"),
            (self.mail_from.as_str(), "mail_from"),
            (self.mail_to.as_str(), "mail_to"),
        ] {
            Self::require_value(value, field)?;
        }
        Self::require_optional_value(self.host_id.as_deref(), "host_id")
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SettingsError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SettingsError::InvalidValue {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SettingsError> {
        Self::require_optional_value(Some(value), field)
    }

    /// Tool binaries for jobs.
    #[must_use]
    pub fn tool_paths(&self) -> ToolPaths {
        ToolPaths {
            rsync: self.rsync_bin.clone(),
            ssh: self.ssh_bin.clone(),
            restic: self.restic_bin.clone(),
            gzip: self.gzip_bin.clone(),
        }
    }

    /// Identifier matched against each job's `localHost`: the configured
    /// `host_id`, or the system hostname.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Hostname`] when no override is set and the
    /// hostname cannot be read.
    pub fn local_host(&self) -> Result<String, SettingsError> {
        self.host_id
            .as_deref()
            .map_or_else(system_hostname, |host_id| Ok(host_id.trim().to_owned()))
    }
}

/// Returns the system hostname.
///
/// # Errors
///
/// Returns [`SettingsError::Hostname`] when the hostname cannot be read or is
/// not valid UTF-8.
pub fn system_hostname() -> Result<String, SettingsError> {
    let raw = hostname::get().map_err(|err| SettingsError::Hostname(err.to_string()))?;
    raw.into_string().map_err(|value| {
        SettingsError::Hostname(format!("{} is not valid UTF-8", value.to_string_lossy()))
    })
}
