//! Command-line interface definitions for the `keel` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Top-level CLI for the `keel` binary.
#[derive(Debug, Parser)]
#[command(
    name = "keel",
    about = "Dump and restore backups using rsync or restic",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Path to the configuration file that lists all backups.
    ///
    /// Defaults to the `config_path` setting, itself defaulting to
    /// `/etc/keel/backups.json`.
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    pub(crate) config_path: Option<Utf8PathBuf>,
    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    pub(crate) log_level: String,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `keel` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run every backup job configured for this host.
    #[command(name = "run", about = "Run every backup job configured for this host")]
    Run,
    /// Validate the configuration for a host.
    #[command(name = "validate-config", about = "Validate the config for the given host")]
    ValidateConfig(ValidateConfigCommand),
    /// Write a script reproducing one job by hand.
    #[command(
        name = "setup-debug-script",
        about = "Write a script reproducing one backup job by hand"
    )]
    SetupDebugScript(SetupDebugScriptCommand),
    /// Check whether the filesystem backing a path is mounted.
    #[command(
        name = "is-mounted",
        about = "Exit 0 when the filesystem backing PATH is mounted"
    )]
    IsMounted(IsMountedCommand),
    /// Restore the latest snapshot of a job on this host.
    #[command(name = "restore", about = "Restore the given backup on this host")]
    Restore(RestoreCommand),
    /// Print `authorized_keys` lines for jobs targeting this host.
    #[command(
        name = "authorized-keys",
        about = "Print authorized_keys lines for backups targeting this host"
    )]
    AuthorizedKeys(AuthorizedKeysCommand),
    /// Report the client key of an sshd session.
    #[command(
        name = "sshd-agent",
        about = "Print the client key of the current sshd session"
    )]
    SshdAgent(SshdAgentCommand),
}

/// Arguments for `keel validate-config`.
#[derive(Debug, Parser)]
pub(crate) struct ValidateConfigCommand {
    /// Host identifier to validate for. Defaults to the local host.
    #[arg(long, short = 'f', value_name = "FQDN")]
    pub(crate) fqdn: Option<String>,
    /// Ignore violations for files and directories that do not exist.
    ///
    /// Useful when validating at build time, before the referenced files are
    /// deployed.
    #[arg(long)]
    pub(crate) ignore_missing_paths: bool,
}

/// Arguments for `keel setup-debug-script`.
#[derive(Debug, Parser)]
pub(crate) struct SetupDebugScriptCommand {
    /// Job to write the script for.
    pub(crate) job: String,
}

/// Arguments for `keel is-mounted`.
#[derive(Debug, Parser)]
pub(crate) struct IsMountedCommand {
    /// Path whose backing filesystem is checked.
    pub(crate) path: Utf8PathBuf,
}

/// Arguments for `keel restore`.
#[derive(Debug, Parser)]
pub(crate) struct RestoreCommand {
    /// Restore into this directory instead of the job's local path.
    #[arg(long, value_name = "PATH")]
    pub(crate) dest_path: Option<Utf8PathBuf>,
    /// Job to restore.
    pub(crate) job: String,
}

/// Arguments for `keel authorized-keys`.
#[derive(Debug, Parser)]
pub(crate) struct AuthorizedKeysCommand {
    /// File holding the certificate authority's public key.
    #[arg(long, value_name = "PATH")]
    pub(crate) ca_public_key: Utf8PathBuf,
}

/// Environment sshd exposes to a forced command.
#[derive(Debug, Parser)]
pub(crate) struct SshdAgentCommand {
    /// File written by sshd's `ExposeAuthInfo`.
    #[arg(long, env = "SSH_USER_AUTH", value_name = "PATH")]
    pub(crate) user_auth: Utf8PathBuf,
    /// Client address, port and server port.
    #[arg(long, env = "SSH_CLIENT", default_value = "")]
    pub(crate) client: String,
    /// Client and server addresses and ports.
    #[arg(long, env = "SSH_CONNECTION", default_value = "")]
    pub(crate) connection: String,
}
