//! Binary entry point for the keel CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use keel::{
    CaClient, CertificateError, Config, ConfigError, Dump, DumpError, FindmntOracle,
    JobEnvironment, MountError, MountOracle, Notifier, ProcessCommandRunner, Restore,
    RestoreError, Settings, SettingsError, SmtpMailer, authorized_keys, client_key_from_auth_info,
    files, setup_debug_script,
};

use cli::{
    AuthorizedKeysCommand, Cli, Command, IsMountedCommand, RestoreCommand,
    SetupDebugScriptCommand, SshdAgentCommand, ValidateConfigCommand,
};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("invalid SSH_USER_AUTH: {0}")]
    Certificate(#[from] CertificateError),
    #[error("failed to read {path}: {message}")]
    Read { path: Utf8PathBuf, message: String },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

/// Settings plus the resolved document path.
struct Context {
    settings: Settings,
    config_path: Utf8PathBuf,
}

impl Context {
    fn load(config_path: Option<Utf8PathBuf>) -> Result<Self, CliError> {
        let settings = Settings::load_without_cli_args()?;
        let resolved = config_path.unwrap_or_else(|| Utf8PathBuf::from(&settings.config_path));
        Ok(Self {
            settings,
            config_path: resolved,
        })
    }

    fn config_for(&self, host: &str) -> Result<Config, CliError> {
        Ok(Config::load(&self.config_path, host)?)
    }

    fn mounts(&self) -> FindmntOracle<ProcessCommandRunner> {
        FindmntOracle::new(self.settings.findmnt_bin.as_str(), ProcessCommandRunner)
    }
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let context = Context::load(cli.config_path)?;
    match cli.command {
        Command::Run => run(&context).await,
        Command::ValidateConfig(args) => validate_config(&context, &args),
        Command::SetupDebugScript(args) => debug_script(&context, &args).await,
        Command::IsMounted(args) => is_mounted(&context, &args),
        Command::Restore(args) => restore(&context, &args),
        Command::AuthorizedKeys(args) => print_authorized_keys(&context, &args),
        Command::SshdAgent(args) => sshd_agent(&args),
    }
}

async fn certificate_issuer(config: &Config) -> Option<CaClient> {
    let transport = config.transport()?;
    CaClient::new(&transport.authority, &transport.identity)
        .await
        .inspect_err(|err| {
            error!(error = %err, "could not set up the certificate authority client");
        })
        .ok()
}

async fn run(context: &Context) -> Result<i32, CliError> {
    let host = context.settings.local_host()?;
    let config = context.config_for(&host)?;
    let issuer = certificate_issuer(&config).await;
    let tools = context.settings.tool_paths();
    let env = JobEnvironment {
        config: &config,
        runner: &ProcessCommandRunner,
        issuer: issuer.as_ref(),
        tools: &tools,
        hostname: &host,
    };
    let mounts = context.mounts();
    let notifier = Notifier::new(SmtpMailer::new(
        context.settings.smtp_host.as_str(),
        context.settings.smtp_port,
        context.settings.mail_from.as_str(),
        context.settings.mail_to.as_str(),
    ));

    let summary = Dump::new(env, &mounts, &notifier).run().await;
    Ok(if summary.all_succeeded() { 0 } else { 1 })
}

fn validate_config(context: &Context, args: &ValidateConfigCommand) -> Result<i32, CliError> {
    let host = match &args.fqdn {
        Some(fqdn) => fqdn.clone(),
        None => context.settings.local_host()?,
    };
    let violations = match Config::load(&context.config_path, &host) {
        Ok(_) => None,
        Err(ConfigError::Invalid(err)) if args.ignore_missing_paths => err.without_missing_paths(),
        Err(ConfigError::Invalid(err)) => Some(err),
        Err(err) => return Err(err.into()),
    };
    let Some(err) = violations else {
        info!(host = %host, path = %context.config_path, "configuration is valid");
        return Ok(0);
    };
    writeln!(io::stdout(), "{}", err.render_grouped())?;
    Ok(1)
}

async fn debug_script(
    context: &Context,
    args: &SetupDebugScriptCommand,
) -> Result<i32, CliError> {
    let host = context.settings.local_host()?;
    let config = context.config_for(&host)?;
    let issuer = certificate_issuer(&config).await;
    let tools = context.settings.tool_paths();
    let env = JobEnvironment {
        config: &config,
        runner: &ProcessCommandRunner,
        issuer: issuer.as_ref(),
        tools: &tools,
        hostname: &host,
    };
    let directory = setup_debug_script(&env, &args.job).await?;
    writeln!(io::stdout(), "{directory}")?;
    Ok(0)
}

fn is_mounted(context: &Context, args: &IsMountedCommand) -> Result<i32, CliError> {
    let mounted = context.mounts().is_mounted(&args.path)?;
    Ok(if mounted { 0 } else { 1 })
}

fn restore(context: &Context, args: &RestoreCommand) -> Result<i32, CliError> {
    let host = context.settings.local_host()?;
    let config = context.config_for(&host)?;
    let mounts = context.mounts();
    let destination = Restore::new(
        &config,
        &ProcessCommandRunner,
        &mounts,
        &context.settings.restic_bin,
    )
    .run(&args.job, args.dest_path.as_deref())?;
    info!(job = %args.job, destination = %destination, "restore finished");
    Ok(0)
}

fn read_file(path: &Utf8Path) -> Result<String, CliError> {
    files::read_to_string(path).map_err(|err| CliError::Read {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

fn print_authorized_keys(
    context: &Context,
    args: &AuthorizedKeysCommand,
) -> Result<i32, CliError> {
    let host = context.settings.local_host()?;
    let config = context.config_for(&host)?;
    let ca_public_key = read_file(&args.ca_public_key)?;
    let mut stdout = io::stdout().lock();
    for line in authorized_keys(&config, &host, &ca_public_key) {
        writeln!(stdout, "{line}")?;
    }
    Ok(0)
}

fn sshd_agent(args: &SshdAgentCommand) -> Result<i32, CliError> {
    let client_key = client_key_from_auth_info(&read_file(&args.user_auth)?)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "SSH_CLIENT={}", args.client)?;
    writeln!(stdout, "SSH_CONNECTION={}", args.connection)?;
    writeln!(stdout, "SSH_USER_AUTH={}", args.user_auth)?;
    writeln!(stdout, "Client public key = {client_key}")?;
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
