//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::ca::{CaError, CertificateIssuer, CertificateRequest, IssueFuture, IssuedCertificate};
use crate::certificate::{
    CertificateKind, ED25519_CERT_TYPE, FORCE_COMMAND, put_string, put_u32, put_u64,
};
use crate::config::{Config, ConfigError};
use crate::mount::{MountError, MountOracle};
use crate::notify::{Mailer, NotifyError, StatusReport};
use crate::process::{ChildStdio, CommandOutput, CommandRunner, CommandSpec, ProcessError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Streaming runs consume the exit code of the next response and drop the
/// stdio handles they are given.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Environment overrides passed to the program.
    pub envs: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn next_response(&self, invocation: CommandInvocation) -> Result<CommandOutput, ProcessError> {
        let program = invocation.program.clone();
        lock(&self.invocations).push(invocation);
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ProcessError::Spawn {
                program,
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        self.next_response(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            envs: Vec::new(),
        })
    }

    fn run_streaming(
        &self,
        command: &CommandSpec,
        stdio: ChildStdio,
    ) -> Result<Option<i32>, ProcessError> {
        drop(stdio);
        let output = self.next_response(CommandInvocation {
            program: command.program.clone(),
            args: command.args.clone(),
            envs: command.envs.clone(),
        })?;
        Ok(output.code)
    }
}

/// Mount oracle answering from a fixed list of mounted directories.
#[derive(Clone, Debug, Default)]
pub struct StaticMountOracle {
    mounted: Option<Vec<Utf8PathBuf>>,
}

impl StaticMountOracle {
    /// Reports every path as mounted.
    #[must_use]
    pub const fn all_mounted() -> Self {
        Self { mounted: None }
    }

    /// Reports paths under one of `roots` as mounted and everything else as
    /// unmounted.
    #[must_use]
    pub fn mounted<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            mounted: Some(roots.into_iter().map(Into::into).collect()),
        }
    }

    /// Reports every path as unmounted.
    #[must_use]
    pub fn none_mounted() -> Self {
        Self {
            mounted: Some(Vec::new()),
        }
    }
}

impl MountOracle for StaticMountOracle {
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, MountError> {
        Ok(self
            .mounted
            .as_ref()
            .is_none_or(|roots| roots.iter().any(|root| path.starts_with(root))))
    }
}

/// A notification captured by [`RecordingMailer`], with captures already
/// decompressed because the working directory is gone after notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedMail {
    /// Subject line.
    pub subject: String,
    /// Execution log lines.
    pub exec_log: Vec<String>,
    /// Decompressed stdout capture, if any.
    pub stdout: Option<String>,
    /// Decompressed stderr capture, if any.
    pub stderr: Option<String>,
}

fn decompress(path: &Utf8Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut text = String::new();
    MultiGzDecoder::new(file).read_to_string(&mut text).ok()?;
    Some(text)
}

/// Mailer that keeps every report it is asked to send.
#[derive(Clone, Debug, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<RecordedMail>>>,
}

impl RecordingMailer {
    /// Creates an empty mailer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reports sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<RecordedMail> {
        lock(&self.sent).clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, report: &StatusReport) -> Result<(), NotifyError> {
        let captures = report.captures.as_ref();
        lock(&self.sent).push(RecordedMail {
            subject: report.subject.clone(),
            exec_log: report.exec_log.clone(),
            stdout: captures.and_then(|captured| decompress(&captured.stdout)),
            stderr: captures.and_then(|captured| decompress(&captured.stderr)),
        });
        Ok(())
    }
}

/// Mailer whose relay always refuses.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingMailer;

impl Mailer for FailingMailer {
    fn send(&self, _report: &StatusReport) -> Result<(), NotifyError> {
        Err(NotifyError::Transport(String::from(
            "connection refused by localhost:25",
        )))
    }
}

/// Fields of a certificate produced by [`encode_certificate`].
#[derive(Clone, Debug)]
pub struct TestCertificate<'a> {
    /// Audit identifier.
    pub key_id: &'a str,
    /// Valid principals.
    pub principals: &'a [&'a str],
    /// Critical options as name/value pairs; empty values encode flags.
    pub critical_options: &'a [(&'a str, &'a str)],
    /// Extensions as name/value pairs.
    pub extensions: &'a [(&'a str, &'a str)],
    /// Certified Ed25519 public key.
    pub public_key: [u8; 32],
}

fn encode_options(options: &[(&str, &str)]) -> Vec<u8> {
    let mut encoded = Vec::new();
    for (name, value) in options {
        put_string(&mut encoded, name.as_bytes());
        let mut data = Vec::new();
        if !value.is_empty() {
            put_string(&mut data, value.as_bytes());
        }
        put_string(&mut encoded, &data);
    }
    encoded
}

/// Encodes an unsigned Ed25519 user certificate in OpenSSH text form. The
/// signature fields hold placeholder bytes; decoding does not verify them.
#[must_use]
pub fn encode_certificate(certificate: &TestCertificate<'_>) -> String {
    let mut blob = Vec::new();
    put_string(&mut blob, ED25519_CERT_TYPE.as_bytes());
    put_string(&mut blob, &[0x5a; 32]);
    put_string(&mut blob, &certificate.public_key);
    put_u64(&mut blob, 1);
    put_u32(&mut blob, CertificateKind::User.wire_value());
    put_string(&mut blob, certificate.key_id.as_bytes());

    let mut principals = Vec::new();
    for principal in certificate.principals {
        put_string(&mut principals, principal.as_bytes());
    }
    put_string(&mut blob, &principals);

    put_u64(&mut blob, 1_700_000_000);
    put_u64(&mut blob, 1_700_086_400);
    put_string(&mut blob, &encode_options(certificate.critical_options));
    put_string(&mut blob, &encode_options(certificate.extensions));
    put_string(&mut blob, &[]);
    put_string(&mut blob, b"placeholder signature key");
    put_string(&mut blob, b"placeholder signature");

    format!("{ED25519_CERT_TYPE} {} test@keel", STANDARD.encode(blob))
}

/// Issuer that mints certificates locally from each request, or fails every
/// request when built with [`StaticIssuer::failing`].
#[derive(Clone, Debug, Default)]
pub struct StaticIssuer {
    failure: Option<CaError>,
    requests: Arc<Mutex<Vec<CertificateRequest>>>,
}

impl StaticIssuer {
    /// Creates an issuer that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an issuer that always fails with `error`.
    #[must_use]
    pub fn failing(error: CaError) -> Self {
        Self {
            failure: Some(error),
            requests: Arc::default(),
        }
    }

    /// Returns the requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CertificateRequest> {
        lock(&self.requests).clone()
    }

    fn mint(&self, request: &CertificateRequest) -> Result<IssuedCertificate, CaError> {
        lock(&self.requests).push(request.clone());
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let principals: Vec<&str> = request
            .valid_principals
            .iter()
            .map(String::as_str)
            .collect();
        let text = encode_certificate(&TestCertificate {
            key_id: &request.key_id,
            principals: &principals,
            critical_options: &[(FORCE_COMMAND, request.forced_command.as_str())],
            extensions: &[],
            public_key: [1; 32],
        });
        IssuedCertificate::from_signed_key(&text)
    }
}

impl CertificateIssuer for StaticIssuer {
    fn issue<'a>(&'a self, request: &'a CertificateRequest) -> IssueFuture<'a> {
        let outcome = self.mint(request);
        Box::pin(async move { outcome })
    }
}

/// Temporary tree holding every secret and key file a fully configured host
/// needs, plus builders for documents referencing them.
#[derive(Debug)]
pub struct HostFixture {
    _guard: TempDir,
    root: Utf8PathBuf,
    host: String,
}

impl HostFixture {
    /// Creates the tree for `host`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the tree cannot be created.
    pub fn new(host: impl Into<String>) -> io::Result<Self> {
        let guard = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(guard.path().to_path_buf()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not valid UTF-8", path.display()),
            )
        })?;
        for (name, contents) in [
            ("b2-key-id", "key-id\n"),
            ("b2-app-key", "app-key\n"),
            ("id_ed25519.pub", "ssh-ed25519 AAAA test\n"),
            ("id_ed25519", "private\n"),
            ("role-id", "role\n"),
            ("secret-id", "secret\n"),
            ("restic-password", "password\n"),
        ] {
            fs::write(root.join(name), contents)?;
        }
        fs::create_dir(root.join("cache"))?;
        Ok(Self {
            _guard: guard,
            root,
            host: host.into(),
        })
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of `name` inside the tree.
    #[must_use]
    pub fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    /// Host the jobs built here belong to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// A mirror job between `local_path` and `remote_host:remote_path`.
    #[must_use]
    pub fn mirror_job(
        &self,
        direction: &str,
        local_path: &str,
        remote_host: &str,
        remote_path: &str,
    ) -> Value {
        json!({
            "type": "rsync",
            "direction": direction,
            "localHost": self.host,
            "localPath": local_path,
            "remoteHost": remote_host,
            "remotePath": remote_path,
        })
    }

    /// A snapshot job backing up `local_path` with 30 days of retention.
    #[must_use]
    pub fn snapshot_job(&self, local_path: &str) -> Value {
        json!({
            "type": "restic-b2",
            "direction": "push",
            "localHost": self.host,
            "localPath": local_path,
            "passwordPath": self.path("restic-password"),
            "retention": "30d",
        })
    }

    /// A complete document with both shared sections and `jobs` as
    /// `jobsByName`.
    #[must_use]
    pub fn document(&self, jobs: Value) -> Value {
        json!({
            "jobsByName": jobs,
            "restic": {
                "cacheDir": self.path("cache"),
                "b2": {
                    "bucket": "fleet-backups",
                    "keyIdPath": self.path("b2-key-id"),
                    "applicationKeyPath": self.path("b2-app-key"),
                }
            },
            "ssh": {
                "publicKeyPath": self.path("id_ed25519.pub"),
                "privateKeyPath": self.path("id_ed25519"),
                "ca": {
                    "addr": "https://bao.example.net:8200",
                    "roleIdPath": self.path("role-id"),
                    "secretIdPath": self.path("secret-id"),
                    "enginePath": "ssh-backups-ca",
                    "signerRole": "backups-dump",
                }
            }
        })
    }

    /// Builds the validated configuration for [`HostFixture::document`].
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of [`Config::from_json`].
    pub fn config(&self, jobs: Value) -> Result<Config, ConfigError> {
        Config::from_json(&self.document(jobs).to_string(), &self.host)
    }
}
