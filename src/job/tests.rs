//! Tests for job dispatch and both transports.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use serde_json::{Value, json};
use tempfile::TempDir;

use super::mirror::CERTIFICATE_COPY;
use super::snapshot::{CREDENTIALS_FILE, SNAPSHOT_TAG};
use super::*;
use crate::capture::STDOUT_CAPTURE;
use crate::config::{B2_ACCOUNT_ID_ENV, B2_ACCOUNT_KEY_ENV};
use crate::test_support::{HostFixture, ScriptedRunner, StaticIssuer};

const HOST: &str = "keel.example.net";

struct Harness {
    files: HostFixture,
    _work: TempDir,
    work_dir: Utf8PathBuf,
    runner: ScriptedRunner,
    issuer: StaticIssuer,
    tools: ToolPaths,
}

impl Harness {
    fn new() -> Self {
        Self::with_issuer(StaticIssuer::new())
    }

    fn with_issuer(issuer: StaticIssuer) -> Self {
        let work = TempDir::new().expect("work dir");
        let work_dir = Utf8PathBuf::from_path_buf(work.path().to_path_buf()).expect("utf8 path");
        Self {
            files: HostFixture::new(HOST).expect("host fixture"),
            _work: work,
            work_dir,
            runner: ScriptedRunner::new(),
            issuer,
            tools: ToolPaths::default(),
        }
    }

    fn config(&self, jobs: Value) -> Config {
        self.files.config(jobs).expect("valid config")
    }

    fn env<'a>(&'a self, config: &'a Config) -> JobEnvironment<'a, ScriptedRunner, StaticIssuer> {
        JobEnvironment {
            config,
            runner: &self.runner,
            issuer: Some(&self.issuer),
            tools: &self.tools,
            hostname: HOST,
        }
    }

    fn push_mirror(&self) -> Config {
        self.config(json!({
            "empty": self
                .files
                .mirror_job("push", "/var/empty", "user@host", "/stash/empty"),
        }))
    }

    fn snapshot(&self) -> Config {
        self.config(json!({ "data": self.files.snapshot_job("/srv/data") }))
    }
}

fn mode_of(path: &Utf8Path) -> u32 {
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

#[tokio::test]
async fn push_mirror_runs_rsync_with_a_scoped_certificate() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    harness.runner.push_success();
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    assert!(result.succeeded(), "{:?}", result.log);
    assert_eq!(result.exit_code, Some(0));
    let requests = harness.issuer.requests();
    let request = requests.first().expect("one certificate request");
    assert_eq!(request.key_id, "keel.example.net-dump-empty");
    assert_eq!(
        request.forced_command,
        "rsync --server --delete -lHogDtpAXrzze.iLsfxC --numeric-ids . /stash/empty"
    );

    let invocations = harness.runner.invocations();
    let invocation = invocations.first().expect("rsync invoked");
    assert_eq!(invocation.program, "rsync");
    let logged = result.log.lines().first().expect("command logged");
    assert!(logged.starts_with("INFO: rsync command: rsync --archive "));
    assert!(logged.ends_with(" /var/empty 'user@host:/stash/empty'"));

    let captures = result.captures.expect("captures recorded");
    assert_eq!(captures.stdout, harness.work_dir.join(STDOUT_CAPTURE));
    assert!(captures.stdout.is_file());
}

#[tokio::test]
async fn certificate_is_removed_after_the_run() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    harness.runner.push_success();
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    job.run().await;

    let invocations = harness.runner.invocations();
    let rsh = invocations
        .first()
        .and_then(|invocation| {
            invocation
                .args
                .iter()
                .find_map(|arg| arg.to_str()?.strip_prefix("--rsh=").map(str::to_owned))
        })
        .expect("remote shell argument");
    let certificate = rsh.rsplit(' ').next().expect("certificate path");
    assert!(certificate.contains("keel-cert-"), "{rsh}");
    assert!(!Utf8Path::new(certificate).exists());
}

#[tokio::test]
async fn rsync_failure_is_recorded_with_its_status() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    harness.runner.push_exit_code(23);
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    assert_eq!(result.phase, JobPhase::Failed);
    assert_eq!(result.exit_code, Some(23));
    let last = result.log.lines().last().expect("error logged");
    assert!(last.starts_with("ERROR: rsync failed: rsync --archive "), "{last}");
    assert!(last.ends_with(" exited with status 23"), "{last}");
}

#[tokio::test]
async fn refused_certificate_fails_without_running_rsync() {
    let harness = Harness::with_issuer(StaticIssuer::failing(CaError::Signing {
        status: 403,
        body: String::from("permission denied"),
    }));
    let config = harness.push_mirror();
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    assert_eq!(result.phase, JobPhase::Failed);
    assert!(result.captures.is_none());
    assert!(harness.runner.invocations().is_empty());
    assert_eq!(
        result.log.lines(),
        [String::from(
            "ERROR: could not issue certificate, signing failed with status 403: permission denied"
        )]
    );
}

#[tokio::test]
async fn missing_issuer_fails_the_mirror_job() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    let env = JobEnvironment {
        issuer: None,
        ..harness.env(&config)
    };
    let job = build_job("empty", &env, &harness.work_dir).expect("job");

    let result = job.run().await;

    assert_eq!(result.phase, JobPhase::Failed);
    assert!(harness.runner.invocations().is_empty());
}

#[tokio::test]
async fn pull_creates_the_local_destination() {
    let harness = Harness::new();
    let destination = harness.files.path("mirror/incoming");
    let config = harness.config(json!({
        "incoming": harness
            .files
            .mirror_job("pull", destination.as_str(), "host", "/data"),
    }));
    harness.runner.push_success();
    let job = build_job("incoming", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    assert!(result.succeeded());
    assert!(destination.is_dir());
    let requests = harness.issuer.requests();
    assert_eq!(
        requests.first().map(|request| request.forced_command.as_str()),
        Some("rsync --server --sender -lHogDtpAXrzze.iLsfxC --numeric-ids . /data")
    );
}

#[tokio::test]
async fn mirror_debug_script_references_a_persistent_certificate() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    let script = job.write_debug_script().await.expect("debug script");

    let certificate = harness.work_dir.join(CERTIFICATE_COPY);
    assert!(certificate.is_file());
    assert_eq!(mode_of(&script), 0o750);
    let text = fs::read_to_string(&script).expect("read script");
    assert!(text.starts_with("#!/bin/sh\nrsync --archive "));
    assert!(text.contains(&format!("-i {certificate}'")), "{text}");
    assert_eq!(
        harness
            .issuer
            .requests()
            .first()
            .map(|request| request.key_id.as_str()),
        Some("keel.example.net-debug-dump-empty")
    );
    assert!(harness.runner.invocations().is_empty());
}

#[test]
fn snapshot_script_quotes_every_value() {
    let harness = Harness::new();
    let config = harness.snapshot();
    let env = harness.env(&config);
    let Ok(BackupJob::Snapshot(job)) = build_job("data", &env, &harness.work_dir) else {
        panic!("expected a snapshot job");
    };

    let expected = format!(
        concat!(
            "#!/bin/sh\n",
            "set -eux\n",
            "restic() {{\n",
            "    command restic \\\n",
            "        --repo 'b2:fleet-backups:data' \\\n",
            "        --password-file {password} \\\n",
            "        --cache-dir {cache} \\\n",
            "        \"$@\"\n",
            "}}\n",
            "restic snapshots >/dev/null 2>&1 || restic --quiet init\n",
            "restic --quiet backup --tag {tag} --one-file-system /srv/data\n",
            "restic --quiet forget --tag {tag} --prune --keep-within 30d\n",
            "restic --quiet check\n",
        ),
        password = harness.files.path("restic-password"),
        cache = harness.files.path("cache"),
        tag = SNAPSHOT_TAG,
    );
    assert_eq!(job.script(), expected);
}

#[test]
fn snapshot_script_honours_one_file_system_flag() {
    let harness = Harness::new();
    let mut spec = harness.files.snapshot_job("/srv/data");
    spec["oneFileSystem"] = json!(false);
    let config = harness.config(json!({ "data": spec }));
    let env = harness.env(&config);
    let Ok(BackupJob::Snapshot(job)) = build_job("data", &env, &harness.work_dir) else {
        panic!("expected a snapshot job");
    };

    assert!(!job.script().contains("--one-file-system"));
}

#[tokio::test]
async fn snapshot_credentials_only_travel_in_the_environment() {
    let harness = Harness::new();
    let config = harness.snapshot();
    harness.runner.push_success();
    let job = build_job("data", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    assert!(result.succeeded(), "{:?}", result.log);
    let script = harness.work_dir.join(SCRIPT_NAME);
    assert_eq!(mode_of(&script), 0o750);
    let text = fs::read_to_string(&script).expect("read script");
    assert!(!text.contains("key-id") && !text.contains("app-key"));

    let invocations = harness.runner.invocations();
    let invocation = invocations.first().expect("script invoked");
    assert_eq!(invocation.program, script.as_str());
    assert!(invocation.args.is_empty());
    assert_eq!(
        invocation.envs,
        [
            (String::from(B2_ACCOUNT_ID_ENV), String::from("key-id")),
            (String::from(B2_ACCOUNT_KEY_ENV), String::from("app-key")),
        ]
    );
    assert_eq!(
        result.log.lines(),
        [format!(
            "INFO: Executing {script}, see details in attached files."
        )]
    );
}

#[tokio::test]
async fn snapshot_failure_keeps_the_script_for_postmortem() {
    let harness = Harness::new();
    let config = harness.snapshot();
    harness.runner.push_exit_code(1);
    let job = build_job("data", &harness.env(&config), &harness.work_dir).expect("job");

    let result = job.run().await;

    let script = harness.work_dir.join(SCRIPT_NAME);
    assert_eq!(result.phase, JobPhase::Failed);
    assert!(script.is_file());
    assert_eq!(
        result.log.lines().last(),
        Some(&format!("ERROR: \"{script}\" failed with exit status 1"))
    );
}

#[tokio::test]
async fn snapshot_debug_script_writes_private_credentials() {
    let harness = Harness::new();
    let config = harness.snapshot();
    let job = build_job("data", &harness.env(&config), &harness.work_dir).expect("job");

    let script = job.write_debug_script().await.expect("debug script");

    assert_eq!(script, harness.work_dir.join(SCRIPT_NAME));
    let credentials = harness.work_dir.join(CREDENTIALS_FILE);
    assert_eq!(mode_of(&credentials), 0o600);
    assert_eq!(
        fs::read_to_string(&credentials).expect("read credentials"),
        "B2_ACCOUNT_ID=key-id\nB2_ACCOUNT_KEY=app-key\n"
    );
    assert!(harness.runner.invocations().is_empty());
}

#[test]
fn unknown_job_is_reported() {
    let harness = Harness::new();
    let config = harness.snapshot();

    let err = build_job("nope", &harness.env(&config), &harness.work_dir).expect_err("unknown");

    assert_eq!(err, DispatchError::UnknownJob(String::from("nope")));
}

#[test]
fn job_of_another_host_lacks_its_section() {
    let harness = Harness::new();
    let mut spec = harness
        .files
        .mirror_job("push", "/var/empty", "host", "/stash");
    spec["localHost"] = json!("elsewhere.example.net");
    let config = harness.config(json!({ "remote": spec }));

    let err = build_job("remote", &harness.env(&config), &harness.work_dir).expect_err("section");

    assert_eq!(
        err,
        DispatchError::MissingSection {
            job: String::from("remote"),
            section: "ssh",
        }
    );
}

#[test]
fn description_renders_notification_subjects() {
    let harness = Harness::new();
    let config = harness.push_mirror();
    let job = build_job("empty", &harness.env(&config), &harness.work_dir).expect("job");

    let description = job.describe();

    assert_eq!(
        description.subject(JobStatus::Succeeded),
        "rsync backup job #empty succeeded (push by keel.example.net)"
    );
    assert_eq!(
        description.subject(JobStatus::Failed),
        "rsync backup job #empty FAILED (push by keel.example.net)"
    );
    assert_eq!(
        description.unrunnable_subject(),
        "rsync backup job #empty FAILED on keel.example.net"
    );
}
