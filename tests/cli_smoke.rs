//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use keel::CertificateInfo;
use keel::test_support::{HostFixture, TestCertificate, encode_certificate};
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

const HOST: &str = "keel.example.net";

struct Workspace {
    files: HostFixture,
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            files: HostFixture::new(HOST).expect("host fixture"),
            dir: TempDir::new().expect("workspace"),
        }
    }

    fn write_document(&self, jobs: Value) -> String {
        let path = self.dir.path().join("backups.json");
        std::fs::write(&path, self.files.document(jobs).to_string()).expect("write document");
        path.to_str().expect("utf8 path").to_owned()
    }

    fn keel(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("keel");
        cmd.current_dir(self.dir.path())
            .env("KEEL_HOST_ID", HOST)
            .env_remove("RUST_LOG");
        cmd
    }
}

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("keel");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage: keel"));
}

#[test]
fn valid_document_passes_validation() {
    let workspace = Workspace::new();
    let document = workspace.write_document(json!({
        "data": workspace.files.snapshot_job("/srv/data"),
    }));

    workspace
        .keel()
        .args(["validate-config", "-c", document.as_str()])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn violations_are_printed_grouped_by_location() {
    let workspace = Workspace::new();
    let mut mirror = workspace
        .files
        .mirror_job("push", "/var/empty", "user@host", "/stash");
    mirror
        .as_object_mut()
        .expect("job object")
        .remove("remotePath");
    let document = workspace.write_document(json!({ "mirror": mirror }));

    workspace
        .keel()
        .args(["validate-config", "-c", document.as_str(), "--fqdn", HOST])
        .assert()
        .code(1)
        .stdout(predicate::str::starts_with(format!(
            "1 validation errors in config for {HOST}:\n- jobsByName.mirror.remotePath:"
        )));
}

#[test]
fn missing_paths_can_be_ignored() {
    let workspace = Workspace::new();
    let mut snapshot = workspace.files.snapshot_job("/srv/data");
    snapshot["passwordPath"] = json!("/nonexistent/restic-password");
    let document = workspace.write_document(json!({ "data": snapshot }));

    workspace
        .keel()
        .args(["validate-config", "-c", document.as_str()])
        .assert()
        .code(1);
    workspace
        .keel()
        .args(["validate-config", "-c", document.as_str(), "--ignore-missing-paths"])
        .assert()
        .success();
}

#[test]
fn restoring_an_unknown_job_fails_with_its_name() {
    let workspace = Workspace::new();
    let document = workspace.write_document(json!({
        "data": workspace.files.snapshot_job("/srv/data"),
    }));

    workspace
        .keel()
        .args(["restore", "-c", document.as_str(), "photos"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "Could not find any backups named photos",
        ));
}

#[test]
fn authorized_keys_cover_jobs_pulling_from_this_host() {
    let workspace = Workspace::new();
    let document = workspace.write_document(json!({
        "db": workspace
            .files
            .mirror_job("pull", "/srv/mirror", "backup@db.example.net", "/srv/db"),
        "www": workspace
            .files
            .mirror_job("push", "/srv/www", "www.example.net", "/stash/www"),
    }));
    let ca_key = workspace.dir.path().join("ca.pub");
    std::fs::write(&ca_key, "ssh-ed25519 AAAACA ca@example\n").expect("write ca key");

    workspace
        .keel()
        .env("KEEL_HOST_ID", "db.example.net")
        .args([
            "authorized-keys",
            "-c",
            document.as_str(),
            "--ca-public-key",
            ca_key.to_str().expect("utf8 path"),
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff(format!(
            "cert-authority,principals=\"root\",restrict,command=\"{}\" ssh-ed25519 AAAACA ca@example\n",
            "rsync --server --sender -lHogDtpAXrzze.iLsfxC --numeric-ids . /srv/db"
        )));
}

#[test]
fn sshd_agent_reports_the_client_key() {
    let workspace = Workspace::new();
    let auth_info = workspace.dir.path().join("auth-info");
    let certificate = encode_certificate(&TestCertificate {
        key_id: "db.example.net-dump-home",
        principals: &["root"],
        critical_options: &[("force-command", "rsync --server --sender /home")],
        extensions: &[],
        public_key: [3; 32],
    });
    std::fs::write(&auth_info, format!("publickey {certificate}\n")).expect("write auth");
    let client_key = CertificateInfo::parse(&certificate)
        .expect("decode certificate")
        .public_key_line();

    workspace
        .keel()
        .args(["sshd-agent"])
        .env("SSH_USER_AUTH", &auth_info)
        .env("SSH_CLIENT", "192.0.2.1 40000 22")
        .env_remove("SSH_CONNECTION")
        .assert()
        .success()
        .stdout(
            predicate::str::starts_with("SSH_CLIENT=192.0.2.1 40000 22\nSSH_CONNECTION=\n")
                .and(predicate::str::ends_with(format!(
                    "Client public key = {client_key}\n"
                ))),
        );
}
