//! Client and server `rsync` command lines for mirror jobs.
//!
//! The client command runs locally. The server command is what the remote
//! sshd will execute on our behalf; it is bound into the certificate as the
//! forced command, so the credential can do nothing else.

use std::ffi::OsString;

use camino::Utf8Path;

use crate::config::{BackupType, Config, Direction};
use crate::process::{CommandSpec, render_command};

/// Program name of the remote end.
pub const REMOTE_RSYNC: &str = "rsync";

/// Flags the client passes to a remote `rsync --server` for the options in
/// [`MirrorCommands::client`].
const SERVER_FLAGS: &str = "-lHogDtpAXrzze.iLsfxC";

/// Principal every forced-command certificate is issued for.
pub const DEFAULT_PRINCIPAL: &str = "root";

/// Strips an optional `user@` prefix from a remote host.
#[must_use]
pub fn host_of(remote_host: &str) -> &str {
    remote_host
        .rsplit_once('@')
        .map_or(remote_host, |(_, host)| host)
}

/// Endpoints and binaries of one mirror job.
#[derive(Clone, Copy, Debug)]
pub struct MirrorCommands<'a> {
    /// Local `rsync` executable.
    pub rsync_bin: &'a str,
    /// Local `ssh` executable.
    pub ssh_bin: &'a str,
    /// Local side of the transfer.
    pub local_path: &'a Utf8Path,
    /// Remote host, optionally prefixed with `user@`.
    pub remote_host: &'a str,
    /// Remote side of the transfer.
    pub remote_path: &'a Utf8Path,
}

impl MirrorCommands<'_> {
    /// Command run by the remote sshd: the receiver with deletion authority
    /// for pushes, the sender for pulls.
    #[must_use]
    pub fn server(&self, direction: Direction) -> Vec<String> {
        let role = match direction {
            Direction::Push => "--delete",
            Direction::Pull => "--sender",
        };
        vec![
            String::from(REMOTE_RSYNC),
            String::from("--server"),
            String::from(role),
            String::from(SERVER_FLAGS),
            String::from("--numeric-ids"),
            String::from("."),
            self.remote_path.as_str().to_owned(),
        ]
    }

    /// Local command mirroring in `direction`, authenticating with
    /// `private_key` and `certificate`.
    #[must_use]
    pub fn client(
        &self,
        direction: Direction,
        private_key: &Utf8Path,
        certificate: &Utf8Path,
    ) -> CommandSpec {
        let remote = format!("{}:{}", self.remote_host, self.remote_path);
        let local = self.local_path.as_str().to_owned();
        let (source, destination) = match direction {
            Direction::Push => (local, remote),
            Direction::Pull => (remote, local),
        };

        CommandSpec::new(self.rsync_bin).args([
            OsString::from("--archive"),
            OsString::from("--human-readable"),
            OsString::from("--numeric-ids"),
            OsString::from(format!(
                "--rsh={}",
                self.remote_shell(private_key, certificate)
            )),
            OsString::from("--stats"),
            OsString::from("--new-compress"),
            OsString::from("--hard-links"),
            OsString::from("--acls"),
            OsString::from("--xattrs"),
            OsString::from("--delete"),
            OsString::from(source),
            OsString::from(destination),
        ])
    }

    fn remote_shell(&self, private_key: &Utf8Path, certificate: &Utf8Path) -> String {
        render_command([
            self.ssh_bin,
            "-v",
            "-o",
            "BatchMode=yes",
            "-o",
            "Compression=no",
            "-o",
            "ControlMaster=no",
            "-o",
            "VisualHostKey=no",
            "-i",
            private_key.as_str(),
            "-i",
            certificate.as_str(),
        ])
    }
}

/// `authorized_keys` line trusting certificates from `ca_public_key` for
/// exactly `server_command`.
#[must_use]
pub fn authorized_keys_line(server_command: &[String], ca_public_key: &str) -> String {
    let command = render_command(server_command)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!(
        "cert-authority,principals=\"{DEFAULT_PRINCIPAL}\",restrict,command=\"{command}\" {}",
        ca_public_key.trim()
    )
}

/// `authorized_keys` lines for every mirror job whose remote host, without
/// its `user@` prefix, is `host`.
#[must_use]
pub fn authorized_keys(config: &Config, host: &str, ca_public_key: &str) -> Vec<String> {
    config
        .jobs()
        .values()
        .filter(|spec| spec.kind == BackupType::MirrorSync)
        .filter_map(|spec| {
            let remote_host = spec.remote_host.as_deref()?;
            let remote_path = spec.remote_path.as_deref()?;
            (host_of(remote_host) == host).then(|| {
                let commands = MirrorCommands {
                    rsync_bin: REMOTE_RSYNC,
                    ssh_bin: "ssh",
                    local_path: &spec.local_path,
                    remote_host,
                    remote_path,
                };
                authorized_keys_line(&commands.server(spec.direction), ca_public_key)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HostFixture;
    use rstest::{fixture, rstest};
    use serde_json::json;

    #[fixture]
    fn commands() -> MirrorCommands<'static> {
        MirrorCommands {
            rsync_bin: "rsync",
            ssh_bin: "ssh",
            local_path: Utf8Path::new("/var/empty"),
            remote_host: "user@host",
            remote_path: Utf8Path::new("/stash/empty"),
        }
    }

    #[rstest]
    fn push_server_receives_with_delete(commands: MirrorCommands<'static>) {
        let server = commands.server(Direction::Push);
        assert_eq!(
            render_command(&server),
            "rsync --server --delete -lHogDtpAXrzze.iLsfxC --numeric-ids . /stash/empty"
        );
        assert!(!server.iter().any(|arg| arg == "--sender"));
    }

    #[rstest]
    fn pull_server_sends_without_delete(commands: MirrorCommands<'static>) {
        let server = commands.server(Direction::Pull);
        assert!(server.iter().any(|arg| arg == "--sender"));
        assert!(!server.iter().any(|arg| arg == "--delete"));
    }

    #[rstest]
    fn push_client_sends_local_tree(commands: MirrorCommands<'static>) {
        let client = commands.client(
            Direction::Push,
            Utf8Path::new("/etc/keel/id_ed25519"),
            Utf8Path::new("/tmp/cert.pub"),
        );
        assert_eq!(
            client.command_line(),
            concat!(
                "rsync --archive --human-readable --numeric-ids ",
                "'--rsh=ssh -v -o BatchMode=yes -o Compression=no -o ControlMaster=no ",
                "-o VisualHostKey=no -i /etc/keel/id_ed25519 -i /tmp/cert.pub' ",
                "--stats --new-compress --hard-links --acls --xattrs --delete ",
                "/var/empty 'user@host:/stash/empty'"
            )
        );
    }

    #[rstest]
    fn pull_client_swaps_endpoints(commands: MirrorCommands<'static>) {
        let argv = commands
            .client(
                Direction::Pull,
                Utf8Path::new("/k"),
                Utf8Path::new("/c"),
            )
            .argv();
        let tail: Vec<&str> = argv.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, ["/var/empty", "user@host:/stash/empty"]);
    }

    #[rstest]
    #[case("user@host.example", "host.example")]
    #[case("host.example", "host.example")]
    fn host_of_strips_user(#[case] remote_host: &str, #[case] expected: &str) {
        assert_eq!(host_of(remote_host), expected);
    }

    #[test]
    fn authorized_keys_cover_jobs_targeting_the_host() {
        let files = HostFixture::new("db1.example.net").expect("host fixture");
        let config = files
            .config(json!({
                "home": files.mirror_job("push", "/home", "root@nas.example.net", "/stash/home"),
                "media": files.mirror_job("pull", "/media", "nas.example.net", "/media"),
                "other": files.mirror_job("push", "/srv", "other.example.net", "/srv"),
                "data": files.snapshot_job("/srv/data"),
            }))
            .expect("valid config");

        let lines = authorized_keys(&config, "nas.example.net", "ssh-ed25519 AAAACA ca");

        assert_eq!(lines.len(), 2);
        assert!(lines.first().is_some_and(|line| line.contains("--delete")));
        assert!(lines.last().is_some_and(|line| line.contains("--sender")));
    }

    #[rstest]
    fn authorized_keys_line_binds_the_command(commands: MirrorCommands<'static>) {
        let line = authorized_keys_line(
            &commands.server(Direction::Pull),
            "ssh-ed25519 AAAACA ca@bao\n",
        );
        assert_eq!(
            line,
            concat!(
                "cert-authority,principals=\"root\",restrict,",
                "command=\"rsync --server --sender -lHogDtpAXrzze.iLsfxC --numeric-ids . /stash/empty\" ",
                "ssh-ed25519 AAAACA ca@bao"
            )
        );
    }
}
