//! Status notifications for finished jobs.
//!
//! Reports go out by email through a local relay. When the relay is
//! unavailable the report, including the decompressed captures, is written
//! to the diagnostic stream instead so the output is never lost.

use std::fs::File;
use std::io::{BufRead, BufReader};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::CapturedOutput;
use crate::files;

const EXEC_LOG_HEADER: &str = "=== exec log ===";
const STDOUT_HEADER: &str = "==== stdout ====";
const STDERR_HEADER: &str = "==== stderr ====";
const SEPARATOR: &str = "================";

/// Everything a notification says about one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusReport {
    /// Subject line.
    pub subject: String,
    /// Execution log lines.
    pub exec_log: Vec<String>,
    /// Compressed captures, absent when the job could not run.
    pub captures: Option<CapturedOutput>,
}

/// Errors raised while sending a report.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NotifyError {
    /// A sender or recipient address is malformed.
    #[error("invalid mail address {address}: {message}")]
    Address {
        /// Offending address.
        address: String,
        /// Parser message.
        message: String,
    },
    /// The message could not be assembled.
    #[error("failed to build message: {0}")]
    Message(String),
    /// A capture could not be attached.
    #[error("failed to read {path}: {message}")]
    Attachment {
        /// Capture path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The relay refused or could not be reached.
    #[error("failed to send mail: {0}")]
    Transport(String),
}

/// Delivers status reports.
pub trait Mailer {
    /// Sends `report`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] when the report was not delivered.
    fn send(&self, report: &StatusReport) -> Result<(), NotifyError>;
}

/// [`Mailer`] speaking plain SMTP to a local relay.
#[derive(Clone, Debug)]
pub struct SmtpMailer {
    host: String,
    port: u16,
    from: String,
    to: String,
}

impl SmtpMailer {
    /// Creates a mailer relaying through `host:port`.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            from: from.into(),
            to: to.into(),
        }
    }

    fn message(&self, report: &StatusReport) -> Result<Message, NotifyError> {
        let mut body = MultiPart::mixed().singlepart(SinglePart::plain(email_body(report)));
        if let Some(captures) = &report.captures {
            for path in [&captures.stdout, &captures.stderr] {
                if let Some(attachment) = attachment(path)? {
                    body = body.singlepart(attachment);
                }
            }
        }
        Message::builder()
            .from(mailbox(&self.from)?)
            .to(mailbox(&self.to)?)
            .subject(report.subject.as_str())
            .multipart(body)
            .map_err(|err| NotifyError::Message(err.to_string()))
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, report: &StatusReport) -> Result<(), NotifyError> {
        let message = self.message(report)?;
        let transport = SmtpTransport::builder_dangerous(self.host.as_str())
            .port(self.port)
            .build();
        transport
            .send(&message)
            .map(|response| debug!(code = %response.code(), "status email accepted"))
            .map_err(|err| NotifyError::Transport(err.to_string()))
    }
}

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|err: lettre::address::AddressError| NotifyError::Address {
        address: address.to_owned(),
        message: err.to_string(),
    })
}

fn attachment(path: &Utf8Path) -> Result<Option<SinglePart>, NotifyError> {
    let data = files::read(path).map_err(|err| NotifyError::Attachment {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    if data.is_empty() {
        return Ok(None);
    }
    let content_type = ContentType::parse("application/gzip")
        .map_err(|err| NotifyError::Message(err.to_string()))?;
    let name = path.file_name().unwrap_or("capture.gz").to_owned();
    Ok(Some(Attachment::new(name).body(data, content_type)))
}

/// Plain-text body of the status email.
#[must_use]
pub fn email_body(report: &StatusReport) -> String {
    let mut body = format!("Execution log:\n\n{}\n", report.exec_log.join("\n"));
    if report.captures.is_none() {
        body.push_str("\nThe backup job could not run.\n");
    }
    body.push_str(concat!(
        "\n-- \n",
        env!("CARGO_PKG_NAME"),
        " ",
        env!("CARGO_PKG_VERSION"),
        "\n"
    ));
    body
}

fn capture_lines(path: &Utf8Path) -> Vec<String> {
    let decoded = File::open(path).map(|file| BufReader::new(MultiGzDecoder::new(file)));
    let mut lines = Vec::new();
    match decoded {
        Ok(reader) => {
            for line in reader.lines() {
                match line {
                    Ok(text) => lines.push(text.trim_end().to_owned()),
                    Err(err) => {
                        lines.push(format!("(capture truncated: {err})"));
                        break;
                    }
                }
            }
        }
        Err(err) => lines.push(format!("(could not open {path}: {err})")),
    }
    lines
}

/// The report as diagnostic-stream lines, in the order the email presents
/// it.
#[must_use]
pub fn fallback_lines(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![report.subject.clone()];
    if !report.exec_log.is_empty() {
        lines.push(String::from(EXEC_LOG_HEADER));
        lines.extend(report.exec_log.iter().cloned());
        lines.push(String::from(SEPARATOR));
    }
    if let Some(captures) = &report.captures {
        for (header, path) in [
            (STDOUT_HEADER, &captures.stdout),
            (STDERR_HEADER, &captures.stderr),
        ] {
            lines.push(String::from(header));
            lines.extend(capture_lines(path));
            lines.push(String::from(SEPARATOR));
        }
    }
    lines
}

/// What happened to a report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotificationOutcome {
    /// The mailer accepted the report.
    Delivered,
    /// The mailer failed and the report went to the diagnostic stream.
    Degraded {
        /// Why delivery failed.
        reason: String,
    },
}

/// Sends reports and falls back to the diagnostic stream when sending
/// fails.
#[derive(Clone, Debug)]
pub struct Notifier<M> {
    mailer: M,
}

impl<M: Mailer> Notifier<M> {
    /// Wraps `mailer`.
    #[must_use]
    pub const fn new(mailer: M) -> Self {
        Self { mailer }
    }

    /// Sends `report`, never failing.
    #[must_use]
    pub fn notify(&self, report: &StatusReport) -> NotificationOutcome {
        match self.mailer.send(report) {
            Ok(()) => NotificationOutcome::Delivered,
            Err(err) => {
                warn!(error = %err, "could not send status email");
                for line in fallback_lines(report) {
                    warn!("{line}");
                }
                NotificationOutcome::Degraded {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::process::{Command, Stdio};

    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{FailingMailer, RecordingMailer};

    struct Captures {
        _guard: TempDir,
        output: CapturedOutput,
    }

    fn gzip_into(path: &Utf8Path, text: &str) {
        let file = File::create(path).expect("create capture");
        let mut child = Command::new("gzip")
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(file)
            .spawn()
            .expect("spawn gzip");
        child
            .stdin
            .take()
            .expect("gzip stdin")
            .write_all(text.as_bytes())
            .expect("write to gzip");
        assert!(child.wait().expect("wait for gzip").success());
    }

    #[fixture]
    fn captures() -> Captures {
        let guard = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(guard.path().to_path_buf()).expect("utf8 path");
        let output = CapturedOutput {
            stdout: root.join("stdout.gz"),
            stderr: root.join("stderr.gz"),
        };
        gzip_into(&output.stdout, "sent 12 bytes\ntotal size is 0\n");
        gzip_into(&output.stderr, "debug1: Authenticated\n");
        Captures {
            _guard: guard,
            output,
        }
    }

    fn report(captures: Option<CapturedOutput>) -> StatusReport {
        StatusReport {
            subject: String::from("rsync backup job #empty FAILED (push by db1)"),
            exec_log: vec![
                String::from("INFO: rsync command: rsync /var/empty host:/stash"),
                String::from("ERROR: rsync failed"),
            ],
            captures,
        }
    }

    #[rstest]
    fn fallback_follows_email_order(captures: Captures) {
        let lines = fallback_lines(&report(Some(captures.output.clone())));

        assert_eq!(
            lines,
            [
                "rsync backup job #empty FAILED (push by db1)",
                "=== exec log ===",
                "INFO: rsync command: rsync /var/empty host:/stash",
                "ERROR: rsync failed",
                "================",
                "==== stdout ====",
                "sent 12 bytes",
                "total size is 0",
                "================",
                "==== stderr ====",
                "debug1: Authenticated",
                "================",
            ]
        );
    }

    #[test]
    fn fallback_without_captures_stops_after_the_log() {
        let lines = fallback_lines(&report(None));
        assert_eq!(lines.last().map(String::as_str), Some(SEPARATOR));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn body_explains_jobs_that_could_not_run() {
        let body = email_body(&report(None));
        assert!(body.starts_with("Execution log:\n\nINFO: rsync command:"));
        assert!(body.contains("\nThe backup job could not run.\n"));
    }

    #[rstest]
    fn body_of_a_run_job_has_no_apology(captures: Captures) {
        let body = email_body(&report(Some(captures.output.clone())));
        assert!(!body.contains("could not run"));
    }

    #[rstest]
    fn refused_relay_degrades(captures: Captures) {
        let notifier = Notifier::new(FailingMailer);

        let outcome = notifier.notify(&report(Some(captures.output.clone())));

        assert_eq!(
            outcome,
            NotificationOutcome::Degraded {
                reason: String::from("failed to send mail: connection refused by localhost:25"),
            }
        );
    }

    #[rstest]
    fn accepted_report_is_delivered(captures: Captures) {
        let mailer = RecordingMailer::new();
        let notifier = Notifier::new(mailer.clone());

        let outcome = notifier.notify(&report(Some(captures.output.clone())));

        assert_eq!(outcome, NotificationOutcome::Delivered);
        let sent = mailer.sent();
        let mail = sent.first().expect("one mail");
        assert_eq!(mail.stderr.as_deref(), Some("debug1: Authenticated\n"));
    }

    #[rstest]
    fn message_attaches_both_captures(captures: Captures) {
        let mailer = SmtpMailer::new("localhost", 25, "root@localhost", "root@localhost");

        let message = mailer
            .message(&report(Some(captures.output.clone())))
            .expect("message builds");

        let text = String::from_utf8(message.formatted()).expect("ascii message");
        assert!(text.contains("Subject: rsync backup job #empty FAILED (push by db1)"));
        assert_eq!(text.matches("Content-Type: application/gzip").count(), 2);
        assert!(text.contains("filename=\"stdout.gz\""));
    }

    #[rstest]
    fn empty_captures_are_not_attached(captures: Captures) {
        File::create(&captures.output.stderr).expect("truncate capture");
        let mailer = SmtpMailer::new("localhost", 25, "root@localhost", "root@localhost");

        let message = mailer
            .message(&report(Some(captures.output.clone())))
            .expect("message builds");

        let text = String::from_utf8(message.formatted()).expect("ascii message");
        assert_eq!(text.matches("Content-Type: application/gzip").count(), 1);
    }

    #[test]
    fn malformed_sender_is_rejected() {
        let mailer = SmtpMailer::new("localhost", 25, "not an address", "root@localhost");
        let err = mailer.message(&report(None)).expect_err("bad sender");
        assert!(matches!(err, NotifyError::Address { .. }), "{err:?}");
    }
}
