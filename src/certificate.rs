//! Decoding of OpenSSH Ed25519 user certificates.
//!
//! Used to inspect what the signer actually issued and, on the server side,
//! to recover the client's public key from the authentication info sshd
//! exposes to forced commands.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Key type of Ed25519 certificates.
pub const ED25519_CERT_TYPE: &str = "ssh-ed25519-cert-v01@openssh.com";
/// Key type of plain Ed25519 public keys.
pub const ED25519_KEY_TYPE: &str = "ssh-ed25519";
/// Critical option carrying the forced command.
pub const FORCE_COMMAND: &str = "force-command";
/// Length in bytes of an Ed25519 public key.
pub const ED25519_KEY_LEN: usize = 32;

/// Errors raised while decoding certificates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CertificateError {
    /// The text form is not `<type> <base64> [comment]`.
    #[error("malformed certificate line: {0}")]
    Malformed(String),
    /// The key type is not an Ed25519 certificate.
    #[error("unsupported certificate type {0}")]
    UnsupportedType(String),
    /// The base64 payload could not be decoded.
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    /// The payload ended before `field` could be read.
    #[error("certificate truncated while reading {field}")]
    Truncated {
        /// Field being read.
        field: &'static str,
    },
    /// A string field is not valid UTF-8.
    #[error("certificate field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field being read.
        field: &'static str,
    },
    /// The certificate type field holds an unknown value.
    #[error("unknown certificate kind {0}")]
    UnknownKind(u32),
    /// The certified key is not a 32-byte Ed25519 key.
    #[error("ssh-ed25519 public key must be {ED25519_KEY_LEN} bytes, got {length}")]
    KeyLength {
        /// Length found in the certificate.
        length: usize,
    },
}

/// Whether a certificate authenticates a user or a host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertificateKind {
    /// `SSH_CERT_TYPE_USER`.
    User,
    /// `SSH_CERT_TYPE_HOST`.
    Host,
}

impl CertificateKind {
    /// Wire value of the kind.
    #[must_use]
    pub const fn wire_value(self) -> u32 {
        match self {
            Self::User => 1,
            Self::Host => 2,
        }
    }
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Host => "host",
        })
    }
}

/// Decoded fields of an Ed25519 certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateInfo {
    /// Key type string embedded in the certificate.
    pub key_type: String,
    /// Random nonce chosen by the signer.
    pub nonce: Vec<u8>,
    /// Certified Ed25519 public key.
    pub public_key: Vec<u8>,
    /// Serial number.
    pub serial: u64,
    /// User or host certificate.
    pub kind: CertificateKind,
    /// Audit identifier.
    pub key_id: String,
    /// Principals the certificate is valid for.
    pub valid_principals: Vec<String>,
    /// Start of the validity window, in seconds since the epoch.
    pub valid_after: u64,
    /// End of the validity window, in seconds since the epoch.
    pub valid_before: u64,
    /// Critical options by name.
    pub critical_options: BTreeMap<String, String>,
    /// Extensions by name.
    pub extensions: BTreeMap<String, String>,
}

impl CertificateInfo {
    /// Parses the text form `<type> <base64> [comment]`.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError`] when the line is malformed or the
    /// certificate cannot be decoded.
    pub fn parse(text: &str) -> Result<Self, CertificateError> {
        let mut fields = text.split_whitespace();
        let (Some(key_type), Some(payload)) = (fields.next(), fields.next()) else {
            return Err(CertificateError::Malformed(text.trim().to_owned()));
        };
        if key_type != ED25519_CERT_TYPE {
            return Err(CertificateError::UnsupportedType(key_type.to_owned()));
        }
        let bytes = STANDARD
            .decode(payload)
            .map_err(|err| CertificateError::Base64(err.to_string()))?;
        Self::from_wire(&bytes)
    }

    /// Decodes the binary certificate blob.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError`] when the blob is truncated or holds
    /// unexpected values.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CertificateError> {
        let mut reader = WireReader::new(bytes);
        let key_type = reader.utf8("key type")?;
        if key_type != ED25519_CERT_TYPE {
            return Err(CertificateError::UnsupportedType(key_type));
        }
        let nonce = reader.string("nonce")?.to_vec();
        let public_key = reader.string("public key")?.to_vec();
        if public_key.len() != ED25519_KEY_LEN {
            return Err(CertificateError::KeyLength {
                length: public_key.len(),
            });
        }
        let serial = reader.u64("serial")?;
        let kind = match reader.u32("type")? {
            1 => CertificateKind::User,
            2 => CertificateKind::Host,
            other => return Err(CertificateError::UnknownKind(other)),
        };
        let key_id = reader.utf8("key id")?;

        let mut principals = WireReader::new(reader.string("valid principals")?);
        let mut valid_principals = Vec::new();
        while !principals.is_empty() {
            valid_principals.push(principals.utf8("valid principals")?);
        }

        let valid_after = reader.u64("valid after")?;
        let valid_before = reader.u64("valid before")?;
        let critical_options = read_options(reader.string("critical options")?, "critical options")?;
        let extensions = read_options(reader.string("extensions")?, "extensions")?;

        Ok(Self {
            key_type,
            nonce,
            public_key,
            serial,
            kind,
            key_id,
            valid_principals,
            valid_after,
            valid_before,
            critical_options,
            extensions,
        })
    }

    /// Forced command bound to the certificate, if any.
    #[must_use]
    pub fn force_command(&self) -> Option<&str> {
        self.critical_options.get(FORCE_COMMAND).map(String::as_str)
    }

    /// Certified key in `authorized_keys`/`.pub` form.
    #[must_use]
    pub fn public_key_line(&self) -> String {
        let mut blob = Vec::with_capacity(ED25519_KEY_TYPE.len() + self.public_key.len() + 8);
        put_string(&mut blob, ED25519_KEY_TYPE.as_bytes());
        put_string(&mut blob, &self.public_key);
        format!("{ED25519_KEY_TYPE} {}", STANDARD.encode(blob))
    }
}

/// Extracts the certificate from sshd's exposed authentication info (one
/// `publickey <type> <base64>` line per method) and returns the client's
/// public key in `.pub` form.
///
/// # Errors
///
/// Returns [`CertificateError::Malformed`] when no certificate line exists,
/// otherwise the errors of [`CertificateInfo::parse`].
pub fn client_key_from_auth_info(text: &str) -> Result<String, CertificateError> {
    let certificate = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("publickey "))
        .find(|rest| rest.starts_with(ED25519_CERT_TYPE))
        .ok_or_else(|| {
            CertificateError::Malformed(String::from(
                "no ssh-ed25519 certificate in the authentication info",
            ))
        })?;
    Ok(CertificateInfo::parse(certificate)?.public_key_line())
}

/// Appends an SSH wire-format string (length prefix plus bytes).
pub(crate) fn put_string(buffer: &mut Vec<u8>, bytes: &[u8]) {
    let length = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    put_u32(buffer, length);
    buffer.extend_from_slice(bytes);
}

#[expect(
    clippy::big_endian_bytes,
    reason = "the SSH wire format is defined as big-endian"
)]
pub(crate) fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

#[expect(
    clippy::big_endian_bytes,
    reason = "the SSH wire format is defined as big-endian"
)]
pub(crate) fn put_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

fn read_options(
    bytes: &[u8],
    field: &'static str,
) -> Result<BTreeMap<String, String>, CertificateError> {
    let mut reader = WireReader::new(bytes);
    let mut options = BTreeMap::new();
    while !reader.is_empty() {
        let name = reader.utf8(field)?;
        let data = reader.string(field)?;
        // Option data is itself a string when present; flags carry nothing.
        let value = if data.is_empty() {
            String::new()
        } else {
            WireReader::new(data).utf8(field)?
        };
        options.insert(name, value);
    }
    Ok(options)
}

struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, count: usize, field: &'static str) -> Result<&'a [u8], CertificateError> {
        if count > self.data.len() {
            return Err(CertificateError::Truncated { field });
        }
        let (head, tail) = self.data.split_at(count);
        self.data = tail;
        Ok(head)
    }

    #[expect(
        clippy::big_endian_bytes,
        reason = "the SSH wire format is defined as big-endian"
    )]
    fn u32(&mut self, field: &'static str) -> Result<u32, CertificateError> {
        let bytes: [u8; 4] = self
            .take(4, field)?
            .try_into()
            .map_err(|_| CertificateError::Truncated { field })?;
        Ok(u32::from_be_bytes(bytes))
    }

    #[expect(
        clippy::big_endian_bytes,
        reason = "the SSH wire format is defined as big-endian"
    )]
    fn u64(&mut self, field: &'static str) -> Result<u64, CertificateError> {
        let bytes: [u8; 8] = self
            .take(8, field)?
            .try_into()
            .map_err(|_| CertificateError::Truncated { field })?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn string(&mut self, field: &'static str) -> Result<&'a [u8], CertificateError> {
        let length = usize::try_from(self.u32(field)?)
            .map_err(|_| CertificateError::Truncated { field })?;
        self.take(length, field)
    }

    fn utf8(&mut self, field: &'static str) -> Result<String, CertificateError> {
        let bytes = self.string(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CertificateError::InvalidUtf8 { field })
    }
}
