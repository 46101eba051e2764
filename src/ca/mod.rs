//! Client for the SSH certificate authority.
//!
//! Every mirror job asks the signer for a fresh, day-long user certificate
//! whose `force-command` critical option pins it to the one `rsync --server`
//! invocation the job needs. The signer speaks the OpenBao/Vault HTTP API:
//! an approle login yields a token, which then authorizes `sign` calls.

mod error;
mod tls;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{CredentialAuthorityConfig, TransportIdentity};
use crate::files;
use crate::process::render_command;
use crate::rsync::DEFAULT_PRINCIPAL;

pub use error::CaError;

/// Header carrying the session token.
pub const TOKEN_HEADER: &str = "X-Vault-Token";
/// Lifetime requested for every certificate.
pub const CERTIFICATE_TTL: &str = "1d";

/// What to put in the next certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateRequest {
    /// Audit identifier.
    pub key_id: String,
    /// Command the certificate is bound to, already shell-quoted.
    pub forced_command: String,
    /// Principals the certificate is valid for.
    pub valid_principals: Vec<String>,
}

impl CertificateRequest {
    /// Binds `key_id` to the command line `argv`, quoting each argument.
    #[must_use]
    pub fn new<S: AsRef<str>>(key_id: impl Into<String>, argv: &[S]) -> Self {
        Self {
            key_id: key_id.into(),
            forced_command: render_command(argv),
            valid_principals: vec![String::from(DEFAULT_PRINCIPAL)],
        }
    }

    /// Replaces the default principals.
    #[must_use]
    pub fn with_principals(mut self, principals: Vec<String>) -> Self {
        self.valid_principals = principals;
        self
    }
}

/// An issued certificate held in a private temporary file. The file is
/// removed when the value is dropped.
#[derive(Debug)]
pub struct IssuedCertificate {
    file: NamedTempFile,
    path: Utf8PathBuf,
    contents: String,
}

impl IssuedCertificate {
    /// Stores `signed_key` in a new temporary file.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Store`] when the file cannot be created or written.
    pub fn from_signed_key(signed_key: &str) -> Result<Self, CaError> {
        let contents = format!("{}\n", signed_key.trim_end());
        let mut file = tempfile::Builder::new()
            .prefix("keel-cert-")
            .suffix(".pub")
            .tempfile()
            .map_err(|err| CaError::Store(err.to_string()))?;
        file.write_all(contents.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| CaError::Store(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf())
            .map_err(|path| CaError::Store(format!("{} is not valid UTF-8", path.display())))?;
        Ok(Self {
            file,
            path,
            contents,
        })
    }

    /// Location of the certificate while this value is alive.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Certificate in OpenSSH text form.
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Copies the certificate to `destination`, which outlives this value.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Store`] when the copy fails.
    pub fn persist_copy(&self, destination: &Utf8Path) -> Result<(), CaError> {
        fs::copy(self.file.path(), destination)
            .map(|_| ())
            .map_err(|err| CaError::Store(format!("{destination}: {err}")))
    }
}

/// Future returned by [`CertificateIssuer::issue`].
pub type IssueFuture<'a> =
    Pin<Box<dyn Future<Output = Result<IssuedCertificate, CaError>> + Send + 'a>>;

/// Source of scoped certificates.
pub trait CertificateIssuer: Sync {
    /// Issues a certificate for `request`.
    fn issue<'a>(&'a self, request: &'a CertificateRequest) -> IssueFuture<'a>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    public_key: &'a str,
    ttl: &'a str,
    valid_principals: String,
    cert_type: &'a str,
    key_id: &'a str,
    critical_options: BTreeMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Deserialize)]
struct SignData {
    signed_key: String,
}

/// HTTP client for an OpenBao/Vault SSH secrets engine. Logs in once, on
/// first use, and reuses the token for the life of the client.
pub struct CaClient {
    http: Client,
    base_url: Url,
    authority: CredentialAuthorityConfig,
    public_key_path: Utf8PathBuf,
    token: OnceCell<String>,
}

impl CaClient {
    /// Prepares a client for `authority` that certifies `identity`'s public
    /// key. No request is sent until the first issuance.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Address`] when the address cannot be resolved and
    /// [`CaError::Tls`] or [`CaError::Read`] when the trust anchor cannot be
    /// loaded.
    pub async fn new(
        authority: &CredentialAuthorityConfig,
        identity: &TransportIdentity,
    ) -> Result<Self, CaError> {
        let endpoint = tls::endpoint(authority).await?;
        let http = tls::build_client(authority, &endpoint)?;
        Ok(Self {
            http,
            base_url: endpoint.base_url,
            authority: authority.clone(),
            public_key_path: identity.public_key.clone(),
            token: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn token(&self) -> Result<&str, CaError> {
        self.token
            .get_or_try_init(|| self.login())
            .await
            .map(String::as_str)
    }

    async fn login(&self) -> Result<String, CaError> {
        let role_id = read_trimmed(&self.authority.role_id_path)?;
        let secret_id = read_trimmed(&self.authority.secret_id_path)?;
        let url = self.url(&format!("auth/{}/login", self.authority.auth_mount));
        debug!(url = %url, "logging in to certificate authority");

        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                role_id: &role_id,
                secret_id: &secret_id,
            })
            .send()
            .await
            .map_err(|err| transport_error(&url, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CaError::Login {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let login: LoginResponse = decode(&url, response).await?;
        Ok(login.auth.client_token)
    }

    async fn sign(&self, request: &CertificateRequest) -> Result<IssuedCertificate, CaError> {
        let token = self.token().await?;
        let public_key = read_trimmed(&self.public_key_path)?;
        let url = self.url(&format!(
            "{}/sign/{}",
            self.authority.engine_path, self.authority.signer_role
        ));
        info!(key_id = %request.key_id, "requesting SSH certificate");
        debug!(force_command = %request.forced_command, "certificate scope");

        let body = SignRequest {
            public_key: &public_key,
            ttl: CERTIFICATE_TTL,
            valid_principals: request.valid_principals.join(","),
            cert_type: "user",
            key_id: &request.key_id,
            critical_options: BTreeMap::from([(
                crate::certificate::FORCE_COMMAND,
                request.forced_command.as_str(),
            )]),
        };
        let response = self
            .http
            .post(&url)
            .header(TOKEN_HEADER, token)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(&url, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CaError::Signing {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let signed: SignResponse = decode(&url, response).await?;
        IssuedCertificate::from_signed_key(&signed.data.signed_key)
    }
}

impl fmt::Debug for CaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaClient")
            .field("base_url", &self.base_url.as_str())
            .field("authority", &self.authority)
            .field("logged_in", &self.token.initialized())
            .finish_non_exhaustive()
    }
}

impl CertificateIssuer for CaClient {
    fn issue<'a>(&'a self, request: &'a CertificateRequest) -> IssueFuture<'a> {
        Box::pin(self.sign(request))
    }
}

fn read_trimmed(path: &Utf8Path) -> Result<String, CaError> {
    files::read_to_string(path)
        .map(|text| text.trim().to_owned())
        .map_err(|err| CaError::Read {
            path: path.to_owned(),
            message: err.to_string(),
        })
}

fn transport_error(url: &str, err: &reqwest::Error) -> CaError {
    CaError::Transport {
        url: url.to_owned(),
        message: err.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, CaError> {
    response.json::<T>().await.map_err(|err| CaError::Response {
        url: url.to_owned(),
        message: err.to_string(),
    })
}
