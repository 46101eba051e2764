//! Integration tests for the certificate authority client against a local
//! signer speaking the approle and SSH secrets engine endpoints.

use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use keel::ca::TOKEN_HEADER;
use keel::config::{CredentialAuthorityConfig, TransportIdentity};
use keel::test_support::{HostFixture, TestCertificate, encode_certificate};
use keel::{CaClient, CaError, CertificateInfo, CertificateIssuer, CertificateRequest};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const LOGIN_PATH: &str = "/v1/auth/approle/login";
const SIGN_PATH: &str = "/v1/ssh-backups-ca/sign/backups-dump";

#[derive(Clone, Debug)]
struct SeenRequest {
    path: String,
    token: Option<String>,
    body: Value,
}

/// How the signer answers the requests it receives.
#[derive(Clone, Copy, Debug)]
enum Behaviour {
    Issue,
    RefuseSigning,
    RefuseLogin,
}

#[derive(Clone)]
struct SignerState {
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    behaviour: Behaviour,
}

impl SignerState {
    fn record(&self, uri: &Uri, headers: &HeaderMap, body: Value) -> SeenRequest {
        let request = SeenRequest {
            path: uri.path().to_owned(),
            token: headers
                .get(TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            body,
        };
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        request
    }
}

struct FakeSigner {
    addr: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl FakeSigner {
    async fn start(behaviour: Behaviour) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/v1/auth/{mount}/login", post(login))
            .route("/v1/{engine}/sign/{role}", post(sign))
            .with_state(SignerState {
                seen: Arc::clone(&seen),
                behaviour,
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind signer");
        let addr = format!("http://{}", listener.local_addr().expect("local addr"));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, seen }
    }

    fn seen(&self) -> Vec<SeenRequest> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn paths(&self) -> Vec<String> {
        self.seen().into_iter().map(|request| request.path).collect()
    }
}

async fn login(
    State(state): State<SignerState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record(&uri, &headers, body);
    match state.behaviour {
        Behaviour::RefuseLogin => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": ["invalid role or secret ID"] })),
        ),
        Behaviour::Issue | Behaviour::RefuseSigning => (
            StatusCode::OK,
            Json(json!({ "auth": { "client_token": "s.fake-token" } })),
        ),
    }
}

async fn sign(
    State(state): State<SignerState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let request = state.record(&uri, &headers, body);
    match state.behaviour {
        Behaviour::Issue => (StatusCode::OK, Json(sign_from_request(&request))),
        Behaviour::RefuseSigning | Behaviour::RefuseLogin => (
            StatusCode::FORBIDDEN,
            Json(json!({ "errors": ["permission denied"] })),
        ),
    }
}

fn sign_from_request(request: &SeenRequest) -> Value {
    let key_id = request.body["key_id"].as_str().unwrap_or_default();
    let principals_field = request.body["valid_principals"].as_str().unwrap_or_default();
    let principals: Vec<&str> = principals_field.split(',').collect();
    let force_command = request.body["critical_options"]["force-command"]
        .as_str()
        .unwrap_or_default();
    let signed_key = encode_certificate(&TestCertificate {
        key_id,
        principals: &principals,
        critical_options: &[("force-command", force_command)],
        extensions: &[("permit-pty", "")],
        public_key: [9; 32],
    });
    json!({ "data": { "signed_key": signed_key } })
}

fn authority(files: &HostFixture, addr: &str) -> (CredentialAuthorityConfig, TransportIdentity) {
    (
        CredentialAuthorityConfig {
            addr: addr.to_owned(),
            role_id_path: files.path("role-id"),
            secret_id_path: files.path("secret-id"),
            auth_mount: String::from("approle"),
            tls_server_name: String::from("127.0.0.1"),
            tls_ca_cert: None,
            engine_path: String::from("ssh-backups-ca"),
            signer_role: String::from("backups-dump"),
        },
        TransportIdentity {
            public_key: files.path("id_ed25519.pub"),
            private_key: files.path("id_ed25519"),
        },
    )
}

async fn client_for(signer: &FakeSigner, files: &HostFixture) -> CaClient {
    let (authority, identity) = authority(files, &signer.addr);
    CaClient::new(&authority, &identity)
        .await
        .expect("client for local signer")
}

fn rsync_sender_request() -> CertificateRequest {
    CertificateRequest::new(
        "test-certificate-id",
        &["rsync", "--server", "--sender", "/data"],
    )
}

#[tokio::test]
async fn issued_certificate_carries_the_requested_scope() {
    let signer = FakeSigner::start(Behaviour::Issue).await;
    let files = HostFixture::new("keel.example.net").expect("host fixture");
    let client = client_for(&signer, &files).await;

    let certificate = client
        .issue(&rsync_sender_request())
        .await
        .expect("certificate issued");

    let info = CertificateInfo::parse(certificate.contents()).expect("decode certificate");
    assert_eq!(info.key_id, "test-certificate-id");
    assert_eq!(info.valid_principals, ["root"]);
    assert_eq!(info.force_command(), Some("rsync --server --sender /data"));
    assert!(certificate.path().is_file());
}

#[tokio::test]
async fn sign_request_is_authenticated_with_the_login_token() {
    let signer = FakeSigner::start(Behaviour::Issue).await;
    let files = HostFixture::new("keel.example.net").expect("host fixture");
    let client = client_for(&signer, &files).await;

    client
        .issue(&rsync_sender_request())
        .await
        .expect("certificate issued");

    let seen = signer.seen();
    let [login, sign] = seen.as_slice() else {
        panic!("expected a login and a sign request, got {seen:?}");
    };
    assert_eq!(login.path, LOGIN_PATH);
    assert_eq!(
        login.body,
        json!({ "role_id": "role", "secret_id": "secret" })
    );
    assert_eq!(sign.path, SIGN_PATH);
    assert_eq!(sign.token.as_deref(), Some("s.fake-token"));
    assert_eq!(sign.body["public_key"], "ssh-ed25519 AAAA test");
    assert_eq!(sign.body["ttl"], "1d");
    assert_eq!(sign.body["cert_type"], "user");
}

#[tokio::test]
async fn token_is_reused_across_issuances() {
    let signer = FakeSigner::start(Behaviour::Issue).await;
    let files = HostFixture::new("keel.example.net").expect("host fixture");
    let client = client_for(&signer, &files).await;

    for _ in 0..2 {
        client
            .issue(&rsync_sender_request())
            .await
            .expect("certificate issued");
    }

    assert_eq!(signer.paths(), [LOGIN_PATH, SIGN_PATH, SIGN_PATH]);
}

#[tokio::test]
async fn refused_signing_reports_the_status() {
    let signer = FakeSigner::start(Behaviour::RefuseSigning).await;
    let files = HostFixture::new("keel.example.net").expect("host fixture");
    let client = client_for(&signer, &files).await;

    let err = client
        .issue(&rsync_sender_request())
        .await
        .expect_err("signing refused");

    assert!(
        matches!(err, CaError::Signing { status: 403, ref body } if body.contains("permission denied")),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn refused_login_stops_before_signing() {
    let signer = FakeSigner::start(Behaviour::RefuseLogin).await;
    let files = HostFixture::new("keel.example.net").expect("host fixture");
    let client = client_for(&signer, &files).await;

    let err = client
        .issue(&rsync_sender_request())
        .await
        .expect_err("login refused");

    assert!(matches!(err, CaError::Login { status: 400, .. }), "{err:?}");
    assert_eq!(signer.paths(), [LOGIN_PATH]);
}
