#![cfg(feature = "net")]

//! HTTP clients for CA and ordering gateways.
//!
//! The CA gateway follows the certificate-authority REST layout
//! (`/api/v1/register`, `/api/v1/enroll`, `/api/v1/cainfo`) with the
//! `{success, result, errors}` response envelope and generates key pairs
//! server-side. The ordering gateway exposes
//! `GET /channels/{channel}/config`, `POST /channels/{channel}/updates` and
//! `POST /channels/{channel}/join` with JSON bodies.

use crate::channel::ConfigBlock;
use crate::collab::{
    CaFailure, CaRoots, CertificateAuthority, Enrollment, EnrollmentProfile, EnrollmentRequest,
    OrdererFailure, OrderingService, Registration,
};
use crate::config::CaEndpoint;
use crate::node::NodeHandle;
use crate::submit::{CommitEnvelope, CommitResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Error code the CA uses for an already registered identity.
const CA_ALREADY_REGISTERED: i64 = 74;

#[derive(Debug, Deserialize)]
struct CaMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CaEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    errors: Vec<CaMessage>,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    id: &'a str,
    secret: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    affiliation: &'a str,
    max_enrollments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    caname: Option<&'a str>,
}

#[derive(Serialize)]
struct EnrollBody<'a> {
    profile: &'a str,
    hosts: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    caname: Option<&'a str>,
}

/// Certificate authority reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCaClient {
    client: Client,
    endpoint: CaEndpoint,
}

impl HttpCaClient {
    /// Client for `endpoint`; `timeout` bounds each request.
    pub fn new(endpoint: CaEndpoint, timeout: Duration) -> Result<Self, CaFailure> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CaFailure::Unavailable(format!("ca client error: {err}")))?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.endpoint.url.trim_end_matches('/'))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, CaFailure> {
        let resp = request
            .send()
            .await
            .map_err(|err| CaFailure::Unavailable(format!("ca request failed: {err}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| CaFailure::Unavailable(format!("ca read failed: {err}")))?;
        ca_outcome(status, &text)
    }
}

fn ca_outcome(status: StatusCode, text: &str) -> Result<Value, CaFailure> {
    let envelope: Option<CaEnvelope> = serde_json::from_str(text).ok();
    match envelope {
        Some(envelope) if envelope.success && status.is_success() => Ok(envelope.result),
        Some(envelope) => {
            if envelope
                .errors
                .iter()
                .any(|err| err.code == CA_ALREADY_REGISTERED)
            {
                return Err(CaFailure::Duplicate);
            }
            let reason = envelope
                .errors
                .iter()
                .map(|err| format!("{} {}", err.code, err.message))
                .collect::<Vec<_>>()
                .join("; ");
            if status.is_server_error() {
                Err(CaFailure::Unavailable(format!("status {status}: {reason}")))
            } else {
                Err(CaFailure::Rejected(format!("status {status}: {reason}")))
            }
        }
        None if status.is_server_error() || status.is_success() => Err(CaFailure::Unavailable(
            format!("status {status}: unreadable body"),
        )),
        None => Err(CaFailure::Rejected(format!("status {status}: {text}"))),
    }
}

fn pem_field(result: &Value, names: &[&str]) -> Result<String, CaFailure> {
    let encoded = names
        .iter()
        .find_map(|name| result.get(*name).and_then(Value::as_str))
        .ok_or_else(|| CaFailure::Rejected(format!("ca response lacks {}", names[0])))?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| CaFailure::Rejected(format!("{}: {err}", names[0])))?;
    String::from_utf8(bytes).map_err(|err| CaFailure::Rejected(format!("{}: {err}", names[0])))
}

#[async_trait]
impl CertificateAuthority for HttpCaClient {
    async fn register(&self, registration: &Registration) -> Result<(), CaFailure> {
        let body = RegisterBody {
            id: &registration.enrollment_id,
            secret: &registration.secret,
            kind: registration.role.ca_type(),
            affiliation: &registration.affiliation,
            max_enrollments: registration.max_enrollments,
            caname: self.endpoint.ca_name.as_deref(),
        };
        let request = self
            .client
            .post(self.url("register"))
            .basic_auth(&self.endpoint.registrar, Some(&self.endpoint.registrar_secret))
            .json(&body);
        self.call(request).await?;
        debug!(evt = "ca_registered", url = %self.endpoint.url, id = %registration.enrollment_id);
        Ok(())
    }

    async fn enroll(&self, request: &EnrollmentRequest) -> Result<Enrollment, CaFailure> {
        let profile = match request.profile {
            EnrollmentProfile::Signing => "",
            EnrollmentProfile::Tls => "tls",
        };
        let body = EnrollBody {
            profile,
            hosts: &request.hosts,
            caname: self.endpoint.ca_name.as_deref(),
        };
        let call = self
            .client
            .post(self.url("enroll"))
            .basic_auth(&request.enrollment_id, Some(&request.secret))
            .json(&body);
        let result = self.call(call).await?;
        Ok(Enrollment {
            certificate: pem_field(&result, &["Cert"])?,
            private_key: pem_field(&result, &["Key", "PrivateKey"])?,
        })
    }

    async fn roots(&self) -> Result<CaRoots, CaFailure> {
        let mut request = self.client.get(self.url("cainfo"));
        if let Some(name) = &self.endpoint.ca_name {
            request = request.query(&[("ca", name)]);
        }
        let result = self.call(request).await?;
        let root_cert = pem_field(&result, &["CAChain"])?;
        let tls_root_cert = pem_field(&result, &["TLSCAChain"]).unwrap_or_else(|_| root_cert.clone());
        Ok(CaRoots {
            root_cert,
            tls_root_cert,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    base: u64,
    #[serde(default)]
    current: u64,
}

#[derive(Serialize)]
struct JoinBody<'a> {
    node: &'a NodeHandle,
    block: &'a ConfigBlock,
}

fn orderer_failure(status: StatusCode, text: &str) -> OrdererFailure {
    let body: GatewayError = serde_json::from_str(text).unwrap_or_default();
    let reason = if body.reason.is_empty() {
        format!("status {status}: {text}")
    } else {
        body.reason.clone()
    };
    match body.error.as_str() {
        "stale_base" => OrdererFailure::StaleBase {
            base: body.base,
            current: body.current,
        },
        "signature_invalid" => OrdererFailure::SignatureInvalid(reason),
        "policy_violation" => OrdererFailure::PolicyViolation(reason),
        "already_joined" => OrdererFailure::AlreadyJoined,
        _ if status.is_server_error() => OrdererFailure::Unavailable(reason),
        _ => OrdererFailure::Rejected(reason),
    }
}

/// Ordering service reached through its HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpOrdererClient {
    client: Client,
    base_url: String,
}

impl HttpOrdererClient {
    /// Client for `base_url`; `timeout` bounds each request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OrdererFailure> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OrdererFailure::Unavailable(format!("orderer client error: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, channel: &str, leaf: &str) -> String {
        format!("{}/channels/{channel}/{leaf}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, OrdererFailure> {
        let resp = request
            .send()
            .await
            .map_err(|err| OrdererFailure::Unavailable(format!("orderer request failed: {err}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| OrdererFailure::Unavailable(format!("orderer read failed: {err}")))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(orderer_failure(status, &text))
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, OrdererFailure> {
    serde_json::from_str(text)
        .map_err(|err| OrdererFailure::Unavailable(format!("orderer decode failed: {err}")))
}

#[async_trait]
impl OrderingService for HttpOrdererClient {
    async fn fetch_config(&self, channel: &str) -> Result<ConfigBlock, OrdererFailure> {
        let text = self.send(self.client.get(self.url(channel, "config"))).await?;
        decode(&text)
    }

    async fn submit_update(&self, envelope: &CommitEnvelope) -> Result<CommitResult, OrdererFailure> {
        let request = self
            .client
            .post(self.url(&envelope.channel, "updates"))
            .json(envelope);
        let text = self.send(request).await?;
        decode(&text)
    }

    async fn join_channel(
        &self,
        node: &NodeHandle,
        channel: &str,
        block: &ConfigBlock,
    ) -> Result<(), OrdererFailure> {
        let request = self
            .client
            .post(self.url(channel, "join"))
            .json(&JoinBody { node, block });
        self.send(request).await.map(|_| ())
    }
}
