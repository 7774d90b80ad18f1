//! Interfaces of the external collaborators the orchestrator drives.
//!
//! None of these are implemented here in full: the certificate authority, the
//! ordering service, the configuration codec and the container runtime are
//! external systems. [`crate::sim`] provides in-process stand-ins, the `remote`
//! module (feature `net`) speaks to gateways over HTTP, [`crate::codec`] and
//! [`crate::node::DockerRuntime`] cover the local codec and runtime cases.

use crate::channel::{ChannelConfig, ConfigBlock};
use crate::error::CodecError;
use crate::model::NetworkRole;
use crate::node::{DeploymentDescriptor, NodeHandle};
use crate::submit::{CommitEnvelope, CommitResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registration submitted to a CA by its registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Enrollment id to create.
    pub enrollment_id: String,
    /// Enrollment secret.
    pub secret: String,
    /// Identity type.
    pub role: NetworkRole,
    /// Affiliation (empty for root).
    #[serde(default)]
    pub affiliation: String,
    /// How many times the secret may be used to enroll.
    pub max_enrollments: u32,
}

/// Certificate profile requested at enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentProfile {
    /// Signing (MSP) certificate.
    Signing,
    /// Transport-security certificate.
    Tls,
}

/// Enrollment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    /// Registered enrollment id.
    pub enrollment_id: String,
    /// Its secret.
    pub secret: String,
    /// Requested profile.
    pub profile: EnrollmentProfile,
    /// Subject alternative names (TLS only).
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Certificate and key returned by an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// PEM certificate.
    pub certificate: String,
    /// PEM private key.
    pub private_key: String,
}

/// Root-of-trust certificates published by a CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaRoots {
    /// Signing root certificate (PEM).
    pub root_cert: String,
    /// TLS root certificate (PEM).
    pub tls_root_cert: String,
}

/// Failure reported by a CA.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaFailure {
    /// Enrollment id already registered.
    #[error("identity already registered")]
    Duplicate,
    /// Request refused.
    #[error("rejected: {0}")]
    Rejected(String),
    /// CA unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Certificate-issuing authority of one organization.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Registers a new identity.
    async fn register(&self, registration: &Registration) -> Result<(), CaFailure>;

    /// Enrolls a registered identity, returning its certificate and key.
    async fn enroll(&self, request: &EnrollmentRequest) -> Result<Enrollment, CaFailure>;

    /// Root certificates identities of this CA chain to.
    async fn roots(&self) -> Result<CaRoots, CaFailure>;
}

/// Failure reported by the ordering service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrdererFailure {
    /// The update's base version is not the current one.
    #[error("stale base: update on {base}, channel at {current}")]
    StaleBase {
        /// Version the update targeted.
        base: u64,
        /// Current channel version.
        current: u64,
    },
    /// A signature did not verify.
    #[error("bad signature: {0}")]
    SignatureInvalid(String),
    /// Signatures do not satisfy the modification policy.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    /// The node already joined the channel.
    #[error("already joined")]
    AlreadyJoined,
    /// Unknown channel or malformed request.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Service unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Ordering/consensus service that commits configuration updates.
#[async_trait]
pub trait OrderingService: Send + Sync {
    /// Latest configuration block of `channel`.
    async fn fetch_config(&self, channel: &str) -> Result<ConfigBlock, OrdererFailure>;

    /// Submits a signed update and waits for commit or rejection.
    async fn submit_update(&self, envelope: &CommitEnvelope)
        -> Result<CommitResult, OrdererFailure>;

    /// Asks `node` to join `channel` from the given configuration block.
    async fn join_channel(
        &self,
        node: &NodeHandle,
        channel: &str,
        block: &ConfigBlock,
    ) -> Result<(), OrdererFailure>;
}

/// Converts configuration documents between bytes and structure.
#[async_trait]
pub trait ConfigCodec: Send + Sync {
    /// Decodes a configuration block payload.
    async fn decode(&self, bytes: &[u8]) -> Result<ChannelConfig, CodecError>;

    /// Encodes a configuration.
    async fn encode(&self, config: &ChannelConfig) -> Result<Vec<u8>, CodecError>;

    /// Computes the update bytes turning `original` into `proposed`.
    async fn diff(&self, original: &[u8], proposed: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Health reported by the runtime for a launched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Ready to serve.
    Healthy,
    /// Not ready yet, or failing.
    Unhealthy(String),
}

/// Runtime failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RuntimeFailure(pub String);

/// Container/process runtime that hosts node executables.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts the node described by `descriptor`; returns the existing handle when
    /// a node with the same name is already running.
    async fn launch(&self, descriptor: &DeploymentDescriptor) -> Result<NodeHandle, RuntimeFailure>;

    /// Probes node health.
    async fn ping(&self, handle: &NodeHandle) -> Health;

    /// Stops the node.
    async fn stop(&self, handle: &NodeHandle) -> Result<(), RuntimeFailure>;
}
