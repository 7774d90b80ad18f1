//! Typed failures raised by each onboarding stage, and their classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Certificate-authority registration or enrollment failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The enrollment id is already registered with the CA.
    #[error("enrollment id {enrollment_id} is already registered")]
    Duplicate {
        /// Rejected enrollment id.
        enrollment_id: String,
    },
    /// The CA refused the request (wrong secret, bad attributes, ...).
    #[error("CA rejected {enrollment_id}: {reason}")]
    Rejected {
        /// Enrollment id concerned.
        enrollment_id: String,
        /// CA-supplied reason.
        reason: String,
    },
    /// The CA could not be reached or timed out.
    #[error("CA unavailable while handling {enrollment_id}: {reason}")]
    Transient {
        /// Enrollment id concerned.
        enrollment_id: String,
        /// Transport failure.
        reason: String,
    },
    /// No CA is configured for the organization.
    #[error("no certificate authority configured for organization {0}")]
    UnknownAuthority(String),
    /// The issued identity could not be stored in the wallet.
    #[error("storing {label} in the wallet failed: {reason}")]
    Wallet {
        /// Wallet label.
        label: String,
        /// Wallet failure.
        reason: String,
    },
}

/// Trust-store write failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustMaterialError {
    /// Filesystem failure; the staged bundle was discarded.
    #[error("trust store I/O error at {path}: {reason}")]
    Io {
        /// Path being written.
        path: String,
        /// Underlying error.
        reason: String,
    },
    /// A different bundle already exists for the participant.
    #[error("trust bundle for {participant} already exists with different material")]
    Conflict {
        /// Storage key of the participant.
        participant: String,
    },
    /// The participant key cannot be used as a directory name.
    #[error("invalid trust store key: {0}")]
    InvalidKey(String),
    /// The identities do not form a complete bundle for the participant.
    #[error("incomplete trust material: {0}")]
    Incomplete(String),
    /// A descriptor could not be serialized.
    #[error("trust descriptor encoding failed: {0}")]
    Encode(String),
}

/// The target organization or endpoint is already part of the config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{participant} already present in channel {channel}")]
pub struct DuplicateParticipantError {
    /// Offending organization or endpoint.
    pub participant: String,
    /// Channel inspected.
    pub channel: String,
}

/// Configuration codec failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Bytes could not be decoded.
    #[error("config decode failed: {0}")]
    Decode(String),
    /// Structure could not be encoded.
    #[error("config encode failed: {0}")]
    Encode(String),
    /// Delta computation failed.
    #[error("config diff failed: {0}")]
    Diff(String),
    /// External codec process exited unsuccessfully.
    #[error("codec process {program} exited with {status:?}: {stderr}")]
    Process {
        /// Program invoked.
        program: String,
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// External codec process could not be started.
    #[error("codec process could not start: {0}")]
    Spawn(String),
}

/// Failure while computing an unsigned update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// Target already exists in the snapshot.
    #[error(transparent)]
    Duplicate(#[from] DuplicateParticipantError),
    /// A policy rule of the change is malformed.
    #[error("policy {policy} is malformed: {reason}")]
    InvalidPolicy {
        /// Policy name.
        policy: String,
        /// Validation failure.
        reason: String,
    },
    /// The change refers to an organization missing from the config.
    #[error("organization {0} is not a channel member")]
    UnknownOrganization(String),
    /// The change is structurally invalid (missing certs, bad names).
    #[error("invalid change: {0}")]
    InvalidChange(String),
    /// Applying the change produced no delta.
    #[error("change produced an empty update")]
    EmptyUpdate,
    /// Codec collaborator failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Ordering collaborator unreachable.
    #[error("ordering service unavailable: {0}")]
    Unavailable(String),
}

/// Required signers that did not contribute a valid signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quorum not met; missing signers: {}", .missing.join(", "))]
pub struct QuorumNotMetError {
    /// Every missing signer, sorted.
    pub missing: Vec<String>,
    /// Per-signer failure reason.
    pub reasons: BTreeMap<String, String>,
}

/// The config advanced past the snapshot the update was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("config advanced from version {base} to {current}; recompute the delta")]
pub struct StaleBaseError {
    /// Version the update was computed against.
    pub base: u64,
    /// Version currently committed.
    pub current: u64,
}

/// Rejection or failure while submitting a signed update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// The update was computed against a superseded config.
    #[error(transparent)]
    StaleBase(#[from] StaleBaseError),
    /// The ordering service rejected one or more signatures.
    #[error("signature rejected: {0}")]
    SignatureInvalid(String),
    /// The update does not satisfy the channel's modification policy.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    /// The envelope was malformed or named an unknown channel.
    #[error("update rejected: {0}")]
    Rejected(String),
    /// Ordering collaborator unreachable or timed out.
    #[error("ordering service unavailable: {0}")]
    Unavailable(String),
}

/// Node launch, health or channel-join failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The runtime refused to start the node.
    #[error("launching {node} failed: {reason}")]
    Launch {
        /// Node host name.
        node: String,
        /// Runtime error.
        reason: String,
    },
    /// The node did not report healthy in time.
    #[error("{node} not healthy after {waited_ms} ms")]
    StartupTimeout {
        /// Node host name.
        node: String,
        /// Time spent polling.
        waited_ms: u64,
    },
    /// The channel join request failed.
    #[error("{node} could not join the channel: {reason}")]
    Join {
        /// Node host name.
        node: String,
        /// Collaborator error.
        reason: String,
    },
}

/// Classification recorded on a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// CA rejected or was unreachable.
    Credential {
        /// Duplicate enrollment id.
        duplicate: bool,
    },
    /// Trust store write failed.
    TrustMaterial,
    /// Target already present in the config.
    DuplicateParticipant,
    /// Change failed local validation.
    InvalidChange,
    /// Signatures missing.
    QuorumNotMet {
        /// Missing signer ids.
        missing: Vec<String>,
    },
    /// Config advanced since the snapshot.
    StaleBase,
    /// Ordering service rejected signatures or policy.
    SubmissionRejected,
    /// Node never became healthy.
    NodeStartupTimeout,
    /// Node launch or join failed.
    NodeRuntime,
    /// A collaborator was unreachable.
    Unavailable,
}

/// Any stage failure, as caught by the coordinator at a step boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Credential provisioning.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Trust material.
    #[error(transparent)]
    TrustMaterial(#[from] TrustMaterialError),
    /// Delta computation.
    #[error(transparent)]
    Delta(#[from] DeltaError),
    /// Quorum collection.
    #[error(transparent)]
    Quorum(#[from] QuorumNotMetError),
    /// Submission.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    /// Node lifecycle.
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl StepError {
    /// Failure classification for the request record.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Credential(err) => FailureKind::Credential {
                duplicate: matches!(err, CredentialError::Duplicate { .. }),
            },
            Self::TrustMaterial(_) => FailureKind::TrustMaterial,
            Self::Delta(DeltaError::Duplicate(_)) => FailureKind::DuplicateParticipant,
            Self::Delta(DeltaError::Codec(_) | DeltaError::Unavailable(_)) => {
                FailureKind::Unavailable
            }
            Self::Delta(_) => FailureKind::InvalidChange,
            Self::Quorum(err) => FailureKind::QuorumNotMet {
                missing: err.missing.clone(),
            },
            Self::Submission(SubmissionError::StaleBase(_)) => FailureKind::StaleBase,
            Self::Submission(SubmissionError::Unavailable(_)) => FailureKind::Unavailable,
            Self::Submission(_) => FailureKind::SubmissionRejected,
            Self::Node(NodeError::StartupTimeout { .. }) => FailureKind::NodeStartupTimeout,
            Self::Node(_) => FailureKind::NodeRuntime,
        }
    }

    /// Whether re-running the request can succeed without a new change.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Credential(err) => matches!(
                err,
                CredentialError::Transient { .. } | CredentialError::Wallet { .. }
            ),
            Self::TrustMaterial(err) => matches!(err, TrustMaterialError::Io { .. }),
            Self::Delta(err) => matches!(err, DeltaError::Codec(_) | DeltaError::Unavailable(_)),
            Self::Quorum(_) => true,
            Self::Submission(err) => {
                matches!(err, SubmissionError::StaleBase(_) | SubmissionError::Unavailable(_))
            }
            Self::Node(_) => true,
        }
    }
}
