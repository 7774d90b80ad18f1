//! Update Submission Manager: commit envelopes and idempotent submission.

use crate::collab::{OrdererFailure, OrderingService};
use crate::delta::{signing_payload, update_digest};
use crate::error::{StaleBaseError, SubmissionError};
use crate::quorum::{SignedUpdate, UpdateSignature};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

/// Schema identifier embedded in every commit envelope.
pub const SCHEMA_COMMIT_ENVELOPE: &str = "onboard.config-envelope.v1";

/// Signed update in the form submitted to the ordering service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEnvelope {
    /// Schema identifier (`onboard.config-envelope.v1`).
    pub schema: String,
    /// Target channel.
    pub channel: String,
    /// Version the update was computed against.
    pub base_version: u64,
    /// Version reached on commit.
    pub target_version: u64,
    /// Base64 update bytes.
    pub update: String,
    /// Hex digest over channel, base version and update bytes.
    pub digest: String,
    /// Signatures in signer-id order.
    pub signatures: Vec<UpdateSignature>,
}

/// Envelope validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Unexpected schema tag.
    #[error("invalid schema: expected {SCHEMA_COMMIT_ENVELOPE}, found {0}")]
    InvalidSchema(String),
    /// Update field is not base64.
    #[error("update payload is not base64: {0}")]
    InvalidPayload(String),
    /// Digest does not match the payload.
    #[error("digest mismatch")]
    DigestMismatch,
    /// Target is not base + 1.
    #[error("target version {target} does not follow base {base}")]
    VersionGap {
        /// Base version.
        base: u64,
        /// Target version.
        target: u64,
    },
}

impl CommitEnvelope {
    /// Wraps a signed update.
    pub fn from_signed(signed: &SignedUpdate) -> Self {
        let unsigned = &signed.unsigned;
        Self {
            schema: SCHEMA_COMMIT_ENVELOPE.to_string(),
            channel: unsigned.channel.clone(),
            base_version: unsigned.base_version,
            target_version: unsigned.target_version,
            update: BASE64.encode(&unsigned.update_bytes),
            digest: unsigned.digest.clone(),
            signatures: signed.signatures.values().cloned().collect(),
        }
    }

    /// Checks the schema, version step and digest; returns the update bytes.
    pub fn validate(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.schema != SCHEMA_COMMIT_ENVELOPE {
            return Err(EnvelopeError::InvalidSchema(self.schema.clone()));
        }
        if self.target_version != self.base_version + 1 {
            return Err(EnvelopeError::VersionGap {
                base: self.base_version,
                target: self.target_version,
            });
        }
        let bytes = BASE64
            .decode(&self.update)
            .map_err(|err| EnvelopeError::InvalidPayload(err.to_string()))?;
        if update_digest(&self.channel, self.base_version, &bytes) != self.digest {
            return Err(EnvelopeError::DigestMismatch);
        }
        Ok(bytes)
    }

    /// Bytes each signature in the envelope must cover.
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(
            &self.channel,
            self.base_version,
            self.target_version,
            &self.digest,
        )
    }
}

/// Outcome of a committed update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Channel updated.
    pub channel: String,
    /// Configuration version after commit.
    pub version: u64,
    /// Digest of the committed update.
    pub update_digest: String,
    /// Commit time (ms).
    pub committed_ms: u64,
}

/// Submits signed updates and remembers what it committed.
pub struct SubmissionManager {
    orderer: Arc<dyn OrderingService>,
    timeout: Duration,
    committed: Mutex<HashMap<String, CommitResult>>,
}

impl SubmissionManager {
    /// Manager over `orderer`; `timeout` bounds each collaborator call.
    pub fn new(orderer: Arc<dyn OrderingService>, timeout: Duration) -> Self {
        Self {
            orderer,
            timeout,
            committed: Mutex::new(HashMap::new()),
        }
    }

    /// Submits `signed` and waits for commit.
    ///
    /// A resubmission of an update that already committed returns the prior
    /// result. An update whose base version is behind the channel fails with
    /// [`StaleBaseError`].
    pub async fn submit(&self, signed: &SignedUpdate) -> Result<CommitResult, SubmissionError> {
        let unsigned = &signed.unsigned;
        if let Some(prior) = self.cached(&unsigned.digest) {
            info!(evt = "resubmit_cached", channel = %prior.channel, version = prior.version);
            return Ok(prior);
        }
        let block = time::timeout(self.timeout, self.orderer.fetch_config(&unsigned.channel))
            .await
            .map_err(|_| self.timed_out("fetch"))?
            .map_err(map_failure)?;
        if block.version == unsigned.target_version
            && block.last_update.as_deref() == Some(unsigned.digest.as_str())
        {
            let prior = CommitResult {
                channel: unsigned.channel.clone(),
                version: block.version,
                update_digest: unsigned.digest.clone(),
                committed_ms: crate::model::now_millis(),
            };
            info!(evt = "resubmit_committed", channel = %prior.channel, version = prior.version);
            return Ok(self.remember(prior));
        }
        if block.version != unsigned.base_version {
            warn!(
                evt = "stale_base",
                channel = %unsigned.channel,
                base = unsigned.base_version,
                current = block.version
            );
            return Err(StaleBaseError {
                base: unsigned.base_version,
                current: block.version,
            }
            .into());
        }
        let envelope = CommitEnvelope::from_signed(signed);
        let result = time::timeout(self.timeout, self.orderer.submit_update(&envelope))
            .await
            .map_err(|_| self.timed_out("submit"))?
            .map_err(map_failure)?;
        info!(
            evt = "committed",
            channel = %result.channel,
            version = result.version,
            digest = %result.update_digest
        );
        Ok(self.remember(result))
    }

    fn cached(&self, digest: &str) -> Option<CommitResult> {
        self.committed
            .lock()
            .ok()
            .and_then(|map| map.get(digest).cloned())
    }

    fn remember(&self, result: CommitResult) -> CommitResult {
        if let Ok(mut map) = self.committed.lock() {
            map.insert(result.update_digest.clone(), result.clone());
        }
        result
    }

    fn timed_out(&self, what: &str) -> SubmissionError {
        SubmissionError::Unavailable(format!(
            "{what} timed out after {} ms",
            self.timeout.as_millis()
        ))
    }
}

fn map_failure(failure: OrdererFailure) -> SubmissionError {
    match failure {
        OrdererFailure::StaleBase { base, current } => StaleBaseError { base, current }.into(),
        OrdererFailure::SignatureInvalid(reason) => SubmissionError::SignatureInvalid(reason),
        OrdererFailure::PolicyViolation(reason) => SubmissionError::PolicyViolation(reason),
        OrdererFailure::Unavailable(reason) => SubmissionError::Unavailable(reason),
        OrdererFailure::AlreadyJoined => SubmissionError::Rejected("already joined".into()),
        OrdererFailure::Rejected(reason) => SubmissionError::Rejected(reason),
    }
}
