//! Quorum Signing Coordinator.
//!
//! Every required signer receives the unsigned update concurrently; all
//! outcomes are awaited before the quorum check so that a failure report names
//! every missing signer. Signatures from an unsuccessful collection are dropped.

use crate::delta::UnsignedUpdate;
use crate::error::QuorumNotMetError;
use crate::policy::RequiredSigners;
use crate::sign::verify_signature_base64;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

/// Signature contributed by one signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSignature {
    /// Signer id (`org1-admin`).
    pub signer: String,
    /// MSP id of the signer's organization.
    pub msp_id: String,
    /// Base64 ed25519 public key.
    pub public_key: String,
    /// Base64 signature over [`UnsignedUpdate::signing_payload`].
    pub signature: String,
}

/// Failure reported by a signer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SignerFailure(pub String);

/// Credential of an existing organization able to counter-sign updates.
#[async_trait]
pub trait UpdateSigner: Send + Sync {
    /// Signer id matched against [`RequiredSigners`].
    fn signer_id(&self) -> &str;

    /// Signs the update.
    async fn sign(&self, update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure>;
}

/// Signers reachable from this host, by id.
#[derive(Clone, Default)]
pub struct SignerDirectory {
    signers: BTreeMap<String, Arc<dyn UpdateSigner>>,
}

impl SignerDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `signer` under its own id, replacing any previous entry.
    pub fn insert(&mut self, signer: Arc<dyn UpdateSigner>) {
        self.signers.insert(signer.signer_id().to_string(), signer);
    }

    /// Looks a signer up.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn UpdateSigner>> {
        self.signers.get(id)
    }

    /// Registered ids.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.signers.keys()
    }
}

impl fmt::Debug for SignerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.signers.keys()).finish()
    }
}

/// Unsigned update plus the signatures that make it binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUpdate {
    /// The update that was signed.
    pub unsigned: UnsignedUpdate,
    /// Signatures keyed by signer id.
    pub signatures: BTreeMap<String, UpdateSignature>,
}

impl SignedUpdate {
    /// True when every required signer contributed.
    pub fn satisfies(&self, required: &RequiredSigners) -> bool {
        required.iter().all(|id| self.signatures.contains_key(id))
    }
}

/// Fans the update out to every required signer and checks the quorum.
#[derive(Debug, Clone)]
pub struct QuorumCoordinator {
    directory: SignerDirectory,
    per_signer_timeout: Duration,
}

impl QuorumCoordinator {
    /// Coordinator over `directory`; each dispatch is bounded by `per_signer_timeout`.
    pub fn new(directory: SignerDirectory, per_signer_timeout: Duration) -> Self {
        Self {
            directory,
            per_signer_timeout,
        }
    }

    /// Collects a signature from each of `required`.
    pub async fn collect_signatures(
        &self,
        unsigned: &UnsignedUpdate,
        required: &RequiredSigners,
    ) -> Result<SignedUpdate, QuorumNotMetError> {
        let dispatches = required.iter().map(|id| async move {
            let outcome = self.dispatch(id, unsigned).await;
            (id.clone(), outcome)
        });
        let mut signatures = BTreeMap::new();
        let mut reasons = BTreeMap::new();
        for (id, outcome) in join_all(dispatches).await {
            match outcome {
                Ok(signature) => {
                    signatures.insert(id, signature);
                }
                Err(reason) => {
                    warn!(evt = "signer_failed", signer = %id, %reason, digest = %unsigned.digest);
                    reasons.insert(id, reason);
                }
            }
        }
        let signed = SignedUpdate {
            unsigned: unsigned.clone(),
            signatures,
        };
        if !reasons.is_empty() || !signed.satisfies(required) {
            for id in required.iter() {
                if !signed.signatures.contains_key(id) && !reasons.contains_key(id) {
                    reasons.insert(id.clone(), "no signature returned".into());
                }
            }
            return Err(QuorumNotMetError {
                missing: reasons.keys().cloned().collect(),
                reasons,
            });
        }
        info!(
            evt = "quorum_satisfied",
            channel = %unsigned.channel,
            digest = %unsigned.digest,
            signers = %required
        );
        Ok(signed)
    }

    async fn dispatch(&self, id: &str, unsigned: &UnsignedUpdate) -> Result<UpdateSignature, String> {
        let signer = self
            .directory
            .get(id)
            .ok_or_else(|| "no signer configured".to_string())?;
        let signature = time::timeout(self.per_signer_timeout, signer.sign(unsigned))
            .await
            .map_err(|_| {
                format!(
                    "timed out after {} ms",
                    self.per_signer_timeout.as_millis()
                )
            })?
            .map_err(|err| err.to_string())?;
        if signature.signer != id {
            return Err(format!("signature labelled {}", signature.signer));
        }
        verify_signature_base64(
            &signature.public_key,
            &unsigned.signing_payload(),
            &signature.signature,
        )
        .map_err(|err| format!("invalid signature: {err}"))?;
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::{load_or_derive_keypair, Ed25519KeySource, LocalKeySigner};
    use proptest::prelude::*;

    struct DelayedSigner {
        inner: LocalKeySigner,
        delay: Duration,
    }

    #[async_trait]
    impl UpdateSigner for DelayedSigner {
        fn signer_id(&self) -> &str {
            self.inner.signer_id()
        }

        async fn sign(&self, update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
            time::sleep(self.delay).await;
            self.inner.sign(update).await
        }
    }

    struct RefusingSigner(&'static str);

    #[async_trait]
    impl UpdateSigner for RefusingSigner {
        fn signer_id(&self) -> &str {
            self.0
        }

        async fn sign(&self, _update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
            Err(SignerFailure("operator declined".into()))
        }
    }

    fn local(org: &str) -> LocalKeySigner {
        let keys =
            load_or_derive_keypair(&Ed25519KeySource::Seed(format!("{org}-admin"))).unwrap();
        LocalKeySigner::new(format!("{org}-admin"), format!("Org{}MSP", &org[3..]), keys)
    }

    fn delayed(org: &str, delay_ms: u64) -> Arc<dyn UpdateSigner> {
        Arc::new(DelayedSigner {
            inner: local(org),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn unsigned() -> UnsignedUpdate {
        UnsignedUpdate::new("mychannel", 3, b"{\"added\":{}}".to_vec(), "add organization org3")
    }

    #[tokio::test]
    async fn all_signers_yield_exact_quorum() {
        let mut directory = SignerDirectory::new();
        directory.insert(delayed("org1", 0));
        directory.insert(delayed("org2", 5));
        let coordinator = QuorumCoordinator::new(directory, Duration::from_secs(1));
        let required = RequiredSigners::new(["org1-admin", "org2-admin"]);
        let signed = coordinator
            .collect_signatures(&unsigned(), &required)
            .await
            .unwrap();
        assert!(signed.satisfies(&required));
        assert_eq!(signed.signatures.len(), 2);
    }

    #[tokio::test]
    async fn every_missing_signer_is_named() {
        let mut directory = SignerDirectory::new();
        directory.insert(delayed("org1", 0));
        directory.insert(delayed("org2", 500));
        directory.insert(Arc::new(RefusingSigner("org3-admin")));
        let coordinator = QuorumCoordinator::new(directory, Duration::from_millis(50));
        let required = RequiredSigners::new(["org1-admin", "org2-admin", "org3-admin", "org4-admin"]);
        let err = coordinator
            .collect_signatures(&unsigned(), &required)
            .await
            .unwrap_err();
        assert_eq!(err.missing, vec!["org2-admin", "org3-admin", "org4-admin"]);
        assert!(err.reasons["org2-admin"].contains("timed out"));
        assert_eq!(err.reasons["org3-admin"], "operator declined");
        assert_eq!(err.reasons["org4-admin"], "no signer configured");
    }

    #[tokio::test]
    async fn signature_over_other_payload_is_rejected() {
        struct Replaying(LocalKeySigner);

        #[async_trait]
        impl UpdateSigner for Replaying {
            fn signer_id(&self) -> &str {
                self.0.signer_id()
            }

            async fn sign(&self, _update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
                let other = UnsignedUpdate::new("otherchannel", 1, vec![1, 2, 3], "other");
                self.0.sign(&other).await
            }
        }

        let mut directory = SignerDirectory::new();
        directory.insert(Arc::new(Replaying(local("org1"))));
        let coordinator = QuorumCoordinator::new(directory, Duration::from_secs(1));
        let err = coordinator
            .collect_signatures(&unsigned(), &RequiredSigners::new(["org1-admin"]))
            .await
            .unwrap_err();
        assert!(err.reasons["org1-admin"].starts_with("invalid signature"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn completion_order_does_not_change_result(delays in proptest::collection::vec(0u64..15, 3)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let update = unsigned();
            let required = RequiredSigners::new(["org1-admin", "org2-admin", "org3-admin"]);
            let collect = |delays: [u64; 3]| {
                let mut directory = SignerDirectory::new();
                directory.insert(delayed("org1", delays[0]));
                directory.insert(delayed("org2", delays[1]));
                directory.insert(delayed("org3", delays[2]));
                let coordinator = QuorumCoordinator::new(directory, Duration::from_secs(2));
                runtime.block_on(coordinator.collect_signatures(&update, &required))
            };
            let ordered = collect([0, 0, 0]).unwrap();
            let shuffled = collect([delays[0], delays[1], delays[2]]).unwrap();
            prop_assert_eq!(ordered, shuffled);
        }
    }
}
