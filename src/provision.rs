//! Credential Provisioner: registers and enrolls identities with the
//! organization's certificate authority and keeps them in the wallet.

use crate::collab::{
    CaFailure, CaRoots, CertificateAuthority, EnrollmentProfile, EnrollmentRequest, Registration,
};
use crate::error::CredentialError;
use crate::model::{wallet_label, Identity, NetworkRole, Participant, RequestId, TlsIdentity};
use crate::wallet::Wallet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

/// Enrollments allowed per registration: signing plus TLS.
pub const MAX_ENROLLMENTS: u32 = 2;

/// Enrollment id and optional secret as supplied by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSpec {
    /// Enrollment id to register.
    pub enrollment_id: String,
    /// Secret; derived from the request id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl EnrollmentSpec {
    /// Spec with a derived secret.
    pub fn new(enrollment_id: impl Into<String>) -> Self {
        Self {
            enrollment_id: enrollment_id.into(),
            secret: None,
        }
    }

    /// Resolves the secret for `request`.
    pub fn resolve(&self, request: &RequestId) -> EnrollmentCredentials {
        EnrollmentCredentials {
            enrollment_id: self.enrollment_id.clone(),
            secret: self
                .secret
                .clone()
                .unwrap_or_else(|| derive_secret(request, &self.enrollment_id)),
        }
    }
}

/// Enrollment id with its secret.
#[derive(Clone, PartialEq, Eq)]
pub struct EnrollmentCredentials {
    /// Enrollment id.
    pub enrollment_id: String,
    /// Enrollment secret.
    pub secret: String,
}

impl fmt::Debug for EnrollmentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentCredentials")
            .field("enrollment_id", &self.enrollment_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Secret reproduced on every attempt of the same request.
pub fn derive_secret(request: &RequestId, enrollment_id: &str) -> String {
    let digest = Sha256::digest(format!("{request}:{enrollment_id}").as_bytes());
    hex::encode(&digest[..16])
}

/// Certificate authorities by organization name.
#[derive(Clone, Default)]
pub struct CaDirectory {
    cas: BTreeMap<String, Arc<dyn CertificateAuthority>>,
}

impl CaDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the CA serving `organization`.
    pub fn insert(&mut self, organization: impl Into<String>, ca: Arc<dyn CertificateAuthority>) {
        self.cas.insert(organization.into(), ca);
    }

    /// CA of `organization`.
    pub fn get(&self, organization: &str) -> Result<&Arc<dyn CertificateAuthority>, CredentialError> {
        self.cas
            .get(organization)
            .ok_or_else(|| CredentialError::UnknownAuthority(organization.to_string()))
    }
}

impl fmt::Debug for CaDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.cas.keys()).finish()
    }
}

/// Issues identities for participants.
pub struct Provisioner {
    cas: CaDirectory,
    wallet: Arc<dyn Wallet>,
    timeout: Duration,
    domain: String,
}

impl Provisioner {
    /// Provisioner over `cas`, storing identities in `wallet`.
    pub fn new(
        cas: CaDirectory,
        wallet: Arc<dyn Wallet>,
        timeout: Duration,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            cas,
            wallet,
            timeout,
            domain: domain.into(),
        }
    }

    /// Registers and enrolls `credentials` for `participant` in `role`.
    ///
    /// Node roles also receive a TLS identity for the node's host names.
    pub async fn provision(
        &self,
        participant: &Participant,
        role: NetworkRole,
        credentials: &EnrollmentCredentials,
    ) -> Result<Identity, CredentialError> {
        let org = participant.org_name();
        let ca = self.cas.get(org)?;
        let eid = &credentials.enrollment_id;
        let registration = Registration {
            enrollment_id: eid.clone(),
            secret: credentials.secret.clone(),
            role,
            affiliation: String::new(),
            max_enrollments: MAX_ENROLLMENTS,
        };
        self.call(eid, ca.register(&registration)).await?;
        info!(evt = "registered", org, enrollment_id = %eid, role = %role);
        let identity = self.enroll(ca.as_ref(), participant, role, credentials).await?;
        self.store(org, &identity)?;
        Ok(identity)
    }

    /// Recovers an identity whose registration already exists.
    ///
    /// Returns the wallet copy when present, otherwise enrolls again with the
    /// same secret. Fails with the original duplicate error when neither works.
    pub async fn reclaim(
        &self,
        participant: &Participant,
        role: NetworkRole,
        credentials: &EnrollmentCredentials,
    ) -> Result<Identity, CredentialError> {
        let org = participant.org_name();
        let label = wallet_label(org, &credentials.enrollment_id);
        let stored = self
            .wallet
            .get(&label)
            .map_err(|err| CredentialError::Wallet {
                label: label.clone(),
                reason: err.to_string(),
            })?;
        if let Some(identity) = stored.filter(|identity| {
            identity.role == role
                && identity.msp_id == participant.msp_id
                && (role != NetworkRole::PeerNode || identity.tls.is_some())
        }) {
            info!(evt = "reclaimed", source = "wallet", %label);
            return Ok(identity);
        }
        let ca = self.cas.get(org)?;
        match self.enroll(ca.as_ref(), participant, role, credentials).await {
            Ok(identity) => {
                info!(evt = "reclaimed", source = "enroll", %label);
                self.store(org, &identity)?;
                Ok(identity)
            }
            Err(err) => {
                warn!(evt = "reclaim_failed", %label, error = %err);
                Err(CredentialError::Duplicate {
                    enrollment_id: credentials.enrollment_id.clone(),
                })
            }
        }
    }

    /// Root certificates of `organization`'s CA.
    pub async fn roots(&self, organization: &str) -> Result<CaRoots, CredentialError> {
        let ca = self.cas.get(organization)?;
        self.call(organization, ca.roots()).await
    }

    async fn enroll(
        &self,
        ca: &dyn CertificateAuthority,
        participant: &Participant,
        role: NetworkRole,
        credentials: &EnrollmentCredentials,
    ) -> Result<Identity, CredentialError> {
        let eid = &credentials.enrollment_id;
        let signing = self
            .call(
                eid,
                ca.enroll(&EnrollmentRequest {
                    enrollment_id: eid.clone(),
                    secret: credentials.secret.clone(),
                    profile: EnrollmentProfile::Signing,
                    hosts: Vec::new(),
                }),
            )
            .await?;
        let tls = if role == NetworkRole::PeerNode {
            let hosts = vec![participant.host(&self.domain), "localhost".to_string()];
            let tls = self
                .call(
                    eid,
                    ca.enroll(&EnrollmentRequest {
                        enrollment_id: eid.clone(),
                        secret: credentials.secret.clone(),
                        profile: EnrollmentProfile::Tls,
                        hosts: hosts.clone(),
                    }),
                )
                .await?;
            Some(TlsIdentity {
                certificate: tls.certificate,
                private_key: tls.private_key,
                hosts,
            })
        } else {
            None
        };
        info!(evt = "enrolled", enrollment_id = %eid, role = %role, tls = tls.is_some());
        Ok(Identity {
            enrollment_id: eid.clone(),
            msp_id: participant.msp_id.clone(),
            role,
            certificate: signing.certificate,
            private_key: signing.private_key,
            tls,
        })
    }

    fn store(&self, org: &str, identity: &Identity) -> Result<(), CredentialError> {
        let label = identity.label(org);
        self.wallet
            .put(&label, identity)
            .map_err(|err| CredentialError::Wallet {
                label,
                reason: err.to_string(),
            })
    }

    async fn call<T>(
        &self,
        subject: &str,
        fut: impl Future<Output = Result<T, CaFailure>>,
    ) -> Result<T, CredentialError> {
        let outcome = time::timeout(self.timeout, fut).await.map_err(|_| {
            CredentialError::Transient {
                enrollment_id: subject.to_string(),
                reason: format!("timed out after {} ms", self.timeout.as_millis()),
            }
        })?;
        outcome.map_err(|failure| match failure {
            CaFailure::Duplicate => CredentialError::Duplicate {
                enrollment_id: subject.to_string(),
            },
            CaFailure::Rejected(reason) => CredentialError::Rejected {
                enrollment_id: subject.to_string(),
                reason,
            },
            CaFailure::Unavailable(reason) => CredentialError::Transient {
                enrollment_id: subject.to_string(),
                reason,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCa;
    use crate::wallet::MemoryWallet;

    fn provisioner(ca: Arc<SimCa>, wallet: Arc<MemoryWallet>) -> Provisioner {
        let mut cas = CaDirectory::new();
        cas.insert("org3", ca.clone());
        cas.insert("org1", ca);
        Provisioner::new(cas, wallet, Duration::from_secs(1), "example.com")
    }

    fn creds(eid: &str) -> EnrollmentCredentials {
        EnrollmentSpec::new(eid).resolve(&RequestId::parse("req-1").unwrap())
    }

    #[test]
    fn derived_secrets_are_stable_per_request() {
        let a = RequestId::parse("req-1").unwrap();
        let b = RequestId::parse("req-2").unwrap();
        assert_eq!(derive_secret(&a, "admin"), derive_secret(&a, "admin"));
        assert_ne!(derive_secret(&a, "admin"), derive_secret(&b, "admin"));
        assert_ne!(derive_secret(&a, "admin"), derive_secret(&a, "user1"));
        assert!(!format!("{:?}", creds("admin")).contains(&creds("admin").secret));
    }

    #[tokio::test]
    async fn admin_is_registered_enrolled_and_stored() {
        let wallet = Arc::new(MemoryWallet::new());
        let p = provisioner(Arc::new(SimCa::new("org3")), wallet.clone());
        let org = Participant::organization("org3", "Org3MSP");
        let identity = p.provision(&org, NetworkRole::Admin, &creds("admin")).await.unwrap();
        assert_eq!(identity.msp_id, "Org3MSP");
        assert!(identity.tls.is_none());
        assert_eq!(wallet.get("org3.admin").unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn peer_receives_tls_identity_for_its_hosts() {
        let p = provisioner(Arc::new(SimCa::new("org1")), Arc::new(MemoryWallet::new()));
        let node = Participant::node("peer1", "org1", "Org1MSP");
        let identity = p
            .provision(&node, NetworkRole::PeerNode, &creds("peer1"))
            .await
            .unwrap();
        let tls = identity.tls.unwrap();
        assert_eq!(tls.hosts, vec!["peer1.org1.example.com", "localhost"]);
        assert_ne!(tls.certificate, identity.certificate);
    }

    #[tokio::test]
    async fn second_registration_is_duplicate_and_reclaimable() {
        let wallet = Arc::new(MemoryWallet::new());
        let p = provisioner(Arc::new(SimCa::new("org3")), wallet);
        let org = Participant::organization("org3", "Org3MSP");
        let first = p.provision(&org, NetworkRole::Admin, &creds("admin")).await.unwrap();
        let err = p
            .provision(&org, NetworkRole::Admin, &creds("admin"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CredentialError::Duplicate {
                enrollment_id: "admin".into()
            }
        );
        let reclaimed = p.reclaim(&org, NetworkRole::Admin, &creds("admin")).await.unwrap();
        assert_eq!(reclaimed, first);
    }

    #[tokio::test]
    async fn reclaim_without_wallet_copy_reenrolls_once() {
        let ca = Arc::new(SimCa::new("org3"));
        let org = Participant::organization("org3", "Org3MSP");
        provisioner(ca.clone(), Arc::new(MemoryWallet::new()))
            .provision(&org, NetworkRole::Admin, &creds("admin"))
            .await
            .unwrap();
        let fresh = provisioner(ca, Arc::new(MemoryWallet::new()));
        assert!(fresh
            .reclaim(&org, NetworkRole::Admin, &creds("admin"))
            .await
            .is_ok());
        // Never registered, so there is nothing to reclaim.
        assert!(matches!(
            fresh
                .reclaim(&org, NetworkRole::Admin, &creds("other"))
                .await,
            Err(CredentialError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_ca_is_transient() {
        let ca = Arc::new(SimCa::new("org3"));
        ca.set_available(false);
        let p = provisioner(ca, Arc::new(MemoryWallet::new()));
        let err = p
            .provision(
                &Participant::organization("org3", "Org3MSP"),
                NetworkRole::Admin,
                &creds("admin"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Transient { .. }));
    }

    #[tokio::test]
    async fn unknown_organization_has_no_authority() {
        let p = provisioner(Arc::new(SimCa::new("org3")), Arc::new(MemoryWallet::new()));
        let err = p
            .provision(
                &Participant::organization("org9", "Org9MSP"),
                NetworkRole::Admin,
                &creds("admin"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::UnknownAuthority("org9".into()));
    }
}
