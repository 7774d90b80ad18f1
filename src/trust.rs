//! Trust Material Builder.
//!
//! Each participant owns one directory under the trust root, named by its
//! storage key. A bundle is assembled in a staging directory and renamed into
//! place only once every file and the `bundle.json` manifest are written, so a
//! failed build leaves nothing behind but a discardable staging directory.
//!
//! Organization layout:
//!
//! ```text
//! <root>/org3/msp/{cacerts/ca.pem, tlscacerts/ca.crt, config.yaml}
//! <root>/org3/users/<enrollment-id>@org3.<domain>/msp/{cacerts, keystore/priv_sk, signcerts/cert.pem, config.yaml}
//! ```
//!
//! Node layout:
//!
//! ```text
//! <root>/peer1.org1/msp/{cacerts/ca.pem, tlscacerts/ca.crt, keystore/priv_sk, signcerts/cert.pem, config.yaml}
//! <root>/peer1.org1/tls/{ca.crt, server.crt, server.key}
//! ```

use crate::collab::CaRoots;
use crate::error::TrustMaterialError;
use crate::model::{now_millis, Identity, NetworkRole, Participant, ParticipantKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const MANIFEST: &str = "bundle.json";
const STAGING: &str = ".staging";
const CA_CERT: &str = "cacerts/ca.pem";

/// Materialized trust store of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
    /// Storage key of the owning participant.
    pub participant: String,
    /// MSP id of the owning organization.
    pub msp_id: String,
    /// Bundle directory.
    pub root: PathBuf,
    /// MSP directory presented by the participant.
    pub msp_dir: PathBuf,
    /// TLS directory (nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_dir: Option<PathBuf>,
    /// Hex SHA-256 over every file path and content in the bundle.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    participant: String,
    msp_id: String,
    fingerprint: String,
    files: Vec<String>,
    tls: bool,
    created_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct OuIdentifier {
    certificate: &'static str,
    organizational_unit_identifier: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NodeOus {
    enable: bool,
    #[serde(rename = "ClientOUIdentifier")]
    client: OuIdentifier,
    #[serde(rename = "PeerOUIdentifier")]
    peer: OuIdentifier,
    #[serde(rename = "AdminOUIdentifier")]
    admin: OuIdentifier,
    #[serde(rename = "OrdererOUIdentifier")]
    orderer: OuIdentifier,
}

#[derive(Serialize)]
struct MspConfig {
    #[serde(rename = "NodeOUs")]
    node_ous: NodeOus,
}

/// Renders the NodeOU descriptor placed in every MSP directory.
pub fn node_ou_descriptor() -> Result<String, TrustMaterialError> {
    let ou = |unit| OuIdentifier {
        certificate: CA_CERT,
        organizational_unit_identifier: unit,
    };
    let config = MspConfig {
        node_ous: NodeOus {
            enable: true,
            client: ou("client"),
            peer: ou("peer"),
            admin: ou("admin"),
            orderer: ou("orderer"),
        },
    };
    serde_yaml::to_string(&config).map_err(|err| TrustMaterialError::Encode(err.to_string()))
}

/// Writes per-participant trust bundles under a root directory.
#[derive(Debug, Clone)]
pub struct TrustMaterialBuilder {
    root: PathBuf,
    domain: String,
}

impl TrustMaterialBuilder {
    /// Builder writing under `root`; host names use `domain`.
    pub fn new(root: impl Into<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            domain: domain.into(),
        }
    }

    /// Directory a participant's bundle lives in.
    pub fn bundle_dir(&self, participant: &Participant) -> PathBuf {
        self.root.join(participant.storage_key())
    }

    /// Loads an existing bundle, if one was materialized.
    pub fn existing(&self, participant: &Participant) -> Result<Option<TrustBundle>, TrustMaterialError> {
        let dir = self.bundle_dir(participant);
        let path = dir.join(MANIFEST);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|err| io_error(&path, err))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|err| io_error(&path, err))?;
        Ok(Some(bundle_from(&dir, &manifest)))
    }

    /// Lays out the trust store for `participant` from its identities.
    ///
    /// Re-running with the same identities returns the existing bundle; a bundle
    /// with different content is never overwritten.
    pub fn materialize(
        &self,
        identities: &[Identity],
        participant: &Participant,
        roots: &CaRoots,
    ) -> Result<TrustBundle, TrustMaterialError> {
        let key = participant.storage_key();
        check_key(&key)?;
        let files = self.layout(identities, participant, roots)?;
        let fingerprint = fingerprint(&key, &participant.msp_id, &files);
        let dir = self.bundle_dir(participant);

        if let Some(existing) = self.existing(participant)? {
            if existing.fingerprint == fingerprint {
                debug!(evt = "trust_reused", participant = %key);
                return Ok(existing);
            }
            warn!(evt = "trust_conflict", participant = %key);
            return Err(TrustMaterialError::Conflict { participant: key });
        }
        if dir.exists() {
            return Err(TrustMaterialError::Conflict { participant: key });
        }

        let manifest = Manifest {
            participant: key.clone(),
            msp_id: participant.msp_id.clone(),
            fingerprint,
            files: files.keys().cloned().collect(),
            tls: participant.kind == ParticipantKind::Node,
            created_ms: now_millis(),
        };
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let staging = self.root.join(STAGING).join(format!("{key}.{nanos}"));
        if let Err(err) = write_staged(&staging, &files, &manifest) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        if let Err(err) = fs::rename(&staging, &dir) {
            let _ = fs::remove_dir_all(&staging);
            return Err(io_error(&dir, err));
        }
        info!(evt = "trust_materialized", participant = %key, files = manifest.files.len());
        Ok(bundle_from(&dir, &manifest))
    }

    /// Removes abandoned staging directories.
    pub fn purge_staging(&self) -> Result<(), TrustMaterialError> {
        let staging = self.root.join(STAGING);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| io_error(&staging, err))?;
        }
        Ok(())
    }

    fn layout(
        &self,
        identities: &[Identity],
        participant: &Participant,
        roots: &CaRoots,
    ) -> Result<BTreeMap<String, String>, TrustMaterialError> {
        if identities.is_empty() {
            return Err(TrustMaterialError::Incomplete(format!(
                "no identities for {participant}"
            )));
        }
        for identity in identities {
            if identity.msp_id != participant.msp_id {
                return Err(TrustMaterialError::Incomplete(format!(
                    "{} belongs to {}, not {}",
                    identity.enrollment_id, identity.msp_id, participant.msp_id
                )));
            }
            check_key(&identity.enrollment_id)?;
            check_pem(&identity.enrollment_id, "private key", &identity.private_key)?;
            check_pem(&identity.enrollment_id, "certificate", &identity.certificate)?;
        }
        let descriptor = node_ou_descriptor()?;
        let mut files = BTreeMap::new();
        match participant.kind {
            ParticipantKind::Organization => {
                files.insert(format!("msp/{CA_CERT}"), roots.root_cert.clone());
                files.insert("msp/tlscacerts/ca.crt".into(), roots.tls_root_cert.clone());
                files.insert("msp/config.yaml".into(), descriptor.clone());
                for identity in identities {
                    let base = format!(
                        "users/{}@{}/msp",
                        identity.enrollment_id,
                        participant.host(&self.domain)
                    );
                    identity_msp(&mut files, &base, identity, roots, &descriptor);
                }
            }
            ParticipantKind::Node => {
                let peer = identities
                    .iter()
                    .find(|identity| identity.role == NetworkRole::PeerNode)
                    .ok_or_else(|| {
                        TrustMaterialError::Incomplete(format!("no peer identity for {participant}"))
                    })?;
                let tls = peer.tls.as_ref().ok_or_else(|| {
                    TrustMaterialError::Incomplete(format!("no TLS identity for {participant}"))
                })?;
                check_pem(&peer.enrollment_id, "TLS private key", &tls.private_key)?;
                identity_msp(&mut files, "msp", peer, roots, &descriptor);
                files.insert("msp/tlscacerts/ca.crt".into(), roots.tls_root_cert.clone());
                files.insert("tls/ca.crt".into(), roots.tls_root_cert.clone());
                files.insert("tls/server.crt".into(), tls.certificate.clone());
                files.insert("tls/server.key".into(), tls.private_key.clone());
            }
        }
        Ok(files)
    }
}

fn identity_msp(
    files: &mut BTreeMap<String, String>,
    base: &str,
    identity: &Identity,
    roots: &CaRoots,
    descriptor: &str,
) {
    files.insert(format!("{base}/{CA_CERT}"), roots.root_cert.clone());
    files.insert(format!("{base}/keystore/priv_sk"), identity.private_key.clone());
    files.insert(format!("{base}/signcerts/cert.pem"), identity.certificate.clone());
    files.insert(format!("{base}/config.yaml"), descriptor.to_string());
}

fn write_staged(
    staging: &Path,
    files: &BTreeMap<String, String>,
    manifest: &Manifest,
) -> Result<(), TrustMaterialError> {
    for (relative, contents) in files {
        let path = staging.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        fs::write(&path, contents).map_err(|err| io_error(&path, err))?;
    }
    let path = staging.join(MANIFEST);
    let data = serde_json::to_vec_pretty(manifest)
        .map_err(|err| TrustMaterialError::Encode(err.to_string()))?;
    fs::write(&path, data).map_err(|err| io_error(&path, err))
}

fn bundle_from(dir: &Path, manifest: &Manifest) -> TrustBundle {
    TrustBundle {
        participant: manifest.participant.clone(),
        msp_id: manifest.msp_id.clone(),
        root: dir.to_path_buf(),
        msp_dir: dir.join("msp"),
        tls_dir: manifest.tls.then(|| dir.join("tls")),
        fingerprint: manifest.fingerprint.clone(),
    }
}

fn fingerprint(key: &str, msp_id: &str, files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(msp_id.as_bytes());
    hasher.update([0u8]);
    for (path, contents) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(contents.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn check_key(key: &str) -> Result<(), TrustMaterialError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(TrustMaterialError::InvalidKey(key.to_string()))
    }
}

fn check_pem(owner: &str, what: &str, pem: &str) -> Result<(), TrustMaterialError> {
    if pem.trim_start().starts_with("-----BEGIN ") {
        Ok(())
    } else {
        Err(TrustMaterialError::Incomplete(format!("{what} of {owner} is not PEM")))
    }
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> TrustMaterialError {
    TrustMaterialError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::TlsIdentity;

    pub(crate) fn temp_root(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("onboard_{tag}_{nanos}"))
    }

    fn pem(label: &str, body: &str) -> String {
        format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----\n")
    }

    fn roots() -> CaRoots {
        CaRoots {
            root_cert: pem("CERTIFICATE", "root"),
            tls_root_cert: pem("CERTIFICATE", "tls-root"),
        }
    }

    fn identity(eid: &str, msp: &str, role: NetworkRole, tls: bool) -> Identity {
        Identity {
            enrollment_id: eid.into(),
            msp_id: msp.into(),
            role,
            certificate: pem("CERTIFICATE", eid),
            private_key: pem("PRIVATE KEY", eid),
            tls: tls.then(|| TlsIdentity {
                certificate: pem("CERTIFICATE", &format!("{eid}-tls")),
                private_key: pem("PRIVATE KEY", &format!("{eid}-tls")),
                hosts: vec!["peer1.org1.example.com".into(), "localhost".into()],
            }),
        }
    }

    #[test]
    fn node_bundle_has_msp_and_tls_layout() {
        let root = temp_root("trust_node");
        let builder = TrustMaterialBuilder::new(&root, "example.com");
        let node = Participant::node("peer1", "org1", "Org1MSP");
        let bundle = builder
            .materialize(&[identity("peer1", "Org1MSP", NetworkRole::PeerNode, true)], &node, &roots())
            .unwrap();
        assert_eq!(bundle.root, root.join("peer1.org1"));
        for file in [
            "msp/cacerts/ca.pem",
            "msp/keystore/priv_sk",
            "msp/signcerts/cert.pem",
            "msp/config.yaml",
            "tls/ca.crt",
            "tls/server.crt",
            "tls/server.key",
        ] {
            assert!(bundle.root.join(file).is_file(), "missing {file}");
        }
        let config = fs::read_to_string(bundle.msp_dir.join("config.yaml")).unwrap();
        assert!(config.contains("PeerOUIdentifier"));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn rematerializing_is_idempotent_and_conflicts_are_refused() {
        let root = temp_root("trust_idem");
        let builder = TrustMaterialBuilder::new(&root, "example.com");
        let org = Participant::organization("org3", "Org3MSP");
        let ids = [
            identity("admin", "Org3MSP", NetworkRole::Admin, false),
            identity("user1", "Org3MSP", NetworkRole::User, false),
        ];
        let first = builder.materialize(&ids, &org, &roots()).unwrap();
        assert!(first
            .root
            .join("users/admin@org3.example.com/msp/signcerts/cert.pem")
            .is_file());
        let second = builder.materialize(&ids, &org, &roots()).unwrap();
        assert_eq!(first, second);

        let other = [identity("admin2", "Org3MSP", NetworkRole::Admin, false)];
        let err = builder.materialize(&other, &org, &roots()).unwrap_err();
        assert_eq!(
            err,
            TrustMaterialError::Conflict {
                participant: "org3".into()
            }
        );
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn rejected_material_leaves_no_bundle() {
        let root = temp_root("trust_reject");
        let builder = TrustMaterialBuilder::new(&root, "example.com");
        let node = Participant::node("peer1", "org1", "Org1MSP");
        let mut broken = identity("peer1", "Org1MSP", NetworkRole::PeerNode, true);
        broken.private_key = "not a key".into();
        assert!(matches!(
            builder.materialize(&[broken], &node, &roots()),
            Err(TrustMaterialError::Incomplete(_))
        ));
        let foreign = identity("peer1", "Org2MSP", NetworkRole::PeerNode, true);
        assert!(builder.materialize(&[foreign], &node, &roots()).is_err());
        assert!(!builder.bundle_dir(&node).exists());
        assert_eq!(builder.existing(&node).unwrap(), None);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn participants_never_share_a_directory() {
        let root = temp_root("trust_iso");
        let builder = TrustMaterialBuilder::new(&root, "example.com");
        let a = Participant::node("peer1", "org1", "Org1MSP");
        let b = Participant::node("peer1", "org2", "Org2MSP");
        let ba = builder
            .materialize(&[identity("peer1", "Org1MSP", NetworkRole::PeerNode, true)], &a, &roots())
            .unwrap();
        let bb = builder
            .materialize(&[identity("peer1", "Org2MSP", NetworkRole::PeerNode, true)], &b, &roots())
            .unwrap();
        assert_ne!(ba.root, bb.root);
        assert_ne!(ba.fingerprint, bb.fingerprint);
        builder.purge_staging().unwrap();
        fs::remove_dir_all(&root).unwrap();
    }
}
