//! Operator configuration: a JSON document plus `ONBOARD_*` overrides.

use crate::codec::{CommandCodec, JsonCodec};
use crate::collab::ConfigCodec;
use crate::node::DeploymentSettings;
use crate::policy::QuorumPolicy;
use crate::quorum::SignerDirectory;
use crate::sign::{load_or_derive_keypair, Ed25519KeySource, LocalKeySigner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config I/O error at {path}: {reason}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        reason: String,
    },
    /// The file is not valid configuration JSON.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-collaborator timeouts in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Each CA call.
    pub ca_ms: u64,
    /// Each signer dispatch.
    pub signer_ms: u64,
    /// Config fetch and update submission.
    pub orderer_ms: u64,
    /// Node health polling, in total.
    pub health_ms: u64,
    /// Pause between health probes.
    pub poll_interval_ms: u64,
    /// Channel join.
    pub join_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ca_ms: 10_000,
            signer_ms: 30_000,
            orderer_ms: 30_000,
            health_ms: 60_000,
            poll_interval_ms: 500,
            join_ms: 30_000,
        }
    }
}

impl Timeouts {
    /// CA call bound.
    pub fn ca(&self) -> Duration {
        Duration::from_millis(self.ca_ms)
    }

    /// Signer dispatch bound.
    pub fn signer(&self) -> Duration {
        Duration::from_millis(self.signer_ms)
    }

    /// Ordering call bound.
    pub fn orderer(&self) -> Duration {
        Duration::from_millis(self.orderer_ms)
    }

    /// Health polling bound.
    pub fn health(&self) -> Duration {
        Duration::from_millis(self.health_ms)
    }

    /// Probe interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Join bound.
    pub fn join(&self) -> Duration {
        Duration::from_millis(self.join_ms)
    }
}

/// CA gateway of one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaEndpoint {
    /// Base URL of the CA gateway.
    pub url: String,
    /// CA name, when the server hosts several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_name: Option<String>,
    /// Bootstrap registrar id.
    #[serde(default = "default_registrar")]
    pub registrar: String,
    /// Bootstrap registrar secret.
    #[serde(default = "default_registrar_secret")]
    pub registrar_secret: String,
}

fn default_registrar() -> String {
    "admin".into()
}

fn default_registrar_secret() -> String {
    "adminpw".into()
}

/// Administrator key held on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerKey {
    /// MSP id the signer acts for.
    pub msp_id: String,
    /// Key spec: `ed25519://<seed>` or a key file path.
    pub key: String,
}

/// Which codec translates configuration blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodecSelection {
    /// Blocks carry canonical JSON.
    #[default]
    Json,
    /// An external translator program.
    Command {
        /// Program path.
        program: PathBuf,
    },
}

/// Complete operator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardConfig {
    /// Domain suffix of every host name.
    pub domain: String,
    /// Channel changes apply to unless a request names another.
    pub channel: String,
    /// Root of the trust-store bundles.
    pub trust_root: PathBuf,
    /// Wallet directory.
    pub wallet_dir: PathBuf,
    /// Request record directory.
    pub request_dir: PathBuf,
    /// Collaborator timeouts.
    pub timeouts: Timeouts,
    /// Peer image.
    pub node_image: String,
    /// Container network.
    pub docker_network: String,
    /// Host directory with the peer core config.
    pub peer_config_dir: String,
    /// Docker binary.
    pub docker: PathBuf,
    /// Required-signer policy.
    pub quorum: QuorumPolicy,
    /// CA gateways keyed by organization name.
    pub certificate_authorities: BTreeMap<String, CaEndpoint>,
    /// Ordering gateway URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderer_url: Option<String>,
    /// Local administrator keys keyed by signer id (`org1-admin`).
    pub signers: BTreeMap<String, SignerKey>,
    /// Codec selection.
    pub codec: CodecSelection,
}

impl Default for OnboardConfig {
    fn default() -> Self {
        let deployment = DeploymentSettings::default();
        Self {
            domain: deployment.domain,
            channel: "mychannel".into(),
            trust_root: PathBuf::from("organizations"),
            wallet_dir: PathBuf::from("wallet"),
            request_dir: PathBuf::from("requests"),
            timeouts: Timeouts::default(),
            node_image: deployment.image,
            docker_network: deployment.network,
            peer_config_dir: deployment.peer_config_dir,
            docker: PathBuf::from("docker"),
            quorum: QuorumPolicy::default(),
            certificate_authorities: BTreeMap::new(),
            orderer_url: None,
            signers: BTreeMap::new(),
            codec: CodecSelection::default(),
        }
    }
}

impl OnboardConfig {
    /// Reads `path` (defaults when absent), applies `ONBOARD_*` overrides and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, slot: &mut u64| -> Result<(), ConfigError> {
            if let Some(value) = lookup(key) {
                *slot = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid(format!("{key}={value} is not a number")))?;
            }
            Ok(())
        };
        millis("ONBOARD_CA_TIMEOUT_MS", &mut self.timeouts.ca_ms)?;
        millis("ONBOARD_SIGNER_TIMEOUT_MS", &mut self.timeouts.signer_ms)?;
        millis("ONBOARD_ORDERER_TIMEOUT_MS", &mut self.timeouts.orderer_ms)?;
        millis("ONBOARD_HEALTH_TIMEOUT_MS", &mut self.timeouts.health_ms)?;
        millis("ONBOARD_POLL_INTERVAL_MS", &mut self.timeouts.poll_interval_ms)?;
        millis("ONBOARD_JOIN_TIMEOUT_MS", &mut self.timeouts.join_ms)?;
        if let Some(value) = lookup("ONBOARD_DOMAIN") {
            self.domain = value;
        }
        if let Some(value) = lookup("ONBOARD_CHANNEL") {
            self.channel = value;
        }
        if let Some(value) = lookup("ONBOARD_TRUST_ROOT") {
            self.trust_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("ONBOARD_WALLET_DIR") {
            self.wallet_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("ONBOARD_REQUEST_DIR") {
            self.request_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("ONBOARD_ORDERER_URL") {
            self.orderer_url = Some(value).filter(|url| !url.is_empty());
        }
        if let Some(value) = lookup("ONBOARD_NODE_IMAGE") {
            self.node_image = value;
        }
        if let Some(value) = lookup("ONBOARD_DOCKER_NETWORK") {
            self.docker_network = value;
        }
        Ok(())
    }

    /// Rejects empty names and zero timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain must not be empty".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(ConfigError::Invalid("channel must not be empty".into()));
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("ca_ms", t.ca_ms),
            ("signer_ms", t.signer_ms),
            ("orderer_ms", t.orderer_ms),
            ("health_ms", t.health_ms),
            ("poll_interval_ms", t.poll_interval_ms),
            ("join_ms", t.join_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("timeout {name} must be positive")));
            }
        }
        if let QuorumPolicy::Explicit { signers } = &self.quorum {
            if signers.is_empty() {
                return Err(ConfigError::Invalid("explicit quorum names no signers".into()));
            }
        }
        Ok(())
    }

    /// Deployment settings for node descriptors.
    pub fn deployment(&self) -> DeploymentSettings {
        DeploymentSettings {
            domain: self.domain.clone(),
            image: self.node_image.clone(),
            network: self.docker_network.clone(),
            peer_config_dir: self.peer_config_dir.clone(),
        }
    }

    /// Local signers built from [`Self::signers`].
    pub fn signer_directory(&self) -> Result<SignerDirectory, ConfigError> {
        let mut directory = SignerDirectory::new();
        for (id, signer) in &self.signers {
            let keys = load_or_derive_keypair(&Ed25519KeySource::from_spec(Some(&signer.key)))
                .map_err(|err| ConfigError::Invalid(format!("signer {id}: {err}")))?;
            directory.insert(Arc::new(LocalKeySigner::new(id, &signer.msp_id, keys)));
        }
        Ok(directory)
    }

    /// Codec implementation bounded by the orderer timeout.
    pub fn codec(&self) -> Arc<dyn ConfigCodec> {
        match &self.codec {
            CodecSelection::Json => Arc::new(JsonCodec),
            CodecSelection::Command { program } => {
                Arc::new(CommandCodec::new(program, self.timeouts.orderer()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn missing_file_yields_defaults() {
        let config = OnboardConfig::load(Some(Path::new("/nonexistent/onboard.json"))).unwrap();
        assert_eq!(config.node_image, "hyperledger/fabric-peer:latest");
        assert_eq!(config.quorum, QuorumPolicy::EachOrganization);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("onboard_config_{nanos}.json"));
        fs::write(
            &path,
            r#"{
                "domain": "consortium.test",
                "timeouts": { "signer_ms": 500 },
                "quorum": { "mode": "explicit", "signers": ["org1-admin"] },
                "certificate_authorities": { "org3": { "url": "https://ca.org3:7054" } }
            }"#,
        )
        .unwrap();
        let config = OnboardConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.domain, "consortium.test");
        assert_eq!(config.timeouts.signer_ms, 500);
        assert_eq!(config.timeouts.ca_ms, Timeouts::default().ca_ms);
        assert_eq!(config.certificate_authorities["org3"].registrar, "admin");
        assert_eq!(config.deployment().domain, "consortium.test");
    }

    #[test]
    fn overrides_replace_values_and_reject_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ONBOARD_SIGNER_TIMEOUT_MS", "250"),
            ("ONBOARD_ORDERER_URL", "http://orderer:8080"),
        ]);
        let mut config = OnboardConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.timeouts.signer(), Duration::from_millis(250));
        assert_eq!(config.orderer_url.as_deref(), Some("http://orderer:8080"));

        let err = config
            .apply_overrides(|key| (key == "ONBOARD_CA_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let mut config = OnboardConfig::default();
        config.timeouts.health_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn seeded_signers_load() {
        let mut config = OnboardConfig::default();
        config.signers.insert(
            "org1-admin".into(),
            SignerKey {
                msp_id: "Org1MSP".into(),
                key: "ed25519://org1-admin".into(),
            },
        );
        let directory = config.signer_directory().unwrap();
        assert!(directory.get("org1-admin").is_some());
    }
}
