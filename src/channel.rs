//! Structured view of a channel's shared configuration document.
//!
//! [`ChannelConfig`] is what the codec decodes the configuration block into;
//! [`ConfigUpdate`] is the minimal structural delta between two configs.

use crate::model::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signature rules governing one organization's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgPolicies {
    /// Who may read channel data.
    pub readers: String,
    /// Who may submit transactions.
    pub writers: String,
    /// Who may administer the organization's configuration.
    pub admins: String,
    /// Who may endorse on behalf of the organization.
    pub endorsement: String,
}

impl OrgPolicies {
    /// Default policy set issued for a freshly added organization.
    pub fn standard(msp_id: &str) -> Self {
        Self {
            readers: format!("OR('{msp_id}.admin', '{msp_id}.peer', '{msp_id}.client')"),
            writers: format!("OR('{msp_id}.admin', '{msp_id}.client')"),
            admins: format!("OR('{msp_id}.admin')"),
            endorsement: format!("OR('{msp_id}.peer')"),
        }
    }

    /// Named rules in a stable order.
    pub fn named(&self) -> [(&'static str, &str); 4] {
        [
            ("Readers", self.readers.as_str()),
            ("Writers", self.writers.as_str()),
            ("Admins", self.admins.as_str()),
            ("Endorsement", self.endorsement.as_str()),
        ]
    }
}

/// Member organization entry inside the application group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationEntry {
    /// Short organization name (`org3`).
    pub name: String,
    /// MSP id (`Org3MSP`).
    pub msp_id: String,
    /// Root CA certificates (PEM).
    pub root_certs: Vec<String>,
    /// TLS root CA certificates (PEM).
    #[serde(default)]
    pub tls_root_certs: Vec<String>,
    /// Resource policies.
    pub policies: OrgPolicies,
    /// Gossip anchor endpoints.
    #[serde(default)]
    pub anchor_peers: Vec<Endpoint>,
}

/// Decoded channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name.
    pub channel: String,
    /// Configuration sequence; bumped by every committed update.
    pub sequence: u64,
    /// Application organizations keyed by MSP id.
    pub organizations: BTreeMap<String, OrganizationEntry>,
    /// Ordering service endpoints.
    #[serde(default)]
    pub orderer_endpoints: Vec<Endpoint>,
}

impl ChannelConfig {
    /// Empty configuration at sequence zero.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sequence: 0,
            organizations: BTreeMap::new(),
            orderer_endpoints: Vec::new(),
        }
    }

    /// Looks an organization up by its short name.
    pub fn organization_named(&self, name: &str) -> Option<&OrganizationEntry> {
        self.organizations.values().find(|org| org.name == name)
    }
}

/// Raw configuration block as served by the ordering collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBlock {
    /// Channel the block belongs to.
    pub channel: String,
    /// Configuration version (equals the config sequence).
    pub version: u64,
    /// Codec-encoded configuration bytes.
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Digest of the update that produced this version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// A configuration block together with its decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Block as fetched.
    pub block: ConfigBlock,
    /// Decoded configuration.
    pub config: ChannelConfig,
}

impl ConfigSnapshot {
    /// Version the snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.block.version
    }
}

/// Minimal structural delta between two channel configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// Channel the update targets.
    pub channel: String,
    /// Sequence of the configuration the delta was computed against.
    pub base_sequence: u64,
    /// Organizations present only in the proposed config.
    #[serde(default)]
    pub added: BTreeMap<String, OrganizationEntry>,
    /// Organizations whose entry changed.
    #[serde(default)]
    pub modified: BTreeMap<String, OrganizationEntry>,
    /// Organizations present only in the original config.
    #[serde(default)]
    pub removed: Vec<String>,
    /// Replacement orderer endpoint list, when it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orderer_endpoints: Option<Vec<Endpoint>>,
}

impl ConfigUpdate {
    /// Computes the delta turning `original` into `proposed`.
    pub fn between(original: &ChannelConfig, proposed: &ChannelConfig) -> Self {
        let mut added = BTreeMap::new();
        let mut modified = BTreeMap::new();
        for (msp_id, entry) in &proposed.organizations {
            match original.organizations.get(msp_id) {
                None => {
                    added.insert(msp_id.clone(), entry.clone());
                }
                Some(previous) if previous != entry => {
                    modified.insert(msp_id.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }
        let removed = original
            .organizations
            .keys()
            .filter(|msp_id| !proposed.organizations.contains_key(*msp_id))
            .cloned()
            .collect();
        let orderer_endpoints = (original.orderer_endpoints != proposed.orderer_endpoints)
            .then(|| proposed.orderer_endpoints.clone());
        Self {
            channel: proposed.channel.clone(),
            base_sequence: original.sequence,
            added,
            modified,
            removed,
            orderer_endpoints,
        }
    }

    /// True when the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.orderer_endpoints.is_none()
    }

    /// Applies the delta to `config`, producing the next sequence.
    pub fn apply_to(&self, config: &ChannelConfig) -> Result<ChannelConfig, String> {
        if config.channel != self.channel {
            return Err(format!(
                "update targets channel {}, config is {}",
                self.channel, config.channel
            ));
        }
        if config.sequence != self.base_sequence {
            return Err(format!(
                "update based on sequence {}, config is at {}",
                self.base_sequence, config.sequence
            ));
        }
        let mut next = config.clone();
        for (msp_id, entry) in &self.added {
            if next.organizations.contains_key(msp_id) {
                return Err(format!("organization {msp_id} already present"));
            }
            next.organizations.insert(msp_id.clone(), entry.clone());
        }
        for (msp_id, entry) in &self.modified {
            match next.organizations.get_mut(msp_id) {
                Some(slot) => *slot = entry.clone(),
                None => return Err(format!("organization {msp_id} not present")),
            }
        }
        for msp_id in &self.removed {
            next.organizations.remove(msp_id);
        }
        if let Some(endpoints) = &self.orderer_endpoints {
            next.orderer_endpoints = endpoints.clone();
        }
        next.sequence += 1;
        Ok(next)
    }
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn delta_contains_only_the_added_organization() {
        let original = two_org_channel();
        let mut proposed = original.clone();
        proposed
            .organizations
            .insert("Org3MSP".into(), org("org3", "Org3MSP"));
        let update = ConfigUpdate::between(&original, &proposed);
        assert_eq!(update.added.len(), 1);
        assert!(update.modified.is_empty());
        assert!(update.removed.is_empty());
        assert!(update.orderer_endpoints.is_none());

        let next = update.apply_to(&original).unwrap();
        assert_eq!(next.sequence, original.sequence + 1);
        assert_eq!(next.organizations.len(), 3);
        assert_eq!(next.organizations["Org1MSP"], original.organizations["Org1MSP"]);
    }

    #[test]
    fn apply_rejects_stale_base() {
        let original = two_org_channel();
        let mut proposed = original.clone();
        proposed
            .organizations
            .insert("Org3MSP".into(), org("org3", "Org3MSP"));
        let update = ConfigUpdate::between(&original, &proposed);
        let mut advanced = original.clone();
        advanced.sequence += 1;
        assert!(update.apply_to(&advanced).is_err());
    }

    #[test]
    fn identical_configs_yield_empty_update() {
        let config = two_org_channel();
        assert!(ConfigUpdate::between(&config, &config).is_empty());
    }
}
