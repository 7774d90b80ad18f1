//! Configuration Delta Engine: turns a structural change into an unsigned
//! update against a freshly fetched snapshot.

use crate::channel::{ChannelConfig, ConfigSnapshot, OrganizationEntry};
use crate::collab::{ConfigCodec, OrdererFailure, OrderingService};
use crate::error::{CodecError, DeltaError, DuplicateParticipantError};
use crate::model::{now_millis, Endpoint};
use crate::policy::validate_org_policies;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Domain tag prefixed to every signing payload.
pub const UPDATE_SIGNING_DOMAIN: &str = "onboard.config-update.v1";

/// Structural change applied to the channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ConfigChange {
    /// Adds a new member organization.
    AddOrganization(OrganizationEntry),
    /// Announces a node endpoint as an anchor of an existing member.
    AddNodeEndpoint {
        /// MSP id of the owning organization.
        msp_id: String,
        /// Endpoint to announce.
        endpoint: Endpoint,
    },
}

impl ConfigChange {
    /// Short human-readable description.
    pub fn summary(&self) -> String {
        match self {
            Self::AddOrganization(entry) => {
                format!("add organization {} ({})", entry.name, entry.msp_id)
            }
            Self::AddNodeEndpoint { msp_id, endpoint } => {
                format!("announce {endpoint} for {msp_id}")
            }
        }
    }
}

/// Codec-produced update bytes plus the channel metadata signers commit to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedUpdate {
    /// Target channel.
    pub channel: String,
    /// Version of the snapshot the delta was computed against.
    pub base_version: u64,
    /// Version the channel reaches once the update commits.
    pub target_version: u64,
    /// Update bytes returned by the codec.
    #[serde(with = "crate::channel::b64")]
    pub update_bytes: Vec<u8>,
    /// Hex SHA-256 over channel, base version and update bytes.
    pub digest: String,
    /// Description of the change.
    pub summary: String,
    /// Creation time (ms).
    pub created_ms: u64,
}

impl UnsignedUpdate {
    /// Wraps codec output for `channel` at `base_version`.
    pub fn new(
        channel: impl Into<String>,
        base_version: u64,
        update_bytes: Vec<u8>,
        summary: impl Into<String>,
    ) -> Self {
        let channel = channel.into();
        let digest = update_digest(&channel, base_version, &update_bytes);
        Self {
            channel,
            base_version,
            target_version: base_version + 1,
            update_bytes,
            digest,
            summary: summary.into(),
            created_ms: now_millis(),
        }
    }

    /// Bytes every signer signs.
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(
            &self.channel,
            self.base_version,
            self.target_version,
            &self.digest,
        )
    }
}

/// Domain-separated bytes signed for an update.
pub fn signing_payload(channel: &str, base_version: u64, target_version: u64, digest: &str) -> Vec<u8> {
    format!("{UPDATE_SIGNING_DOMAIN}|{channel}|{base_version}|{target_version}|{digest}").into_bytes()
}

/// Digest binding update bytes to their channel and base version.
pub fn update_digest(channel: &str, base_version: u64, update_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_bytes());
    hasher.update(b"|");
    hasher.update(base_version.to_be_bytes());
    hasher.update(b"|");
    hasher.update(update_bytes);
    hex::encode(hasher.finalize())
}

/// Everything produced while proposing a change.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Snapshot the change was applied to.
    pub snapshot: ConfigSnapshot,
    /// Config with the change applied.
    pub proposed: ChannelConfig,
    /// Artifact handed to the quorum stage.
    pub unsigned: UnsignedUpdate,
}

/// Fetches, validates, applies and diffs configuration changes.
pub struct DeltaEngine {
    orderer: Arc<dyn OrderingService>,
    codec: Arc<dyn ConfigCodec>,
    timeout: Duration,
}

impl DeltaEngine {
    /// Engine over the given collaborators; `timeout` bounds the fetch.
    pub fn new(
        orderer: Arc<dyn OrderingService>,
        codec: Arc<dyn ConfigCodec>,
        timeout: Duration,
    ) -> Self {
        Self {
            orderer,
            codec,
            timeout,
        }
    }

    /// Fetches and decodes the current configuration of `channel`.
    pub async fn snapshot(&self, channel: &str) -> Result<ConfigSnapshot, DeltaError> {
        let block = time::timeout(self.timeout, self.orderer.fetch_config(channel))
            .await
            .map_err(|_| {
                DeltaError::Unavailable(format!(
                    "fetching {channel} timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|err| match err {
                OrdererFailure::Unavailable(reason) => DeltaError::Unavailable(reason),
                other => DeltaError::InvalidChange(format!("fetching {channel}: {other}")),
            })?;
        let config = self.codec.decode(&block.data).await?;
        if config.channel != channel || block.channel != channel {
            return Err(CodecError::Decode(format!(
                "requested {channel}, received block for {} decoding as {}",
                block.channel, config.channel
            ))
            .into());
        }
        debug!(evt = "snapshot", channel, version = block.version);
        Ok(ConfigSnapshot { block, config })
    }

    /// Produces the unsigned update for `change` on `channel`.
    pub async fn propose_change(
        &self,
        channel: &str,
        change: &ConfigChange,
    ) -> Result<UnsignedUpdate, DeltaError> {
        Ok(self.propose(channel, change).await?.unsigned)
    }

    /// Like [`Self::propose_change`], also returning the snapshot and proposed config.
    pub async fn propose(
        &self,
        channel: &str,
        change: &ConfigChange,
    ) -> Result<Proposal, DeltaError> {
        let snapshot = self.snapshot(channel).await?;
        let proposed = apply_change(&snapshot.config, change).map_err(|err| {
            warn!(evt = "change_rejected", channel, error = %err);
            err
        })?;
        let proposed_bytes = self.codec.encode(&proposed).await?;
        let update_bytes = self
            .codec
            .diff(&snapshot.block.data, &proposed_bytes)
            .await?;
        if update_bytes.is_empty() {
            return Err(DeltaError::EmptyUpdate);
        }
        let unsigned =
            UnsignedUpdate::new(channel, snapshot.version(), update_bytes, change.summary());
        info!(
            evt = "delta_computed",
            channel,
            base = unsigned.base_version,
            digest = %unsigned.digest,
            change = %unsigned.summary
        );
        Ok(Proposal {
            snapshot,
            proposed,
            unsigned,
        })
    }
}

/// Applies `change` to a copy of `config` after validating it.
pub fn apply_change(
    config: &ChannelConfig,
    change: &ConfigChange,
) -> Result<ChannelConfig, DeltaError> {
    let mut proposed = config.clone();
    match change {
        ConfigChange::AddOrganization(entry) => {
            check_name("organization name", &entry.name)?;
            check_name("MSP id", &entry.msp_id)?;
            if config.organizations.contains_key(&entry.msp_id) {
                return Err(duplicate(&entry.msp_id, config));
            }
            if config.organization_named(&entry.name).is_some() {
                return Err(duplicate(&entry.name, config));
            }
            if entry.root_certs.iter().all(|cert| cert.trim().is_empty()) {
                return Err(DeltaError::InvalidChange(format!(
                    "{} has no root certificate",
                    entry.msp_id
                )));
            }
            validate_org_policies(&entry.policies, &entry.msp_id).map_err(|(policy, err)| {
                DeltaError::InvalidPolicy {
                    policy: policy.to_string(),
                    reason: err.to_string(),
                }
            })?;
            proposed
                .organizations
                .insert(entry.msp_id.clone(), entry.clone());
        }
        ConfigChange::AddNodeEndpoint { msp_id, endpoint } => {
            check_name("endpoint host", &endpoint.host)?;
            if endpoint.port == 0 {
                return Err(DeltaError::InvalidChange(format!("{endpoint} has no port")));
            }
            let org = proposed
                .organizations
                .get_mut(msp_id)
                .ok_or_else(|| DeltaError::UnknownOrganization(msp_id.clone()))?;
            if org.anchor_peers.contains(endpoint) {
                return Err(duplicate(&endpoint.to_string(), config));
            }
            org.anchor_peers.push(endpoint.clone());
        }
    }
    Ok(proposed)
}

fn duplicate(participant: &str, config: &ChannelConfig) -> DeltaError {
    DuplicateParticipantError {
        participant: participant.to_string(),
        channel: config.channel.clone(),
    }
    .into()
}

fn check_name(what: &str, value: &str) -> Result<(), DeltaError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(DeltaError::InvalidChange(format!("{what} {value:?} is not valid")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fixtures::{org, two_org_channel};
    use crate::channel::{ConfigBlock, ConfigUpdate};
    use crate::codec::JsonCodec;
    use crate::error::{FailureKind, StepError};
    use crate::node::NodeHandle;
    use crate::sim::SimNetwork;
    use crate::submit::{CommitEnvelope, CommitResult};
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct FixedOrderer(ChannelConfig);

    #[async_trait]
    impl OrderingService for FixedOrderer {
        async fn fetch_config(&self, channel: &str) -> Result<ConfigBlock, OrdererFailure> {
            if channel != self.0.channel {
                return Err(OrdererFailure::Rejected(format!("unknown channel {channel}")));
            }
            Ok(ConfigBlock {
                channel: channel.to_string(),
                version: self.0.sequence,
                data: serde_json::to_vec(&self.0).unwrap(),
                last_update: None,
            })
        }

        async fn submit_update(
            &self,
            _envelope: &CommitEnvelope,
        ) -> Result<CommitResult, OrdererFailure> {
            Err(OrdererFailure::Unavailable("read-only".into()))
        }

        async fn join_channel(
            &self,
            _node: &NodeHandle,
            _channel: &str,
            _block: &ConfigBlock,
        ) -> Result<(), OrdererFailure> {
            Err(OrdererFailure::Unavailable("read-only".into()))
        }
    }

    fn engine(config: ChannelConfig) -> DeltaEngine {
        DeltaEngine::new(
            Arc::new(FixedOrderer(config)),
            Arc::new(JsonCodec),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn proposes_update_with_channel_metadata() {
        let base = two_org_channel();
        let change = ConfigChange::AddOrganization(org("org3", "Org3MSP"));
        let unsigned = engine(base.clone())
            .propose_change("mychannel", &change)
            .await
            .unwrap();
        assert_eq!(unsigned.channel, "mychannel");
        assert_eq!(unsigned.base_version, 3);
        assert_eq!(unsigned.target_version, 4);
        assert_eq!(
            unsigned.digest,
            update_digest("mychannel", 3, &unsigned.update_bytes)
        );
        let update = JsonCodec::decode_update(&unsigned.update_bytes).unwrap();
        assert_eq!(update.added.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_organization_is_rejected_before_diff() {
        let change = ConfigChange::AddOrganization(org("org2", "Org2MSP"));
        let err = engine(two_org_channel())
            .propose_change("mychannel", &change)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::Duplicate(_)));
    }

    #[tokio::test]
    async fn unknown_channel_is_not_retriable() {
        let change = ConfigChange::AddOrganization(org("org3", "Org3MSP"));
        let err = engine(two_org_channel())
            .propose_change("otherchannel", &change)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidChange(_)), "{err:?}");
        let step = StepError::from(err);
        assert_eq!(step.kind(), FailureKind::InvalidChange);
        assert!(!step.is_retriable());
    }

    #[tokio::test]
    async fn unreachable_orderer_is_retriable() {
        let change = ConfigChange::AddOrganization(org("org3", "Org3MSP"));
        let net = SimNetwork::bootstrap("example.com", "mychannel", &["org1", "org2"]);
        net.orderer.set_available(false);
        let engine = DeltaEngine::new(
            net.orderer.clone(),
            Arc::new(JsonCodec),
            Duration::from_secs(1),
        );
        let err = engine.propose_change("mychannel", &change).await.unwrap_err();
        assert!(matches!(err, DeltaError::Unavailable(_)), "{err:?}");
        assert!(StepError::from(err).is_retriable());
    }

    #[test]
    fn renamed_msp_with_taken_name_is_duplicate() {
        let change = ConfigChange::AddOrganization(org("org1", "Org9MSP"));
        let err = apply_change(&two_org_channel(), &change).unwrap_err();
        assert_eq!(
            err,
            DeltaError::Duplicate(DuplicateParticipantError {
                participant: "org1".into(),
                channel: "mychannel".into(),
            })
        );
    }

    #[test]
    fn malformed_policy_names_the_rule() {
        let mut entry = org("org3", "Org3MSP");
        entry.policies.endorsement = "OR('Org3MSP.peer'".into();
        let err = apply_change(&two_org_channel(), &ConfigChange::AddOrganization(entry))
            .unwrap_err();
        match err {
            DeltaError::InvalidPolicy { policy, .. } => assert_eq!(policy, "Endorsement"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_root_certificate_is_invalid() {
        let mut entry = org("org3", "Org3MSP");
        entry.root_certs.clear();
        let err = apply_change(&two_org_channel(), &ConfigChange::AddOrganization(entry))
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidChange(_)));
    }

    #[test]
    fn endpoint_announcement_appends_anchor_once() {
        let change = ConfigChange::AddNodeEndpoint {
            msp_id: "Org1MSP".into(),
            endpoint: Endpoint::new("peer1.org1.example.com", 8051),
        };
        let once = apply_change(&two_org_channel(), &change).unwrap();
        assert_eq!(once.organizations["Org1MSP"].anchor_peers.len(), 1);
        assert!(matches!(
            apply_change(&once, &change),
            Err(DeltaError::Duplicate(_))
        ));

        let unknown = ConfigChange::AddNodeEndpoint {
            msp_id: "Org7MSP".into(),
            endpoint: Endpoint::new("peer0.org7.example.com", 7051),
        };
        assert_eq!(
            apply_change(&two_org_channel(), &unknown),
            Err(DeltaError::UnknownOrganization("Org7MSP".into()))
        );
    }

    proptest! {
        #[test]
        fn committed_config_keeps_prior_entries(
            names in proptest::collection::btree_set("[a-z]{3,8}", 1..6),
            new_name in "[a-z]{3,8}",
        ) {
            prop_assume!(!names.contains(&new_name));
            let mut config = ChannelConfig::new("mychannel");
            config.sequence = 7;
            for name in &names {
                let msp = format!("{name}MSP");
                config.organizations.insert(msp.clone(), org(name, &msp));
            }
            let new_msp = format!("{new_name}MSP");
            let entry = org(&new_name, &new_msp);
            let proposed = apply_change(&config, &ConfigChange::AddOrganization(entry.clone())).unwrap();
            let committed = ConfigUpdate::between(&config, &proposed).apply_to(&config).unwrap();

            prop_assert_eq!(committed.organizations.len(), config.organizations.len() + 1);
            for (msp, prior) in &config.organizations {
                prop_assert_eq!(committed.organizations.get(msp), Some(prior));
            }
            prop_assert_eq!(committed.organizations.get(&new_msp), Some(&entry));
            prop_assert_eq!(committed.sequence, config.sequence + 1);
        }
    }
}
