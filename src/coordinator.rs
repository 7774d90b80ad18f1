//! Membership Change Coordinator.
//!
//! Drives one request through the pipeline and records every transition:
//!
//! ```text
//! Draft -> CredentialsProvisioned -> TrustMaterialized -> DeltaComputed
//!       -> QuorumSatisfied -> Submitted -> Committed -> NodeJoined
//! ```
//!
//! Any step may end the attempt in `Failed { step, kind, detail }`. Nothing is
//! rolled back; [`MembershipCoordinator::retry`] opens a new attempt from
//! `Draft` and every step tolerates work a previous attempt already did.
//!
//! `Submitted` is entered before the ordering service answers, once the
//! signed update is stored in the record. A retry first settles that stored
//! update, so a commit whose acknowledgement was lost is recognized instead
//! of being proposed again.

use crate::channel::{OrgPolicies, OrganizationEntry};
use crate::collab::{CaRoots, ConfigCodec, ContainerRuntime, OrderingService};
use crate::config::OnboardConfig;
use crate::delta::{ConfigChange, DeltaEngine};
use crate::error::{CredentialError, DeltaError, FailureKind, StepError, SubmissionError};
use crate::model::{now_millis, Endpoint, Identity, NetworkRole, Participant, RequestId};
use crate::node::{NodeHandle, NodeLifecycleManager, NodeSpec};
use crate::policy::QuorumPolicy;
use crate::provision::{CaDirectory, EnrollmentSpec, Provisioner};
use crate::quorum::{QuorumCoordinator, SignedUpdate, SignerDirectory};
use crate::store::{RequestStore, StoreError};
use crate::submit::{CommitResult, SubmissionManager};
use crate::trust::{TrustBundle, TrustMaterialBuilder};
use crate::wallet::Wallet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Registration and enrollment.
    CredentialProvisioning,
    /// Trust-store layout.
    TrustMaterial,
    /// Snapshot fetch, change validation and diff.
    DeltaComputation,
    /// Signature collection.
    QuorumSigning,
    /// Commit of the signed update.
    Submission,
    /// Node launch and health polling.
    NodeBootstrap,
    /// Channel join.
    ChannelJoin,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CredentialProvisioning => "CredentialProvisioning",
            Self::TrustMaterial => "TrustMaterial",
            Self::DeltaComputation => "DeltaComputation",
            Self::QuorumSigning => "QuorumSigning",
            Self::Submission => "Submission",
            Self::NodeBootstrap => "NodeBootstrap",
            Self::ChannelJoin => "ChannelJoin",
        };
        f.write_str(name)
    }
}

/// State of a membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChangeState {
    /// Accepted, nothing done yet.
    Draft,
    /// Identities issued.
    CredentialsProvisioned,
    /// Trust bundles written.
    TrustMaterialized,
    /// Unsigned update computed.
    DeltaComputed,
    /// Every required signature collected.
    QuorumSatisfied,
    /// Signed update stored and handed to the ordering service; its fate is
    /// known only at `Committed` or `Failed`.
    Submitted,
    /// Update committed.
    Committed,
    /// Node launched and joined.
    NodeJoined,
    /// The attempt stopped at `step`.
    Failed {
        /// Failing step.
        step: Step,
        /// Classification.
        kind: FailureKind,
        /// Underlying cause.
        detail: String,
        /// Whether a retry can succeed as is.
        retriable: bool,
    },
}

impl ChangeState {
    fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::CredentialsProvisioned => 1,
            Self::TrustMaterialized => 2,
            Self::DeltaComputed => 3,
            Self::QuorumSatisfied => 4,
            Self::Submitted => 5,
            Self::Committed => 6,
            Self::NodeJoined => 7,
            Self::Failed { .. } => 8,
        }
    }

    /// Short name for logs and status output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::CredentialsProvisioned => "CredentialsProvisioned",
            Self::TrustMaterialized => "TrustMaterialized",
            Self::DeltaComputed => "DeltaComputed",
            Self::QuorumSatisfied => "QuorumSatisfied",
            Self::Submitted => "Submitted",
            Self::Committed => "Committed",
            Self::NodeJoined => "NodeJoined",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { step, detail, .. } => write!(f, "Failed({step}: {detail})"),
            other => f.write_str(other.name()),
        }
    }
}

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnboardingRequest {
    /// Admit a new organization into `channel`.
    AddOrganization {
        /// Organization name (`org3`).
        organization: String,
        /// MSP id (`Org3MSP`).
        msp_id: String,
        /// Target channel.
        channel: String,
        /// Administrator enrollment.
        admin: EnrollmentSpec,
        /// Optional client identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<EnrollmentSpec>,
        /// Custom policies; the standard set when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policies: Option<OrgPolicies>,
        /// Anchor endpoints declared with the organization.
        #[serde(default)]
        anchor_peers: Vec<Endpoint>,
        /// First node, launched once the organization is committed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_node: Option<NodeSpec>,
    },
    /// Add a node to an organization that is already a member.
    AddNode {
        /// Node to bring up.
        node: NodeSpec,
        /// Channel to join.
        channel: String,
        /// Node enrollment.
        enrollment: EnrollmentSpec,
        /// Also announce the node as an anchor of its organization.
        #[serde(default)]
        announce_anchor: bool,
    },
}

impl OnboardingRequest {
    /// Participant the request admits.
    pub fn participant(&self) -> Participant {
        match self {
            Self::AddOrganization {
                organization,
                msp_id,
                ..
            } => Participant::organization(organization, msp_id),
            Self::AddNode { node, .. } => node.participant(),
        }
    }

    /// Channel the request targets.
    pub fn channel(&self) -> &str {
        match self {
            Self::AddOrganization { channel, .. } | Self::AddNode { channel, .. } => channel,
        }
    }

    /// Node the request ends up launching, if any.
    pub fn node(&self) -> Option<&NodeSpec> {
        match self {
            Self::AddOrganization { initial_node, .. } => initial_node.as_ref(),
            Self::AddNode { node, .. } => Some(node),
        }
    }

    fn changes_config(&self) -> bool {
        match self {
            Self::AddOrganization { .. } => true,
            Self::AddNode {
                announce_anchor, ..
            } => *announce_anchor,
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.channel().is_empty() {
            return Err("channel must not be empty".into());
        }
        match self {
            Self::AddOrganization {
                organization,
                msp_id,
                initial_node,
                ..
            } => {
                if organization.is_empty() || msp_id.is_empty() {
                    return Err("organization and MSP id are required".into());
                }
                if let Some(node) = initial_node {
                    if node.organization != *organization || node.msp_id != *msp_id {
                        return Err(format!(
                            "initial node {} belongs to {}/{}",
                            node.name, node.organization, node.msp_id
                        ));
                    }
                }
                Ok(())
            }
            Self::AddNode { node, .. } => {
                if node.name.is_empty() || node.organization.is_empty() {
                    return Err("node name and organization are required".into());
                }
                Ok(())
            }
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State entered.
    #[serde(flatten)]
    pub state: ChangeState,
    /// Attempt number the transition belongs to.
    pub attempt: u32,
    /// Time entered (ms).
    pub at_ms: u64,
}

/// Tracked unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChangeRequest {
    /// Request id.
    pub id: RequestId,
    /// Participant being admitted.
    pub participant: Participant,
    /// Original request.
    pub request: OnboardingRequest,
    /// Current state.
    pub state: ChangeState,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// Every transition across all attempts.
    pub history: Vec<Transition>,
    /// Bundle directories written.
    #[serde(default)]
    pub bundles: Vec<PathBuf>,
    /// Signed update submitted but not yet known to be committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed: Option<SignedUpdate>,
    /// Result of the committed update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitResult>,
    /// Handle of the launched node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeHandle>,
}

impl MembershipChangeRequest {
    /// New record in `Draft`.
    pub fn new(id: RequestId, request: OnboardingRequest) -> Self {
        let mut record = Self {
            id,
            participant: request.participant(),
            request,
            state: ChangeState::Draft,
            attempt: 1,
            history: Vec::new(),
            bundles: Vec::new(),
            signed: None,
            commit: None,
            node: None,
        };
        record.push(ChangeState::Draft);
        record
    }

    /// Moves forward to `state`; backward moves are ignored.
    pub fn advance(&mut self, state: ChangeState) -> bool {
        if state.rank() <= self.state.rank() {
            return false;
        }
        self.push(state);
        true
    }

    fn push(&mut self, state: ChangeState) {
        self.history.push(Transition {
            state: state.clone(),
            attempt: self.attempt,
            at_ms: now_millis(),
        });
        self.state = state;
    }

    fn restart(&mut self) {
        self.attempt += 1;
        self.push(ChangeState::Draft);
    }

    /// Whether the request reached its terminal success state.
    pub fn is_complete(&self) -> bool {
        match self.state {
            ChangeState::NodeJoined => true,
            ChangeState::Committed => self.request.node().is_none(),
            _ => false,
        }
    }

    /// Whether the current attempt failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, ChangeState::Failed { .. })
    }
}

/// Coordinator failure outside of a pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// No record with this id.
    #[error("unknown request {0}")]
    UnknownRequest(String),
    /// A record with this id already exists.
    #[error("request {0} already exists")]
    DuplicateRequest(String),
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The record is not in a state the operation applies to.
    #[error("request {id} is {state}; {operation} does not apply")]
    NotRunnable {
        /// Request id.
        id: String,
        /// Current state name.
        state: String,
        /// Operation attempted.
        operation: &'static str,
    },
    /// Record persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Collaborators and stores the coordinator drives.
pub struct Collaborators {
    /// CA per organization.
    pub cas: CaDirectory,
    /// Ordering service.
    pub orderer: Arc<dyn OrderingService>,
    /// Configuration codec.
    pub codec: Arc<dyn ConfigCodec>,
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Signers of existing members.
    pub signers: SignerDirectory,
    /// Identity wallet.
    pub wallet: Arc<dyn Wallet>,
    /// Request records.
    pub store: Arc<dyn RequestStore>,
}

enum Halt {
    Step(Step, StepError),
    Store(StoreError),
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

trait AtStep<T> {
    fn at(self, step: Step) -> Result<T, Halt>;
}

impl<T, E: Into<StepError>> AtStep<T> for Result<T, E> {
    fn at(self, step: Step) -> Result<T, Halt> {
        self.map_err(|err| Halt::Step(step, err.into()))
    }
}

struct Issued {
    roots: CaRoots,
    org: Vec<Identity>,
    node: Option<Identity>,
}

/// Sequences the components for each request and persists its progress.
pub struct MembershipCoordinator {
    provisioner: Provisioner,
    trust: TrustMaterialBuilder,
    delta: DeltaEngine,
    quorum: QuorumCoordinator,
    policy: QuorumPolicy,
    submission: SubmissionManager,
    nodes: NodeLifecycleManager,
    store: Arc<dyn RequestStore>,
    domain: String,
}

impl MembershipCoordinator {
    /// Wires the components from `config` over `collab`.
    pub fn new(config: &OnboardConfig, collab: Collaborators) -> Self {
        let t = config.timeouts;
        Self {
            provisioner: Provisioner::new(collab.cas, collab.wallet, t.ca(), &config.domain),
            trust: TrustMaterialBuilder::new(&config.trust_root, &config.domain),
            delta: DeltaEngine::new(collab.orderer.clone(), collab.codec, t.orderer()),
            quorum: QuorumCoordinator::new(collab.signers, t.signer()),
            policy: config.quorum.clone(),
            submission: SubmissionManager::new(collab.orderer.clone(), t.orderer()),
            nodes: NodeLifecycleManager::new(collab.runtime, collab.orderer, config.deployment())
                .with_timeouts(t.health(), t.poll_interval(), t.join()),
            store: collab.store,
            domain: config.domain.clone(),
        }
    }

    /// Records a new request in `Draft` under a fresh id.
    pub async fn submit_request(
        &self,
        request: OnboardingRequest,
    ) -> Result<MembershipChangeRequest, CoordinatorError> {
        self.submit_request_as(RequestId::generate(), request).await
    }

    /// Records a new request in `Draft` under `id`.
    pub async fn submit_request_as(
        &self,
        id: RequestId,
        request: OnboardingRequest,
    ) -> Result<MembershipChangeRequest, CoordinatorError> {
        request.check().map_err(CoordinatorError::InvalidRequest)?;
        if self.store.load(&id)?.is_some() {
            return Err(CoordinatorError::DuplicateRequest(id.to_string()));
        }
        let record = MembershipChangeRequest::new(id, request);
        self.store.save(&record)?;
        info!(
            evt = "request_accepted",
            request = %record.id,
            participant = %record.participant,
            channel = record.request.channel()
        );
        Ok(record)
    }

    /// Runs a `Draft` request to success or to a recorded failure.
    pub async fn run(&self, id: &RequestId) -> Result<MembershipChangeRequest, CoordinatorError> {
        let mut record = self.load(id)?;
        if record.state != ChangeState::Draft {
            return Err(CoordinatorError::NotRunnable {
                id: id.to_string(),
                state: record.state.name().into(),
                operation: "run",
            });
        }
        match self.drive(&mut record).await {
            Ok(()) => {
                info!(evt = "request_complete", request = %record.id, state = record.state.name());
            }
            Err(Halt::Step(step, err)) => {
                warn!(
                    evt = "request_failed",
                    request = %record.id,
                    attempt = record.attempt,
                    %step,
                    error = %err
                );
                record.advance(ChangeState::Failed {
                    step,
                    kind: err.kind(),
                    detail: err.to_string(),
                    retriable: err.is_retriable(),
                });
                self.store.save(&record)?;
            }
            Err(Halt::Store(err)) => return Err(err.into()),
        }
        Ok(record)
    }

    /// Opens a new attempt for a failed or interrupted request and runs it.
    pub async fn retry(&self, id: &RequestId) -> Result<MembershipChangeRequest, CoordinatorError> {
        let mut record = self.load(id)?;
        if record.is_complete() || record.state == ChangeState::Draft {
            return Err(CoordinatorError::NotRunnable {
                id: id.to_string(),
                state: record.state.name().into(),
                operation: "retry",
            });
        }
        record.restart();
        self.store.save(&record)?;
        info!(evt = "request_retry", request = %record.id, attempt = record.attempt);
        self.run(id).await
    }

    /// Current record.
    pub async fn status(&self, id: &RequestId) -> Result<MembershipChangeRequest, CoordinatorError> {
        self.load(id)
    }

    /// Every stored record.
    pub async fn list(&self) -> Result<Vec<MembershipChangeRequest>, CoordinatorError> {
        let mut records = Vec::new();
        for id in self.store.ids()? {
            records.push(self.load(&id)?);
        }
        Ok(records)
    }

    /// Submits and runs a request in one call.
    pub async fn onboard(
        &self,
        request: OnboardingRequest,
    ) -> Result<MembershipChangeRequest, CoordinatorError> {
        let record = self.submit_request(request).await?;
        self.run(&record.id).await
    }

    fn load(&self, id: &RequestId) -> Result<MembershipChangeRequest, CoordinatorError> {
        self.store
            .load(id)?
            .ok_or_else(|| CoordinatorError::UnknownRequest(id.to_string()))
    }

    fn advance(
        &self,
        record: &mut MembershipChangeRequest,
        state: ChangeState,
    ) -> Result<(), StoreError> {
        if record.advance(state) {
            info!(
                evt = "transition",
                request = %record.id,
                attempt = record.attempt,
                state = record.state.name()
            );
            self.store.save(record)?;
        }
        Ok(())
    }

    async fn drive(&self, record: &mut MembershipChangeRequest) -> Result<(), Halt> {
        let issued = self
            .provision(record)
            .await
            .at(Step::CredentialProvisioning)?;
        self.advance(record, ChangeState::CredentialsProvisioned)?;

        let node_bundle = self.materialize(record, &issued).at(Step::TrustMaterial)?;
        self.advance(record, ChangeState::TrustMaterialized)?;

        if record.request.changes_config() {
            self.change_config(record, &issued.roots).await?;
        }

        if let (Some(spec), Some(bundle)) = (record.request.node().cloned(), node_bundle) {
            let participant = spec.participant();
            let handle = self
                .nodes
                .bootstrap(&participant, &spec, &bundle)
                .await
                .at(Step::NodeBootstrap)?;
            record.node = Some(handle.clone());
            let channel = record.request.channel().to_string();
            let block = self
                .nodes
                .committed_block(&channel)
                .await
                .at(Step::ChannelJoin)?;
            self.nodes
                .join(&handle, &channel, &block)
                .await
                .at(Step::ChannelJoin)?;
            self.advance(record, ChangeState::NodeJoined)?;
        }
        Ok(())
    }

    async fn provision(&self, record: &MembershipChangeRequest) -> Result<Issued, StepError> {
        let participant = &record.participant;
        let roots = self.provisioner.roots(participant.org_name()).await?;
        let mut org = Vec::new();
        let mut node = None;
        if let OnboardingRequest::AddOrganization { admin, user, .. } = &record.request {
            org.push(self.issue(record, participant, NetworkRole::Admin, admin).await?);
            if let Some(user) = user {
                org.push(self.issue(record, participant, NetworkRole::User, user).await?);
            }
        }
        if let Some(spec) = record.request.node() {
            let enrollment = match &record.request {
                OnboardingRequest::AddNode { enrollment, .. } => enrollment.clone(),
                OnboardingRequest::AddOrganization { .. } => EnrollmentSpec::new(&spec.name),
            };
            node = Some(
                self.issue(record, &spec.participant(), NetworkRole::PeerNode, &enrollment)
                    .await?,
            );
        }
        Ok(Issued { roots, org, node })
    }

    async fn issue(
        &self,
        record: &MembershipChangeRequest,
        participant: &Participant,
        role: NetworkRole,
        spec: &EnrollmentSpec,
    ) -> Result<Identity, CredentialError> {
        let credentials = spec.resolve(&record.id);
        match self.provisioner.provision(participant, role, &credentials).await {
            Err(CredentialError::Duplicate { .. }) if record.attempt > 1 => {
                info!(
                    evt = "already_provisioned",
                    request = %record.id,
                    enrollment_id = %credentials.enrollment_id
                );
                self.provisioner.reclaim(participant, role, &credentials).await
            }
            other => other,
        }
    }

    fn materialize(
        &self,
        record: &mut MembershipChangeRequest,
        issued: &Issued,
    ) -> Result<Option<TrustBundle>, StepError> {
        let mut bundles = Vec::new();
        if !issued.org.is_empty() {
            let bundle = self
                .trust
                .materialize(&issued.org, &record.participant, &issued.roots)?;
            bundles.push(bundle.root);
        }
        let mut node_bundle = None;
        if let (Some(spec), Some(identity)) = (record.request.node(), &issued.node) {
            let bundle = self.trust.materialize(
                std::slice::from_ref(identity),
                &spec.participant(),
                &issued.roots,
            )?;
            bundles.push(bundle.root.clone());
            node_bundle = Some(bundle);
        }
        record.bundles = bundles;
        Ok(node_bundle)
    }

    fn change_for(&self, request: &OnboardingRequest, roots: &CaRoots) -> Option<ConfigChange> {
        match request {
            OnboardingRequest::AddOrganization {
                organization,
                msp_id,
                policies,
                anchor_peers,
                ..
            } => Some(ConfigChange::AddOrganization(OrganizationEntry {
                name: organization.clone(),
                msp_id: msp_id.clone(),
                root_certs: vec![roots.root_cert.clone()],
                tls_root_certs: vec![roots.tls_root_cert.clone()],
                policies: policies
                    .clone()
                    .unwrap_or_else(|| OrgPolicies::standard(msp_id)),
                anchor_peers: anchor_peers.clone(),
            })),
            OnboardingRequest::AddNode {
                node,
                announce_anchor: true,
                ..
            } => Some(ConfigChange::AddNodeEndpoint {
                msp_id: node.msp_id.clone(),
                endpoint: node.endpoint(&self.domain),
            }),
            OnboardingRequest::AddNode { .. } => None,
        }
    }

    async fn change_config(
        &self,
        record: &mut MembershipChangeRequest,
        roots: &CaRoots,
    ) -> Result<(), Halt> {
        let Some(change) = self.change_for(&record.request, roots) else {
            return Ok(());
        };
        if let Some(commit) = &record.commit {
            info!(
                evt = "commit_reused",
                request = %record.id,
                version = commit.version,
                digest = %commit.update_digest
            );
            self.advance(record, ChangeState::Committed)?;
            return Ok(());
        }
        if self.settle_pending(record).await? {
            return Ok(());
        }
        let channel = record.request.channel().to_string();
        let proposal = self
            .delta
            .propose(&channel, &change)
            .await
            .at(Step::DeltaComputation)?;
        let required = self
            .policy
            .required_for(&proposal.snapshot.config, &change)
            .map_err(|err| DeltaError::InvalidChange(format!("quorum policy: {err}")))
            .at(Step::DeltaComputation)?;
        self.advance(record, ChangeState::DeltaComputed)?;

        let signed = self
            .quorum
            .collect_signatures(&proposal.unsigned, &required)
            .await
            .at(Step::QuorumSigning)?;
        self.advance(record, ChangeState::QuorumSatisfied)?;

        record.signed = Some(signed.clone());
        self.advance(record, ChangeState::Submitted)?;
        let commit = self.submission.submit(&signed).await.at(Step::Submission)?;
        self.record_commit(record, commit)
    }

    /// Resubmits an update stored by an earlier attempt. `true` when it is
    /// committed; a stale one is dropped so the delta is recomputed.
    async fn settle_pending(&self, record: &mut MembershipChangeRequest) -> Result<bool, Halt> {
        let Some(signed) = record.signed.clone() else {
            return Ok(false);
        };
        match self.submission.submit(&signed).await {
            Ok(commit) => {
                self.advance(record, ChangeState::Submitted)?;
                info!(
                    evt = "pending_update_settled",
                    request = %record.id,
                    version = commit.version,
                    digest = %commit.update_digest
                );
                self.record_commit(record, commit)?;
                Ok(true)
            }
            Err(SubmissionError::StaleBase(stale)) => {
                info!(
                    evt = "pending_update_stale",
                    request = %record.id,
                    base = stale.base,
                    current = stale.current
                );
                record.signed = None;
                self.store.save(record)?;
                Ok(false)
            }
            Err(err) => Err(Halt::Step(Step::Submission, err.into())),
        }
    }

    fn record_commit(
        &self,
        record: &mut MembershipChangeRequest,
        commit: CommitResult,
    ) -> Result<(), Halt> {
        record.commit = Some(commit);
        record.signed = None;
        self.advance(record, ChangeState::Committed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConfigBlock;
    use crate::collab::OrdererFailure;
    use crate::delta::UnsignedUpdate;
    use crate::quorum::{SignerFailure, UpdateSignature, UpdateSigner};
    use crate::sim::{SimNetwork, SimOrderer};
    use crate::store::MemoryRequestStore;
    use crate::submit::CommitEnvelope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::trust::tests::temp_root;
    use crate::wallet::MemoryWallet;

    struct Harness {
        net: SimNetwork,
        store: Arc<MemoryRequestStore>,
        wallet: Arc<MemoryWallet>,
        config: OnboardConfig,
    }

    impl Harness {
        fn new(tag: &str) -> Self {
            let mut net = SimNetwork::bootstrap("example.com", "mychannel", &["org1", "org2"]);
            net.add_ca("org3");
            let mut config = OnboardConfig::default();
            config.trust_root = temp_root(tag);
            config.timeouts.signer_ms = 100;
            config.timeouts.poll_interval_ms = 1;
            config.timeouts.health_ms = 2_000;
            Self {
                net,
                store: Arc::new(MemoryRequestStore::new()),
                wallet: Arc::new(MemoryWallet::new()),
                config,
            }
        }

        fn coordinator(&self) -> MembershipCoordinator {
            MembershipCoordinator::new(
                &self.config,
                self.net
                    .collaborators(self.wallet.clone(), self.store.clone()),
            )
        }

        fn coordinator_over(&self, orderer: Arc<dyn OrderingService>) -> MembershipCoordinator {
            let collab = Collaborators {
                orderer,
                ..self
                    .net
                    .collaborators(self.wallet.clone(), self.store.clone())
            };
            MembershipCoordinator::new(&self.config, collab)
        }
    }

    /// Commits updates but loses the first acknowledgement.
    struct LossyOrderer {
        inner: Arc<SimOrderer>,
        drop_reply: AtomicBool,
    }

    #[async_trait]
    impl OrderingService for LossyOrderer {
        async fn fetch_config(&self, channel: &str) -> Result<ConfigBlock, OrdererFailure> {
            self.inner.fetch_config(channel).await
        }

        async fn submit_update(
            &self,
            envelope: &CommitEnvelope,
        ) -> Result<CommitResult, OrdererFailure> {
            let result = self.inner.submit_update(envelope).await?;
            if self.drop_reply.swap(false, Ordering::SeqCst) {
                return Err(OrdererFailure::Unavailable("reply lost".into()));
            }
            Ok(result)
        }

        async fn join_channel(
            &self,
            node: &NodeHandle,
            channel: &str,
            block: &ConfigBlock,
        ) -> Result<(), OrdererFailure> {
            self.inner.join_channel(node, channel, block).await
        }
    }

    /// Lets a concurrent writer advance the channel while the first signature
    /// is being produced.
    struct RacingSigner {
        inner: Arc<dyn UpdateSigner>,
        orderer: Arc<SimOrderer>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl UpdateSigner for RacingSigner {
        fn signer_id(&self) -> &str {
            self.inner.signer_id()
        }

        async fn sign(&self, update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.orderer
                    .announce_anchor("Org1MSP", "peer0.org1.example.com", 7051)
                    .map_err(SignerFailure)?;
            }
            self.inner.sign(update).await
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.config.trust_root);
        }
    }

    fn add_org3() -> OnboardingRequest {
        OnboardingRequest::AddOrganization {
            organization: "org3".into(),
            msp_id: "Org3MSP".into(),
            channel: "mychannel".into(),
            admin: EnrollmentSpec::new("admin"),
            user: Some(EnrollmentSpec::new("user1")),
            policies: None,
            anchor_peers: Vec::new(),
            initial_node: None,
        }
    }

    fn add_peer1() -> OnboardingRequest {
        OnboardingRequest::AddNode {
            node: NodeSpec::new("peer1", "org1", "Org1MSP", 8051),
            channel: "mychannel".into(),
            enrollment: EnrollmentSpec::new("peer1"),
            announce_anchor: false,
        }
    }

    fn states(record: &MembershipChangeRequest) -> Vec<&'static str> {
        record
            .history
            .iter()
            .filter(|t| t.attempt == record.attempt)
            .map(|t| t.state.name())
            .collect()
    }

    #[tokio::test]
    async fn organization_with_full_quorum_commits() {
        let h = Harness::new("coord_commit");
        let before = h.net.orderer.config();
        let record = h.coordinator().onboard(add_org3()).await.unwrap();
        assert_eq!(
            states(&record),
            vec![
                "Draft",
                "CredentialsProvisioned",
                "TrustMaterialized",
                "DeltaComputed",
                "QuorumSatisfied",
                "Submitted",
                "Committed"
            ]
        );
        assert!(record.is_complete());

        let after = h.net.orderer.config();
        assert_eq!(after.organizations.len(), before.organizations.len() + 1);
        for (msp_id, entry) in &before.organizations {
            assert_eq!(&after.organizations[msp_id], entry);
        }
        let org3 = &after.organizations["Org3MSP"];
        assert_eq!(org3.policies, OrgPolicies::standard("Org3MSP"));
        assert_eq!(record.commit.as_ref().unwrap().version, after.sequence);
        assert_eq!(h.wallet.labels().unwrap(), vec!["org3.admin", "org3.user1"]);
        assert!(record.bundles[0].join("msp/config.yaml").exists());
    }

    #[tokio::test]
    async fn silent_signer_fails_quorum_and_names_it() {
        let mut h = Harness::new("coord_quorum");
        h.net.stall_signer("org2-admin");
        let record = h.coordinator().onboard(add_org3()).await.unwrap();
        match &record.state {
            ChangeState::Failed {
                step, kind, retriable, ..
            } => {
                assert_eq!(*step, Step::QuorumSigning);
                assert_eq!(
                    *kind,
                    FailureKind::QuorumNotMet {
                        missing: vec!["org2-admin".into()]
                    }
                );
                assert!(*retriable);
            }
            other => panic!("unexpected state {other}"),
        }
        assert!(h.net.orderer.config().organizations.get("Org3MSP").is_none());
        assert_eq!(h.net.orderer.submissions(), 0);
    }

    #[tokio::test]
    async fn node_in_member_org_skips_quorum() {
        let h = Harness::new("coord_node");
        let record = h.coordinator().onboard(add_peer1()).await.unwrap();
        assert_eq!(
            states(&record),
            vec![
                "Draft",
                "CredentialsProvisioned",
                "TrustMaterialized",
                "NodeJoined"
            ]
        );
        assert!(h.net.orderer.has_joined("peer1.org1.example.com", "mychannel"));
        assert_eq!(h.net.orderer.submissions(), 0);
        let handle = record.node.unwrap();
        assert_eq!(handle.endpoint, Endpoint::new("peer1.org1.example.com", 8051));
    }

    #[tokio::test]
    async fn retry_treats_duplicate_enrollment_as_satisfied() {
        let mut h = Harness::new("coord_retry");
        h.net.stall_signer("org2-admin");
        let coordinator = h.coordinator();
        let first = coordinator.onboard(add_org3()).await.unwrap();
        assert!(first.is_failed());
        let admin_before = h.wallet.get("org3.admin").unwrap().unwrap();

        // Signer comes back; the same request id is retried.
        h.net.restore_signer("org2");
        let coordinator = h.coordinator();
        let retried = coordinator.retry(&first.id).await.unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.state, ChangeState::Committed, "{}", retried.state);
        assert_eq!(h.wallet.get("org3.admin").unwrap().unwrap(), admin_before);
        assert!(retried
            .history
            .iter()
            .any(|t| t.attempt == 1 && t.state.name() == "Failed"));
    }

    #[tokio::test]
    async fn lost_commit_acknowledgement_settles_on_retry() {
        let h = Harness::new("coord_lost_ack");
        let coordinator = h.coordinator_over(Arc::new(LossyOrderer {
            inner: h.net.orderer.clone(),
            drop_reply: AtomicBool::new(true),
        }));
        let first = coordinator.onboard(add_org3()).await.unwrap();
        match &first.state {
            ChangeState::Failed {
                step, kind, retriable, ..
            } => {
                assert_eq!(*step, Step::Submission);
                assert_eq!(*kind, FailureKind::Unavailable);
                assert!(*retriable);
            }
            other => panic!("unexpected state {other}"),
        }
        assert!(first.signed.is_some());
        assert!(first.commit.is_none());
        assert!(first
            .history
            .iter()
            .any(|t| t.state == ChangeState::Submitted));
        assert!(h.net.orderer.config().organizations.contains_key("Org3MSP"));

        let retried = coordinator.retry(&first.id).await.unwrap();
        assert_eq!(retried.state, ChangeState::Committed, "{}", retried.state);
        assert_eq!(
            states(&retried),
            vec![
                "Draft",
                "CredentialsProvisioned",
                "TrustMaterialized",
                "Submitted",
                "Committed"
            ]
        );
        let commit = retried.commit.clone().unwrap();
        assert_eq!(commit.version, 2);
        assert_eq!(commit.update_digest, first.signed.unwrap().unsigned.digest);
        assert!(retried.signed.is_none());
        assert_eq!(h.net.orderer.submissions(), 1);
        assert_eq!(h.net.orderer.config().sequence, 2);
    }

    #[tokio::test]
    async fn stale_base_is_retried_from_a_fresh_snapshot() {
        let mut h = Harness::new("coord_stale");
        let org1_admin = h.net.signers.get("org1-admin").cloned().unwrap();
        h.net.signers.insert(Arc::new(RacingSigner {
            inner: org1_admin,
            orderer: h.net.orderer.clone(),
            raced: AtomicBool::new(false),
        }));
        let coordinator = h.coordinator();
        let first = coordinator.onboard(add_org3()).await.unwrap();
        match &first.state {
            ChangeState::Failed {
                step, kind, retriable, ..
            } => {
                assert_eq!(*step, Step::Submission);
                assert_eq!(*kind, FailureKind::StaleBase);
                assert!(*retriable);
            }
            other => panic!("unexpected state {other}"),
        }
        assert_eq!(h.net.orderer.submissions(), 0);
        assert!(h.net.orderer.config().organizations.get("Org3MSP").is_none());

        let retried = coordinator.retry(&first.id).await.unwrap();
        assert_eq!(retried.state, ChangeState::Committed, "{}", retried.state);
        assert_eq!(
            states(&retried),
            vec![
                "Draft",
                "CredentialsProvisioned",
                "TrustMaterialized",
                "DeltaComputed",
                "QuorumSatisfied",
                "Submitted",
                "Committed"
            ]
        );
        assert_eq!(retried.commit.as_ref().unwrap().version, 3);
        let config = h.net.orderer.config();
        assert!(config.organizations.contains_key("Org3MSP"));
        assert_eq!(
            config.organizations["Org1MSP"].anchor_peers,
            vec![Endpoint::new("peer0.org1.example.com", 7051)]
        );
        assert_eq!(h.net.orderer.submissions(), 1);
    }

    #[tokio::test]
    async fn organization_with_initial_node_joins_after_commit() {
        let h = Harness::new("coord_org_node");
        let mut request = add_org3();
        if let OnboardingRequest::AddOrganization { initial_node, .. } = &mut request {
            *initial_node = Some(NodeSpec::new("peer0", "org3", "Org3MSP", 11051));
        }
        let record = h.coordinator().onboard(request).await.unwrap();
        assert_eq!(record.state, ChangeState::NodeJoined, "{}", record.state);
        assert!(h.net.orderer.has_joined("peer0.org3.example.com", "mychannel"));
        assert_eq!(record.bundles.len(), 2);
    }

    #[tokio::test]
    async fn existing_member_is_a_duplicate_participant() {
        let h = Harness::new("coord_dup");
        let request = OnboardingRequest::AddOrganization {
            organization: "org1".into(),
            msp_id: "Org1MSP".into(),
            channel: "mychannel".into(),
            admin: EnrollmentSpec::new("admin"),
            user: None,
            policies: None,
            anchor_peers: Vec::new(),
            initial_node: None,
        };
        let record = h.coordinator().onboard(request).await.unwrap();
        match record.state {
            ChangeState::Failed {
                step,
                kind,
                retriable,
                ..
            } => {
                assert_eq!(step, Step::DeltaComputation);
                assert_eq!(kind, FailureKind::DuplicateParticipant);
                assert!(!retriable);
            }
            other => panic!("unexpected state {other}"),
        }
    }

    #[tokio::test]
    async fn anchor_announcement_needs_only_the_owner() {
        let mut h = Harness::new("coord_anchor");
        h.net.stall_signer("org2-admin");
        let mut request = add_peer1();
        if let OnboardingRequest::AddNode { announce_anchor, .. } = &mut request {
            *announce_anchor = true;
        }
        let record = h.coordinator().onboard(request).await.unwrap();
        assert_eq!(record.state, ChangeState::NodeJoined, "{}", record.state);
        let org1 = &h.net.orderer.config().organizations["Org1MSP"];
        assert_eq!(
            org1.anchor_peers,
            vec![Endpoint::new("peer1.org1.example.com", 8051)]
        );
    }

    #[tokio::test]
    async fn run_and_retry_guard_states() {
        let h = Harness::new("coord_guard");
        let coordinator = h.coordinator();
        let record = coordinator.onboard(add_peer1()).await.unwrap();
        assert!(matches!(
            coordinator.run(&record.id).await,
            Err(CoordinatorError::NotRunnable { .. })
        ));
        assert!(matches!(
            coordinator.retry(&record.id).await,
            Err(CoordinatorError::NotRunnable { .. })
        ));
        let missing = RequestId::parse("missing").unwrap();
        assert!(matches!(
            coordinator.status(&missing).await,
            Err(CoordinatorError::UnknownRequest(_))
        ));
        assert!(matches!(
            coordinator.submit_request_as(record.id.clone(), add_peer1()).await,
            Err(CoordinatorError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut record = MembershipChangeRequest::new(RequestId::generate(), add_peer1());
        assert!(record.advance(ChangeState::TrustMaterialized));
        assert!(!record.advance(ChangeState::CredentialsProvisioned));
        assert_eq!(record.state, ChangeState::TrustMaterialized);
    }
}
