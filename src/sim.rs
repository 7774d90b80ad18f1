//! In-process simulated network used by `onboard simulate` and the tests.
//!
//! [`SimCa`] issues PEM-framed certificates signed with an ed25519 CA key,
//! [`SimOrderer`] keeps one channel config, enforces stale-base, signature and
//! modification-policy checks, and [`SimRuntime`] pretends to host nodes.

use crate::channel::{ChannelConfig, ConfigBlock, OrgPolicies, OrganizationEntry};
use crate::codec::JsonCodec;
use crate::coordinator::Collaborators;
use crate::collab::{
    CaFailure, CaRoots, CertificateAuthority, ContainerRuntime, EnrollmentProfile,
    EnrollmentRequest, Enrollment, Health, OrdererFailure, OrderingService, Registration,
    RuntimeFailure,
};
use crate::delta::{apply_change, ConfigChange, UnsignedUpdate};
use crate::model::{now_millis, Endpoint, NetworkRole};
use crate::node::{DeploymentDescriptor, NodeHandle};
use crate::policy::admin_signer;
use crate::provision::CaDirectory;
use crate::store::RequestStore;
use crate::quorum::{SignerDirectory, SignerFailure, UpdateSignature, UpdateSigner};
use crate::sign::{
    encode_public_key_base64, load_or_derive_keypair, sign_payload_base64,
    verify_signature_base64, Ed25519KeySource, KeyMaterial, LocalKeySigner,
};
use crate::submit::{CommitEnvelope, CommitResult};
use crate::wallet::Wallet;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Conventional MSP id of an organization (`org1` -> `Org1MSP`).
pub fn msp_for(organization: &str) -> String {
    let mut chars = organization.chars();
    match chars.next() {
        Some(first) => format!("{}{}MSP", first.to_ascii_uppercase(), chars.as_str()),
        None => "MSP".into(),
    }
}

fn pem(label: &str, body: &[u8]) -> String {
    let encoded = BASE64.encode(body);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn seeded(seed: &str) -> KeyMaterial {
    let signing = load_or_derive_keypair(&Ed25519KeySource::Seed(seed.to_string()))
        .map(|keys| keys.signing)
        .unwrap_or_else(|_| SigningKey::generate(&mut OsRng));
    KeyMaterial {
        verifying: signing.verifying_key(),
        signing,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Serialize)]
struct CertBody<'a> {
    subject: &'a str,
    issuer: &'a str,
    role: &'a str,
    profile: EnrollmentProfile,
    hosts: &'a [String],
    serial: u64,
    public_key: String,
}

struct SimRegistration {
    secret: String,
    role: NetworkRole,
    max_enrollments: u32,
    used: u32,
}

#[derive(Default)]
struct CaState {
    registrations: HashMap<String, SimRegistration>,
    serial: u64,
}

/// Simulated certificate authority of one organization.
pub struct SimCa {
    organization: String,
    signing_root: KeyMaterial,
    tls_root: KeyMaterial,
    state: Mutex<CaState>,
    available: AtomicBool,
}

impl SimCa {
    /// CA for `organization` with keys derived from its name.
    pub fn new(organization: impl Into<String>) -> Self {
        let organization = organization.into();
        let derive = |tag: &str| seeded(&format!("sim-{tag}:{organization}"));
        Self {
            signing_root: derive("ca"),
            tls_root: derive("tlsca"),
            organization,
            state: Mutex::new(CaState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every call fail as unreachable while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Root certificates, without the async round trip.
    pub fn root_pems(&self) -> CaRoots {
        let root = |tag: &str, keys: &KeyMaterial| {
            pem(
                "CERTIFICATE",
                format!(
                    "{tag}.{}|{}",
                    self.organization,
                    encode_public_key_base64(&keys.verifying)
                )
                .as_bytes(),
            )
        };
        CaRoots {
            root_cert: root("ca", &self.signing_root),
            tls_root_cert: root("tlsca", &self.tls_root),
        }
    }

    fn check_available(&self) -> Result<(), CaFailure> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CaFailure::Unavailable(format!(
                "ca.{} is not reachable",
                self.organization
            )))
        }
    }
}

#[async_trait]
impl CertificateAuthority for SimCa {
    async fn register(&self, registration: &Registration) -> Result<(), CaFailure> {
        self.check_available()?;
        if registration.secret.is_empty() {
            return Err(CaFailure::Rejected("empty enrollment secret".into()));
        }
        let mut state = lock(&self.state);
        if state.registrations.contains_key(&registration.enrollment_id) {
            return Err(CaFailure::Duplicate);
        }
        state.registrations.insert(
            registration.enrollment_id.clone(),
            SimRegistration {
                secret: registration.secret.clone(),
                role: registration.role,
                max_enrollments: registration.max_enrollments,
                used: 0,
            },
        );
        Ok(())
    }

    async fn enroll(&self, request: &EnrollmentRequest) -> Result<Enrollment, CaFailure> {
        self.check_available()?;
        let mut state = lock(&self.state);
        state.serial += 1;
        let serial = state.serial;
        let registration = state
            .registrations
            .get_mut(&request.enrollment_id)
            .ok_or_else(|| CaFailure::Rejected("unknown identity".into()))?;
        if registration.secret != request.secret {
            return Err(CaFailure::Rejected("authentication failure".into()));
        }
        if registration.max_enrollments != 0 && registration.used >= registration.max_enrollments
        {
            return Err(CaFailure::Rejected("enrollment limit reached".into()));
        }
        registration.used += 1;
        let role = registration.role.ca_type();
        let issuer_keys = match request.profile {
            EnrollmentProfile::Signing => &self.signing_root,
            EnrollmentProfile::Tls => &self.tls_root,
        };
        let key = SigningKey::generate(&mut OsRng);
        let body = CertBody {
            subject: &request.enrollment_id,
            issuer: &self.organization,
            role,
            profile: request.profile,
            hosts: &request.hosts,
            serial,
            public_key: encode_public_key_base64(&key.verifying_key()),
        };
        let body = serde_json::to_vec(&body).map_err(|err| CaFailure::Rejected(err.to_string()))?;
        let signature = sign_payload_base64(&issuer_keys.signing, &body);
        let mut signed = body;
        signed.push(b'|');
        signed.extend_from_slice(signature.as_bytes());
        Ok(Enrollment {
            certificate: pem("CERTIFICATE", &signed),
            private_key: pem("PRIVATE KEY", &key.to_bytes()),
        })
    }

    async fn roots(&self) -> Result<CaRoots, CaFailure> {
        self.check_available()?;
        Ok(self.root_pems())
    }
}

struct ChannelState {
    config: ChannelConfig,
    last_update: Option<String>,
    joined: BTreeSet<(String, String)>,
    submissions: usize,
}

/// Simulated ordering service hosting one channel.
pub struct SimOrderer {
    state: Mutex<ChannelState>,
    admin_keys: Mutex<HashMap<String, BTreeSet<String>>>,
    available: AtomicBool,
}

impl SimOrderer {
    /// Orderer serving `config`.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                config,
                last_update: None,
                joined: BTreeSet::new(),
                submissions: 0,
            }),
            admin_keys: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Authorises `public_key` to sign for `msp_id`.
    pub fn register_admin(&self, msp_id: &str, public_key: String) {
        lock(&self.admin_keys)
            .entry(msp_id.to_string())
            .or_default()
            .insert(public_key);
    }

    /// Makes every call fail as unreachable while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current configuration.
    pub fn config(&self) -> ChannelConfig {
        lock(&self.state).config.clone()
    }

    /// Number of updates committed through [`OrderingService::submit_update`].
    pub fn submissions(&self) -> usize {
        lock(&self.state).submissions
    }

    /// Whether `node` joined `channel`.
    pub fn has_joined(&self, node: &str, channel: &str) -> bool {
        lock(&self.state)
            .joined
            .contains(&(node.to_string(), channel.to_string()))
    }

    /// Commits an anchor announcement directly, as a concurrent writer would.
    pub fn announce_anchor(&self, msp_id: &str, host: &str, port: u16) -> Result<u64, String> {
        let mut state = lock(&self.state);
        let change = ConfigChange::AddNodeEndpoint {
            msp_id: msp_id.to_string(),
            endpoint: Endpoint::new(host, port),
        };
        let mut next = apply_change(&state.config, &change).map_err(|err| err.to_string())?;
        next.sequence += 1;
        state.config = next;
        state.last_update = None;
        Ok(state.config.sequence)
    }

    fn check_available(&self) -> Result<(), OrdererFailure> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrdererFailure::Unavailable("orderer is not reachable".into()))
        }
    }

    fn verify_signatures(&self, envelope: &CommitEnvelope) -> Result<BTreeSet<String>, OrdererFailure> {
        let keys = lock(&self.admin_keys);
        let payload = envelope.signing_payload();
        let mut signed = BTreeSet::new();
        for signature in &envelope.signatures {
            let known = keys
                .get(&signature.msp_id)
                .is_some_and(|set| set.contains(&signature.public_key));
            if !known {
                return Err(OrdererFailure::SignatureInvalid(format!(
                    "{} is not an administrator of {}",
                    signature.signer, signature.msp_id
                )));
            }
            verify_signature_base64(&signature.public_key, &payload, &signature.signature)
                .map_err(|err| {
                    OrdererFailure::SignatureInvalid(format!("{}: {err}", signature.signer))
                })?;
            signed.insert(signature.msp_id.clone());
        }
        Ok(signed)
    }
}

#[async_trait]
impl OrderingService for SimOrderer {
    async fn fetch_config(&self, channel: &str) -> Result<ConfigBlock, OrdererFailure> {
        self.check_available()?;
        let state = lock(&self.state);
        if state.config.channel != channel {
            return Err(OrdererFailure::Rejected(format!("unknown channel {channel}")));
        }
        let data = serde_json::to_vec(&state.config)
            .map_err(|err| OrdererFailure::Unavailable(err.to_string()))?;
        Ok(ConfigBlock {
            channel: channel.to_string(),
            version: state.config.sequence,
            data,
            last_update: state.last_update.clone(),
        })
    }

    async fn submit_update(&self, envelope: &CommitEnvelope) -> Result<CommitResult, OrdererFailure> {
        self.check_available()?;
        let bytes = envelope
            .validate()
            .map_err(|err| OrdererFailure::Rejected(err.to_string()))?;
        let update = JsonCodec::decode_update(&bytes)
            .map_err(|err| OrdererFailure::Rejected(err.to_string()))?;
        let signed_msps = self.verify_signatures(envelope)?;

        let mut state = lock(&self.state);
        if state.config.channel != envelope.channel {
            return Err(OrdererFailure::Rejected(format!(
                "unknown channel {}",
                envelope.channel
            )));
        }
        if envelope.base_version != state.config.sequence {
            return Err(OrdererFailure::StaleBase {
                base: envelope.base_version,
                current: state.config.sequence,
            });
        }
        let local_only = update.added.is_empty()
            && update.removed.is_empty()
            && update.orderer_endpoints.is_none();
        let required: BTreeSet<String> = if local_only {
            update.modified.keys().cloned().collect()
        } else {
            state.config.organizations.keys().cloned().collect()
        };
        let missing: Vec<&String> = required.difference(&signed_msps).collect();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            return Err(OrdererFailure::PolicyViolation(format!(
                "missing signatures from {}",
                names.join(", ")
            )));
        }
        let next = update
            .apply_to(&state.config)
            .map_err(OrdererFailure::Rejected)?;
        state.config = next;
        state.last_update = Some(envelope.digest.clone());
        state.submissions += 1;
        debug!(evt = "sim_commit", channel = %envelope.channel, version = state.config.sequence);
        Ok(CommitResult {
            channel: envelope.channel.clone(),
            version: state.config.sequence,
            update_digest: envelope.digest.clone(),
            committed_ms: now_millis(),
        })
    }

    async fn join_channel(
        &self,
        node: &NodeHandle,
        channel: &str,
        block: &ConfigBlock,
    ) -> Result<(), OrdererFailure> {
        self.check_available()?;
        let mut state = lock(&self.state);
        if state.config.channel != channel || block.channel != channel {
            return Err(OrdererFailure::Rejected(format!("unknown channel {channel}")));
        }
        if block.version > state.config.sequence {
            return Err(OrdererFailure::Rejected(format!(
                "block version {} is ahead of the channel",
                block.version
            )));
        }
        if !state.config.organizations.contains_key(&node.msp_id) {
            return Err(OrdererFailure::Rejected(format!(
                "{} is not a member of {channel}",
                node.msp_id
            )));
        }
        if !state
            .joined
            .insert((node.node.clone(), channel.to_string()))
        {
            return Err(OrdererFailure::AlreadyJoined);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum HealthMode {
    After(usize),
    Never,
}

/// Simulated container runtime.
#[derive(Debug)]
pub struct SimRuntime {
    mode: HealthMode,
    nodes: Mutex<HashMap<String, NodeHandle>>,
    pings: Mutex<HashMap<String, usize>>,
    launches: Mutex<usize>,
}

impl SimRuntime {
    /// Nodes report healthy on the `pings`-th probe.
    pub fn healthy_after(pings: usize) -> Self {
        Self::with_mode(HealthMode::After(pings.max(1)))
    }

    /// Nodes never become healthy.
    pub fn never_healthy() -> Self {
        Self::with_mode(HealthMode::Never)
    }

    fn with_mode(mode: HealthMode) -> Self {
        Self {
            mode,
            nodes: Mutex::new(HashMap::new()),
            pings: Mutex::new(HashMap::new()),
            launches: Mutex::new(0),
        }
    }

    /// Probes received by `node`.
    pub fn pings(&self, node: &str) -> usize {
        lock(&self.pings).get(node).copied().unwrap_or(0)
    }

    /// Containers started.
    pub fn launches(&self) -> usize {
        *lock(&self.launches)
    }
}

#[async_trait]
impl ContainerRuntime for SimRuntime {
    async fn launch(&self, descriptor: &DeploymentDescriptor) -> Result<NodeHandle, RuntimeFailure> {
        let endpoint = descriptor
            .endpoint
            .clone()
            .ok_or_else(|| RuntimeFailure("descriptor has no endpoint".into()))?;
        let mut nodes = lock(&self.nodes);
        if let Some(existing) = nodes.get(&descriptor.container_name) {
            return Ok(existing.clone());
        }
        let mut launches = lock(&self.launches);
        *launches += 1;
        let handle = NodeHandle {
            id: format!("{:012x}", rand::random::<u64>() >> 16),
            node: descriptor.container_name.clone(),
            msp_id: descriptor.msp_id.clone(),
            endpoint,
        };
        nodes.insert(handle.node.clone(), handle.clone());
        Ok(handle)
    }

    async fn ping(&self, handle: &NodeHandle) -> Health {
        let mut pings = lock(&self.pings);
        let count = pings.entry(handle.node.clone()).or_insert(0);
        *count += 1;
        match self.mode {
            HealthMode::After(n) if *count >= n => Health::Healthy,
            HealthMode::After(_) => Health::Unhealthy("starting".into()),
            HealthMode::Never => Health::Unhealthy("crash loop".into()),
        }
    }

    async fn stop(&self, handle: &NodeHandle) -> Result<(), RuntimeFailure> {
        lock(&self.nodes)
            .remove(&handle.node)
            .map(|_| ())
            .ok_or_else(|| RuntimeFailure(format!("{} is not running", handle.node)))
    }
}

/// Signer that never answers.
pub struct StalledSigner(pub String);

#[async_trait]
impl UpdateSigner for StalledSigner {
    fn signer_id(&self) -> &str {
        &self.0
    }

    async fn sign(&self, _update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
        futures::future::pending().await
    }
}

fn member_admin(organization: &str) -> LocalKeySigner {
    let id = admin_signer(organization);
    let keys = seeded(&id);
    LocalKeySigner::new(id, msp_for(organization), keys)
}

/// A complete simulated network.
pub struct SimNetwork {
    /// Domain suffix.
    pub domain: String,
    /// Channel name.
    pub channel: String,
    /// CAs by organization.
    pub ca_by_org: BTreeMap<String, Arc<SimCa>>,
    /// Ordering service.
    pub orderer: Arc<SimOrderer>,
    /// Container runtime.
    pub runtime: Arc<SimRuntime>,
    /// Admin signers of every member.
    pub signers: SignerDirectory,
}

impl SimNetwork {
    /// Channel `channel` with `members` as organizations; each member gets a CA
    /// and an admin signer seeded from `ed25519://<org>-admin`.
    pub fn bootstrap(domain: &str, channel: &str, members: &[&str]) -> Self {
        let mut config = ChannelConfig::new(channel);
        config.sequence = 1;
        config.orderer_endpoints = vec![Endpoint::new(format!("orderer.{domain}"), 7050)];
        let mut ca_by_org = BTreeMap::new();
        for org in members {
            let ca = Arc::new(SimCa::new(*org));
            let roots = ca.root_pems();
            let msp_id = msp_for(org);
            config.organizations.insert(
                msp_id.clone(),
                OrganizationEntry {
                    name: org.to_string(),
                    policies: OrgPolicies::standard(&msp_id),
                    msp_id,
                    root_certs: vec![roots.root_cert],
                    tls_root_certs: vec![roots.tls_root_cert],
                    anchor_peers: Vec::new(),
                },
            );
            ca_by_org.insert(org.to_string(), ca);
        }
        let orderer = Arc::new(SimOrderer::new(config));
        let mut signers = SignerDirectory::new();
        for org in members {
            let signer = member_admin(org);
            orderer.register_admin(&msp_for(org), signer.public_key());
            signers.insert(Arc::new(signer));
        }
        Self {
            domain: domain.to_string(),
            channel: channel.to_string(),
            ca_by_org,
            orderer,
            runtime: Arc::new(SimRuntime::healthy_after(2)),
            signers,
        }
    }

    /// Adds a CA for an organization that is not yet a member.
    pub fn add_ca(&mut self, organization: &str) -> Arc<SimCa> {
        self.ca_by_org
            .entry(organization.to_string())
            .or_insert_with(|| Arc::new(SimCa::new(organization)))
            .clone()
    }

    /// Replaces `signer_id` with a signer that never answers.
    pub fn stall_signer(&mut self, signer_id: &str) {
        self.signers.insert(Arc::new(StalledSigner(signer_id.to_string())));
    }

    /// Puts the seeded admin signer of `organization` back.
    pub fn restore_signer(&mut self, organization: &str) {
        self.signers.insert(Arc::new(member_admin(organization)));
    }

    /// CA directory over every simulated CA.
    pub fn ca_directory(&self) -> CaDirectory {
        let mut cas = CaDirectory::new();
        for (org, ca) in &self.ca_by_org {
            cas.insert(org.clone(), ca.clone());
        }
        cas
    }

    /// Coordinator collaborators over this network.
    pub fn collaborators(
        &self,
        wallet: Arc<dyn Wallet>,
        store: Arc<dyn RequestStore>,
    ) -> Collaborators {
        Collaborators {
            cas: self.ca_directory(),
            orderer: self.orderer.clone(),
            codec: Arc::new(JsonCodec),
            runtime: self.runtime.clone(),
            signers: self.signers.clone(),
            wallet,
            store,
        }
    }
}
