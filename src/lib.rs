#![deny(missing_docs)]

//! # consortium_onboard
//!
//! **consortium_onboard** admits new organizations and peer nodes into a
//! running permissioned ledger network without stopping it. A single
//! membership change walks through a fixed pipeline, and every step is
//! recorded so a failed change can be retried from where it stopped:
//!
//! 1. **Credentials**: the [`provision`] module registers and enrolls the
//!    admin, user and node identities against the organization's CA and
//!    stores them in a [`wallet`].
//! 2. **Trust material**: [`trust`] lays out the MSP directory tree
//!    (`cacerts`, `tlscacerts`, `signcerts`, `keystore`, `config.yaml`) for the
//!    new participant.
//! 3. **Delta**: [`delta`] fetches the channel configuration, applies the
//!    change and computes the minimal [`channel::ConfigUpdate`].
//! 4. **Quorum**: [`quorum`] collects signatures from every required admin
//!    in parallel, bounded by a deadline.
//! 5. **Submission**: [`submit`] wraps the signed update in an envelope and
//!    hands it to the ordering service, rejecting stale bases.
//! 6. **Node lifecycle**: [`node`] launches the peer container, waits for
//!    health and joins it to the channel.
//!
//! [`coordinator::MembershipCoordinator`] owns the state machine tying the
//! steps together. External systems sit behind the traits in [`collab`];
//! [`sim`] provides an in-process network and the `remote` module (feature
//! `net`) talks to real gateways over HTTP.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consortium_onboard::{
//!     coordinator::{Collaborators, MembershipCoordinator, OnboardingRequest},
//!     provision::EnrollmentSpec,
//!     sim::SimNetwork,
//!     MemoryRequestStore, MemoryWallet, OnboardConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut net = SimNetwork::bootstrap("example.com", "mychannel", &["org1", "org2"]);
//! net.add_ca("org3");
//! let config = OnboardConfig::default();
//! let collab: Collaborators = net.collaborators(
//!     Arc::new(MemoryWallet::new()),
//!     Arc::new(MemoryRequestStore::new()),
//! );
//! let coordinator = MembershipCoordinator::new(&config, collab);
//! let record = coordinator
//!     .onboard(OnboardingRequest::AddOrganization {
//!         organization: "org3".into(),
//!         msp_id: "Org3MSP".into(),
//!         channel: "mychannel".into(),
//!         admin: EnrollmentSpec::new("admin"),
//!         user: None,
//!         policies: None,
//!         anchor_peers: Vec::new(),
//!         initial_node: None,
//!     })
//!     .await?;
//! println!("{} -> {}", record.id, record.state.name());
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod collab;
pub mod config;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod model;
pub mod node;
pub mod policy;
pub mod provision;
pub mod quorum;
#[cfg(feature = "net")]
pub mod remote;
pub mod sign;
pub mod sim;
pub mod store;
pub mod submit;
pub mod trust;
pub mod wallet;

pub use channel::{ChannelConfig, ConfigBlock, ConfigUpdate, OrgPolicies, OrganizationEntry};
pub use config::{OnboardConfig, Timeouts};
pub use coordinator::{
    ChangeState, CoordinatorError, MembershipChangeRequest, MembershipCoordinator,
    OnboardingRequest, Step,
};
pub use error::{FailureKind, StepError};
pub use model::{Endpoint, Identity, NetworkRole, Participant, RequestId};
pub use node::{DeploymentDescriptor, NodeHandle, NodeSpec};
pub use store::{FileRequestStore, MemoryRequestStore, RequestStore};
pub use wallet::{FileWallet, MemoryWallet, Wallet};
