//! Participant, identity and endpoint types shared by every onboarding stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Whether an onboarding target is a whole organization or a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// A new member organization of the channel.
    Organization,
    /// A peer node of an organization.
    Node,
}

/// Role an identity plays inside its organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRole {
    /// Organization administrator; signs configuration updates.
    Admin,
    /// Client identity used by applications.
    User,
    /// Peer node identity.
    PeerNode,
}

impl NetworkRole {
    /// Role string understood by the certificate authority.
    pub fn ca_type(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "client",
            Self::PeerNode => "peer",
        }
    }
}

impl fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ca_type())
    }
}

/// An organization or node being onboarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Organization or node.
    pub kind: ParticipantKind,
    /// Organization name (`org3`) or node name (`peer1`).
    pub id: String,
    /// Parent organization; present for nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Membership-service-provider id of the owning organization.
    pub msp_id: String,
    /// Network role the participant is admitted with.
    pub role: NetworkRole,
}

impl Participant {
    /// New organization participant.
    pub fn organization(name: impl Into<String>, msp_id: impl Into<String>) -> Self {
        Self {
            kind: ParticipantKind::Organization,
            id: name.into(),
            organization: None,
            msp_id: msp_id.into(),
            role: NetworkRole::Admin,
        }
    }

    /// New node participant inside `organization`.
    pub fn node(
        name: impl Into<String>,
        organization: impl Into<String>,
        msp_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: ParticipantKind::Node,
            id: name.into(),
            organization: Some(organization.into()),
            msp_id: msp_id.into(),
            role: NetworkRole::PeerNode,
        }
    }

    /// Name of the organization this participant belongs to.
    pub fn org_name(&self) -> &str {
        self.organization.as_deref().unwrap_or(&self.id)
    }

    /// Key under which trust material and wallet entries are stored.
    pub fn storage_key(&self) -> String {
        match self.kind {
            ParticipantKind::Organization => self.id.clone(),
            ParticipantKind::Node => format!("{}.{}", self.id, self.org_name()),
        }
    }

    /// Fully-qualified host name under the network domain.
    pub fn host(&self, domain: &str) -> String {
        format!("{}.{domain}", self.storage_key())
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.storage_key(), self.msp_id)
    }
}

/// Host/port pair of a network service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// DNS name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Convenience constructor.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport-security key pair issued alongside a node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsIdentity {
    /// PEM certificate bound to the node's host names.
    pub certificate: String,
    /// PEM private key.
    pub private_key: String,
    /// Host names embedded in the certificate.
    pub hosts: Vec<String>,
}

/// Certificate, key and MSP id bound to one participant role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Enrollment id registered with the CA.
    pub enrollment_id: String,
    /// Owning organization's MSP id.
    pub msp_id: String,
    /// Role of the identity.
    pub role: NetworkRole,
    /// PEM signing certificate.
    pub certificate: String,
    /// PEM private key.
    pub private_key: String,
    /// TLS pair, present for node identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsIdentity>,
}

impl Identity {
    /// Wallet label (`{org}.{enrollment_id}`).
    pub fn label(&self, organization: &str) -> String {
        wallet_label(organization, &self.enrollment_id)
    }
}

/// Wallet label for an enrollment id of an organization.
pub fn wallet_label(organization: &str, enrollment_id: &str) -> String {
    format!("{organization}.{enrollment_id}")
}

/// Identifier of a tracked membership change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random request id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id, rejecting characters unsafe for file names.
    pub fn parse(value: &str) -> Option<Self> {
        let ok = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        ok.then(|| Self(value.to_string()))
    }

    /// Borrowed string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
