//! Signature policies: rule validation for new organizations and the quorum
//! policy deciding which existing members must co-sign a change.

use crate::channel::{ChannelConfig, OrgPolicies};
use crate::delta::ConfigChange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

const ROLES: [&str; 5] = ["admin", "peer", "client", "member", "orderer"];

/// Errors raised while validating rules or resolving signers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The rule text does not follow the grammar.
    #[error("malformed rule: {0}")]
    Malformed(String),
    /// A principal names a different MSP than the organization being added.
    #[error("principal {0} does not belong to the organization")]
    ForeignPrincipal(String),
    /// An explicitly required signer does not map to a channel member.
    #[error("signer {0} is not an administrator of a channel member")]
    UnknownSigner(String),
    /// No existing member could sign.
    #[error("no existing organization can authorise the change")]
    EmptyQuorum,
}

/// Parsed signature rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRule {
    /// `'MSP.role'`
    Principal {
        /// MSP id.
        msp_id: String,
        /// Role name.
        role: String,
    },
    /// `OutOf(n, ...)`; `OR` is `OutOf(1, ...)`, `AND` is `OutOf(len, ...)`.
    OutOf(usize, Vec<SignatureRule>),
}

impl SignatureRule {
    /// Parses rule text such as `OR('Org1MSP.admin', AND('Org1MSP.peer', 'Org1MSP.client'))`.
    pub fn parse(input: &str) -> Result<Self, PolicyError> {
        let mut parser = RuleParser {
            chars: input.chars().collect(),
            pos: 0,
        };
        let rule = parser.rule()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(PolicyError::Malformed(format!(
                "trailing input at offset {}",
                parser.pos
            )));
        }
        Ok(rule)
    }

    /// Every principal mentioned by the rule.
    pub fn principals(&self) -> Vec<(&str, &str)> {
        match self {
            Self::Principal { msp_id, role } => vec![(msp_id.as_str(), role.as_str())],
            Self::OutOf(_, rules) => rules.iter().flat_map(|rule| rule.principals()).collect(),
        }
    }
}

struct RuleParser {
    chars: Vec<char>,
    pos: usize,
}

impl RuleParser {
    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), PolicyError> {
        self.skip_ws();
        match self.chars.get(self.pos) {
            Some(c) if *c == wanted => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(PolicyError::Malformed(format!(
                "expected '{wanted}' at offset {}, found '{c}'",
                self.pos
            ))),
            None => Err(PolicyError::Malformed(format!(
                "expected '{wanted}', found end of rule"
            ))),
        }
    }

    fn word(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn rule(&mut self) -> Result<SignatureRule, PolicyError> {
        self.skip_ws();
        if self.chars.get(self.pos) == Some(&'\'') {
            return self.principal();
        }
        let op = self.word();
        self.expect('(')?;
        let threshold = if op == "OutOf" {
            let digits = self.word();
            let n = digits
                .parse::<usize>()
                .map_err(|_| PolicyError::Malformed(format!("invalid OutOf count '{digits}'")))?;
            self.expect(',')?;
            Some(n)
        } else if op == "OR" || op == "AND" {
            None
        } else {
            return Err(PolicyError::Malformed(format!("unknown operator '{op}'")));
        };
        let mut items = vec![self.rule()?];
        loop {
            self.skip_ws();
            match self.chars.get(self.pos) {
                Some(',') => {
                    self.pos += 1;
                    items.push(self.rule()?);
                }
                _ => break,
            }
        }
        self.expect(')')?;
        let n = match (op.as_str(), threshold) {
            ("OR", _) => 1,
            ("AND", _) => items.len(),
            (_, Some(n)) => n,
            _ => unreachable!("operator checked above"),
        };
        if n == 0 || n > items.len() {
            return Err(PolicyError::Malformed(format!(
                "{op} requires {n} of {} sub-rules",
                items.len()
            )));
        }
        Ok(SignatureRule::OutOf(n, items))
    }

    fn principal(&mut self) -> Result<SignatureRule, PolicyError> {
        self.expect('\'')?;
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| *c != '\'') {
            self.pos += 1;
        }
        let body: String = self.chars[start..self.pos].iter().collect();
        self.expect('\'')?;
        let (msp_id, role) = body
            .rsplit_once('.')
            .ok_or_else(|| PolicyError::Malformed(format!("principal '{body}' lacks a role")))?;
        if msp_id.is_empty() || !ROLES.contains(&role) {
            return Err(PolicyError::Malformed(format!(
                "principal '{body}' has an unknown role"
            )));
        }
        Ok(SignatureRule::Principal {
            msp_id: msp_id.to_string(),
            role: role.to_string(),
        })
    }
}

/// Checks that every policy of a new organization parses and only names the
/// organization's own MSP. Returns the offending policy name on failure.
pub fn validate_org_policies(
    policies: &OrgPolicies,
    msp_id: &str,
) -> Result<(), (&'static str, PolicyError)> {
    for (name, text) in policies.named() {
        let rule = SignatureRule::parse(text).map_err(|err| (name, err))?;
        if let Some((foreign, role)) = rule
            .principals()
            .into_iter()
            .find(|(principal, _)| *principal != msp_id)
        {
            return Err((name, PolicyError::ForeignPrincipal(format!("{foreign}.{role}"))));
        }
    }
    Ok(())
}

/// Signer id of an organization's administrator (`org1-admin`).
pub fn admin_signer(organization: &str) -> String {
    format!("{organization}-admin")
}

/// Exact set of signers whose signatures make an update binding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequiredSigners(BTreeSet<String>);

impl RequiredSigners {
    /// Builds the set from ids.
    pub fn new<I, S>(signers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(signers.into_iter().map(Into::into).collect())
    }

    /// Iterates signer ids in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Membership test.
    pub fn contains(&self, signer: &str) -> bool {
        self.0.contains(signer)
    }

    /// Number of required signers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no signature is required.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RequiredSigners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "{{{}}}", ids.join(", "))
    }
}

/// Source of truth for which members must co-sign a configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// An administrator of every existing application organization.
    #[default]
    EachOrganization,
    /// A fixed signer set; every id must be `<member-org>-admin`.
    Explicit {
        /// Required signer ids.
        signers: Vec<String>,
    },
}

impl QuorumPolicy {
    /// Resolves the signers required for `change` against the fetched config.
    ///
    /// Endpoint announcements only need the owning organization's admin.
    pub fn required_for(
        &self,
        config: &ChannelConfig,
        change: &ConfigChange,
    ) -> Result<RequiredSigners, PolicyError> {
        if let ConfigChange::AddNodeEndpoint { msp_id, .. } = change {
            let owner = config
                .organizations
                .get(msp_id)
                .ok_or_else(|| PolicyError::UnknownSigner(admin_signer(msp_id)))?;
            return Ok(RequiredSigners::new([admin_signer(&owner.name)]));
        }
        let members: BTreeSet<String> = config
            .organizations
            .values()
            .map(|org| admin_signer(&org.name))
            .collect();
        let required = match self {
            Self::EachOrganization => members,
            Self::Explicit { signers } => {
                if let Some(unknown) = signers.iter().find(|id| !members.contains(*id)) {
                    return Err(PolicyError::UnknownSigner(unknown.clone()));
                }
                signers.iter().cloned().collect()
            }
        };
        if required.is_empty() {
            return Err(PolicyError::EmptyQuorum);
        }
        Ok(RequiredSigners(required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fixtures::{org, two_org_channel};
    use crate::model::Endpoint;

    #[test]
    fn standard_policies_validate() {
        let policies = OrgPolicies::standard("Org3MSP");
        assert!(validate_org_policies(&policies, "Org3MSP").is_ok());
    }

    #[test]
    fn nested_rules_parse() {
        let rule =
            SignatureRule::parse("OutOf(2, 'A.admin', AND('B.peer', 'B.client'), 'C.member')")
                .unwrap();
        assert_eq!(rule.principals().len(), 4);
        match rule {
            SignatureRule::OutOf(n, items) => {
                assert_eq!(n, 2);
                assert_eq!(items.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_rules_are_rejected() {
        for text in [
            "",
            "OR(",
            "OR('Org3MSP.admin'",
            "XOR('Org3MSP.admin')",
            "OR('Org3MSP.superuser')",
            "OutOf(3, 'A.admin', 'B.admin')",
            "OR('Org3MSP.admin') extra",
        ] {
            assert!(SignatureRule::parse(text).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn foreign_principal_is_reported_with_policy_name() {
        let mut policies = OrgPolicies::standard("Org3MSP");
        policies.writers = "OR('Org1MSP.admin')".into();
        let (name, err) = validate_org_policies(&policies, "Org3MSP").unwrap_err();
        assert_eq!(name, "Writers");
        assert!(matches!(err, PolicyError::ForeignPrincipal(_)));
    }

    #[test]
    fn each_organization_requires_every_existing_admin() {
        let config = two_org_channel();
        let change = ConfigChange::AddOrganization(org("org3", "Org3MSP"));
        let required = QuorumPolicy::EachOrganization
            .required_for(&config, &change)
            .unwrap();
        assert_eq!(required, RequiredSigners::new(["org1-admin", "org2-admin"]));
    }

    #[test]
    fn explicit_policy_rejects_non_members() {
        let config = two_org_channel();
        let change = ConfigChange::AddOrganization(org("org3", "Org3MSP"));
        let policy = QuorumPolicy::Explicit {
            signers: vec!["org1-admin".into(), "org9-admin".into()],
        };
        assert_eq!(
            policy.required_for(&config, &change),
            Err(PolicyError::UnknownSigner("org9-admin".into()))
        );
    }

    #[test]
    fn endpoint_announcement_needs_only_owner() {
        let config = two_org_channel();
        let change = ConfigChange::AddNodeEndpoint {
            msp_id: "Org1MSP".into(),
            endpoint: Endpoint::new("peer1.org1.example.com", 8051),
        };
        let required = QuorumPolicy::EachOrganization
            .required_for(&config, &change)
            .unwrap();
        assert_eq!(required, RequiredSigners::new(["org1-admin"]));
    }
}
