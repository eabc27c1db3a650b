//! Data types shared across the relay
//!
//! - `error`: the crate-wide error enum
//! - tenant identity and the two-tier capability model
//! - raw and normalized message shapes

pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TenantId = i64;

/// Role of the calling tenant as asserted by the outer auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// What a tenant may see, resolved once per request.
///
/// Every place where behaviour differs between admins and regular tenants
/// matches on this type, so both branches are always spelled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// No recipient restriction. `watch` only widens the server-side search
    /// and is never used to drop messages.
    Privileged { watch: Vec<String> },
    /// Restricted to messages addressed to one of `allowed_recipients`.
    Standard { allowed_recipients: Vec<String> },
}

impl Capability {
    pub fn for_role(role: Role, recipients: Vec<String>) -> Self {
        match role {
            Role::Admin => Capability::Privileged { watch: recipients },
            Role::User => Capability::Standard {
                allowed_recipients: recipients,
            },
        }
    }

    /// A Standard tenant with nothing on its allowlist can see nothing.
    pub fn is_empty_grant(&self) -> bool {
        match self {
            Capability::Privileged { .. } => false,
            Capability::Standard { allowed_recipients } => allowed_recipients.is_empty(),
        }
    }

    /// Whether a free-text search term stays inside the recipient grant.
    ///
    /// The term must contain, or be contained by, an allowed address.
    pub fn permits_search(&self, term: &str) -> bool {
        match self {
            Capability::Privileged { .. } => true,
            Capability::Standard { allowed_recipients } => {
                let term = term.to_lowercase();
                allowed_recipients
                    .iter()
                    .any(|addr| term.contains(addr.as_str()) || addr.contains(term.as_str()))
            }
        }
    }

    /// Recipient check applied to every parsed message.
    pub fn permits_recipient(&self, to_lower: &str) -> bool {
        match self {
            Capability::Privileged { .. } => true,
            Capability::Standard { allowed_recipients } => allowed_recipients
                .iter()
                .any(|addr| to_lower.contains(addr.as_str())),
        }
    }
}

/// Subject pattern row owned by the pattern store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPattern {
    pub id: i64,
    pub name: String,
    /// Substring matched case-insensitively against a subject
    pub pattern: String,
    pub description: String,
    pub active: bool,
}

/// Per-tenant grant owned by the pattern store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPermission {
    pub tenant_id: TenantId,
    pub enabled_pattern_ids: BTreeSet<i64>,
    /// Lower-cased, in insertion order, without duplicates
    pub allowed_recipients: Vec<String>,
}

/// One candidate as delivered by the mail server
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    /// Full RFC 5322 source (headers and body)
    pub bytes: Vec<u8>,
}

/// Tenant-visible message shape, rebuilt on every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub from_address: String,
    pub to_address: String,
    /// Rendered HTML when present, plain text otherwise
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub keyword_tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard(addrs: &[&str]) -> Capability {
        Capability::for_role(Role::User, addrs.iter().map(|a| a.to_string()).collect())
    }

    #[test]
    fn test_search_term_must_overlap_allowlist() {
        let cap = standard(&["alice@example.com"]);
        assert!(cap.permits_search("alice@example.com"));
        assert!(cap.permits_search("ALICE@example"));
        assert!(cap.permits_search("to: alice@example.com please"));
        assert!(!cap.permits_search("bob@example.com"));
    }

    #[test]
    fn test_privileged_is_unrestricted() {
        let cap = Capability::for_role(Role::Admin, vec![]);
        assert!(cap.permits_search("anyone@anywhere"));
        assert!(cap.permits_recipient("bob@example.com"));
        assert!(!cap.is_empty_grant());
    }

    #[test]
    fn test_empty_standard_grant_admits_nothing() {
        let cap = standard(&[]);
        assert!(cap.is_empty_grant());
        assert!(!cap.permits_recipient("alice@example.com"));
        assert!(!cap.permits_search("alice@example.com"));
    }
}
