//! Business logic services
//!
//! Services depend on the `Mailbox` and `PatternStore` seams rather than on
//! concrete adapters, so they can be exercised without a server or a file.

mod fetch_pipeline;
mod retrieval_service;

pub use fetch_pipeline::*;
pub use retrieval_service::*;

use crate::types::error::Result;
use crate::types::{Role, TenantId};

/// Read side of the subject-pattern store
pub trait PatternStore: Send + Sync {
    /// Lower-cased patterns the tenant may see: every active pattern for an
    /// admin, enabled-and-active ones otherwise.
    fn permitted_patterns(&self, tenant_id: TenantId, role: Role) -> Result<Vec<String>>;

    /// Lower-cased recipient allowlist; empty for an admin means unrestricted.
    fn allowed_recipients(&self, tenant_id: TenantId) -> Result<Vec<String>>;
}
