//! Tenant isolation
//!
//! The registry maps tenant ids to tables; each table maps series
//! fingerprints to buffers and keeps an inverted label index for matching.

mod registry;
mod table;

pub use registry::TenantRegistry;
pub use table::TenantTable;

use crate::{IngesterError, Result};

/// Validate a tenant id supplied by the caller
pub fn validate_tenant(tenant: &str) -> Result<&str> {
    let trimmed = tenant.trim();
    if trimmed.is_empty() {
        return Err(IngesterError::NoTenant);
    }
    Ok(trimmed)
}
