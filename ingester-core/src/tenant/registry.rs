//! Process-wide tenant registry

use super::{validate_tenant, TenantTable};
use crate::chunk::ChunkEncoding;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Tenant id -> table. Tables are created lazily and never removed while
/// the process runs.
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<TenantTable>>,
    encoding: &'static dyn ChunkEncoding,
}

impl TenantRegistry {
    pub fn new(encoding: &'static dyn ChunkEncoding) -> Self {
        Self {
            tenants: DashMap::new(),
            encoding,
        }
    }

    /// Get or create the table for a tenant
    pub fn get_or_create(&self, tenant: &str) -> Result<Arc<TenantTable>> {
        let tenant = validate_tenant(tenant)?;

        if let Some(table) = self.tenants.get(tenant) {
            return Ok(table.value().clone());
        }

        let table = self
            .tenants
            .entry(tenant.to_string())
            .or_insert_with(|| {
                info!(tenant, "Created tenant table");
                Arc::new(TenantTable::new(tenant, self.encoding))
            })
            .value()
            .clone();
        Ok(table)
    }

    /// Get the table for a tenant without creating it
    pub fn get(&self, tenant: &str) -> Result<Option<Arc<TenantTable>>> {
        let tenant = validate_tenant(tenant)?;
        Ok(self.tenants.get(tenant).map(|t| t.value().clone()))
    }

    /// Snapshot of all tables, sorted by tenant id
    pub fn tenants(&self) -> Vec<Arc<TenantTable>> {
        let mut tables: Vec<_> = self.tenants.iter().map(|t| t.value().clone()).collect();
        tables.sort_by(|a, b| a.id().cmp(b.id()));
        tables
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodingKind;
    use crate::{IngesterError, Metric};

    #[test]
    fn test_registry_isolates_tenants() {
        let registry = TenantRegistry::new(EncodingKind::Gorilla.codec());
        let metric = Metric::named("up");

        let a = registry.get_or_create("a").unwrap();
        let b = registry.get_or_create("b").unwrap();
        a.get_or_create_series(&metric);

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert!(Arc::ptr_eq(&a, &registry.get_or_create("a").unwrap()));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.tenants().iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_missing_tenant_id() {
        let registry = TenantRegistry::new(EncodingKind::Gorilla.codec());

        assert!(matches!(registry.get_or_create(""), Err(IngesterError::NoTenant)));
        assert!(matches!(registry.get("  "), Err(IngesterError::NoTenant)));
        assert!(registry.get("nobody").unwrap().is_none());
        assert!(registry.is_empty());
    }
}
