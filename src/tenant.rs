//! Tenant scoping.
//!
//! Every tenant-owned store operation takes a [`TenantScope`]. A scope can
//! only be minted from a loaded [`Company`] row, so forgetting the tenant
//! filter is a compile error rather than a cross-tenant read.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::db::{Channel, Company, DatabaseError, DatabaseManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantScope {
    company_id: i64,
}

impl TenantScope {
    pub(crate) fn from_company(company: &Company) -> Self {
        Self {
            company_id: company.id,
        }
    }

    pub fn company_id(&self) -> i64 {
        self.company_id
    }

    /// Rejects rows that carry another tenant's company id.
    pub fn ensure_owns(&self, entity: &'static str, company_id: i64) -> Result<(), TenantError> {
        if company_id == self.company_id {
            Ok(())
        } else {
            Err(TenantError::Mismatch {
                entity,
                expected: self.company_id,
                found: company_id,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("channel {0} not found")]
    UnknownChannel(i64),
    #[error("company {0} not found")]
    UnknownCompany(i64),
    #[error("{entity} belongs to company {found}, expected {expected}")]
    Mismatch {
        entity: &'static str,
        expected: i64,
        found: i64,
    },
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A resolved tenant: the company row and the scope token minted from it.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub company: Company,
    pub scope: TenantScope,
}

#[derive(Clone)]
pub struct TenantContext {
    db_manager: Arc<DatabaseManager>,
}

impl TenantContext {
    pub fn new(db_manager: Arc<DatabaseManager>) -> Self {
        Self { db_manager }
    }

    pub async fn for_company(&self, company_id: i64) -> Result<Tenant, TenantError> {
        let company = self
            .db_manager
            .tenant_store()
            .get_company(company_id)
            .await?
            .ok_or(TenantError::UnknownCompany(company_id))?;
        let scope = TenantScope::from_company(&company);
        Ok(Tenant { company, scope })
    }

    /// Resolves the owning tenant of a channel. This is the only unscoped
    /// channel lookup; everything after it runs under the returned scope.
    pub async fn for_channel(&self, channel_id: i64) -> Result<(Tenant, Channel), TenantError> {
        let channel = self
            .db_manager
            .tenant_store()
            .find_channel_unscoped(channel_id)
            .await?
            .ok_or(TenantError::UnknownChannel(channel_id))?;
        let tenant = self
            .for_company(channel.company_id)
            .await
            .map_err(|err| match err {
                TenantError::UnknownCompany(_) => TenantError::UnknownChannel(channel_id),
                other => other,
            })?;
        debug!(
            "resolved channel_id={} to company_id={} slug={}",
            channel.id, tenant.company.id, tenant.company.slug
        );
        Ok((tenant, channel))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{TenantError, TenantScope};
    use crate::db::Company;

    fn company(id: i64) -> Company {
        Company {
            id,
            name: format!("company {id}"),
            slug: format!("company-{id}"),
            settings: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn scope_accepts_own_rows() {
        let scope = TenantScope::from_company(&company(7));
        assert_eq!(scope.company_id(), 7);
        assert!(scope.ensure_owns("contact", 7).is_ok());
    }

    #[test]
    fn scope_rejects_foreign_rows() {
        let scope = TenantScope::from_company(&company(7));
        let err = scope.ensure_owns("bot", 8).expect_err("foreign row");
        assert!(matches!(
            err,
            TenantError::Mismatch {
                entity: "bot",
                expected: 7,
                found: 8
            }
        ));
    }
}
