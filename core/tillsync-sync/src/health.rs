//! Tenant-binding self-check.

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::remote::Profile;
use serde::Serialize;
use tillsync_types::{TenantId, UserId};
use tracing::{info, warn};

/// Result of [`SyncEngine::verify_tenant_binding`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BindingCheck {
    /// Local and server-side bindings agree.
    Verified { tenant: TenantId },
    /// The server-side binding was missing or different and has been
    /// rewritten from the local one.
    RepairedRemote {
        tenant: TenantId,
        previous: Option<TenantId>,
    },
    /// The device had no binding and adopted the server-side one.
    AdoptedRemote { tenant: TenantId },
}

impl BindingCheck {
    pub fn tenant(&self) -> &TenantId {
        match self {
            BindingCheck::Verified { tenant }
            | BindingCheck::RepairedRemote { tenant, .. }
            | BindingCheck::AdoptedRemote { tenant } => tenant,
        }
    }
}

impl SyncEngine {
    /// Compares the device's tenant with the one recorded server-side for
    /// `user` and repairs whichever side is missing or wrong. The local
    /// binding wins. Queued realtime subscriptions are retried afterwards.
    pub async fn verify_tenant_binding(&self, user: &UserId) -> SyncResult<BindingCheck> {
        let local = self.tenant().await?;
        let profile = self.bounded(self.remote.fetch_profile(user)).await?;
        let remote = profile.as_ref().and_then(|p| p.tenant_id.clone());

        let check = match (local, remote) {
            (Some(local), Some(remote)) if local == remote => {
                return Ok(BindingCheck::Verified { tenant: local });
            }
            (Some(local), previous) => {
                warn!(
                    user = %user,
                    local = %local,
                    remote = ?previous,
                    "server-side tenant binding missing or wrong, repairing"
                );
                let profile = Profile {
                    id: *user,
                    tenant_id: Some(local.clone()),
                };
                self.bounded(self.remote.upsert_profile(&profile)).await?;
                BindingCheck::RepairedRemote {
                    tenant: local,
                    previous,
                }
            }
            (None, Some(remote)) => {
                info!(user = %user, tenant = %remote, "adopting server-side tenant binding");
                let bound = remote.clone();
                self.blocking(move |store| store.bind_tenant(&bound))
                    .await?;
                BindingCheck::AdoptedRemote { tenant: remote }
            }
            (None, None) => {
                return Err(SyncError::TenantBinding(format!(
                    "user {user} has no tenant locally or server-side"
                )));
            }
        };

        self.retry_subscriptions().await;
        Ok(check)
    }
}
