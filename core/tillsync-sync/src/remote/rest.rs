//! PostgREST-style HTTP client for the remote store.

use super::{
    DELETED_AT_COLUMN, PROFILES_TABLE, Profile, RemoteStore, TENANT_COLUMN, check_scope,
    owned_by,
};
use crate::error::{SyncError, SyncResult};
use crate::transform::RemoteRow;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::TableSpec;
use tillsync_types::{TenantId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";

/// Remote store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Project base URL (e.g. `https://abc.example.co`).
    pub base_url: String,
    /// Public API key sent on every request.
    pub api_key: String,
    /// User access token; the API key is used as bearer when absent.
    pub access_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            access_token: None,
            timeout_secs: 30,
        }
    }
}

/// Remote store reached over its REST interface.
pub struct RestRemoteStore {
    config: RestConfig,
    client: Client,
    access_token: Arc<RwLock<Option<String>>>,
}

impl RestRemoteStore {
    pub fn new(config: RestConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;

        let access_token = Arc::new(RwLock::new(config.access_token.clone()));
        Ok(Self {
            config,
            client,
            access_token,
        })
    }

    /// Replaces the user access token (e.g. after a session refresh).
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table
        )
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().await.clone();
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(token.unwrap_or_else(|| self.config.api_key.clone()))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> SyncResult<Response> {
        let response = self
            .authorized(request)
            .await
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SyncError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn read_rows(response: Response, context: &str) -> SyncResult<Vec<RemoteRow>> {
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("{context}: unreadable body: {e}")))
    }
}

/// Union of the keys of every row, sorted. Bulk inserts require all objects
/// to share one key set unless the column list is given explicitly.
fn column_list(rows: &[RemoteRow]) -> String {
    rows.iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",")
}

fn transport_error(context: &str, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Offline(format!("{context}: {e}"))
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    fn provider_name(&self) -> &'static str {
        "PostgREST"
    }

    async fn is_online(&self) -> bool {
        let request = self.client.get(format!(
            "{}/rest/v1/",
            self.config.base_url.trim_end_matches('/')
        ));
        // Any HTTP answer, even an error status, means the server is reachable.
        self.authorized(request).await.send().await.is_ok()
    }

    async fn upsert(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
        rows: Vec<RemoteRow>,
    ) -> SyncResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        check_scope(tenant, &rows)?;

        let request = self
            .client
            .post(self.table_url(spec.remote_table))
            .query(&[
                ("on_conflict", spec.conflict_key.on_conflict()),
                ("columns", column_list(&rows)),
            ])
            .header("Prefer", UPSERT_PREFER)
            .json(&rows);
        self.send(request, "upsert").await?;
        debug!(table = spec.remote_table, rows = rows.len(), "upserted rows");
        Ok(())
    }

    async fn select_active(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
    ) -> SyncResult<Vec<RemoteRow>> {
        let request = self.client.get(self.table_url(spec.remote_table)).query(&[
            ("select", "*".to_string()),
            (TENANT_COLUMN, format!("eq.{tenant}")),
            (DELETED_AT_COLUMN, "is.null".to_string()),
        ]);
        let response = self.send(request, "select").await?;
        let rows = Self::read_rows(response, "select").await?;

        let total = rows.len();
        let rows: Vec<RemoteRow> = rows.into_iter().filter(|r| owned_by(r, tenant)).collect();
        if rows.len() != total {
            warn!(
                table = spec.remote_table,
                dropped = total - rows.len(),
                "remote returned rows of another tenant"
            );
        }
        Ok(rows)
    }

    async fn fetch_profile(&self, user: &UserId) -> SyncResult<Option<Profile>> {
        let request = self
            .client
            .get(self.table_url(PROFILES_TABLE))
            .query(&[("select", "*".to_string()), ("id", format!("eq.{user}"))]);
        let response = self.send(request, "fetch profile").await?;
        let profiles: Vec<Profile> = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("fetch profile: unreadable body: {e}")))?;
        Ok(profiles.into_iter().next())
    }

    async fn upsert_profile(&self, profile: &Profile) -> SyncResult<()> {
        let request = self
            .client
            .post(self.table_url(PROFILES_TABLE))
            .query(&[("on_conflict", "id")])
            .header("Prefer", UPSERT_PREFER)
            .json(&[profile]);
        self.send(request, "upsert profile").await?;
        Ok(())
    }
}
