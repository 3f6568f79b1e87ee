//! Cluster-wide mutex held in etcd.
//!
//! Uses the etcd v3 JSON gateway: a lease-scoped key created under a
//! create-revision guard. Contention resolves by polling; the lease TTL
//! bounds how long a crashed holder can wedge the cluster.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tracing::debug;

use crate::constants::ETCD_CLIENT_PORT;
use crate::kubernetes::{ClientError, ClusterLock};

/// Lease TTL; a crashed holder frees the lock after this.
const LOCK_LEASE_TTL_SECS: u64 = 60;

/// Poll step while the lock is contended.
const LOCK_RETRY_STEP: Duration = Duration::from_millis(500);

/// [`ClusterLock`] over the local etcd member.
pub struct EtcdLeaseLock {
    client: reqwest::Client,
    base: String,
    lease_id: tokio::sync::Mutex<Option<String>>,
}

impl EtcdLeaseLock {
    /// Lock through the local etcd member.
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base(client, format!("https://localhost:{ETCD_CLIENT_PORT}"))
    }

    /// Lock through a specific etcd endpoint.
    pub fn with_base(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
            lease_id: tokio::sync::Mutex::new(None),
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn grant_lease(&self) -> Result<String, ClientError> {
        let response = self
            .post("/v3/lease/grant", json!({"TTL": LOCK_LEASE_TTL_SECS}))
            .await?;

        response["ID"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Transport("lease grant without ID".to_string()))
    }

    /// One compare-and-put attempt. True when the lock was taken.
    async fn try_lock(&self, key: &str, lease_id: &str) -> Result<bool, ClientError> {
        let key_b64 = base64::engine::general_purpose::STANDARD.encode(key);
        let value_b64 = base64::engine::general_purpose::STANDARD.encode(lease_id);

        let response = self
            .post(
                "/v3/kv/txn",
                json!({
                    "compare": [{
                        "key": key_b64,
                        "target": "CREATE",
                        "create_revision": "0",
                    }],
                    "success": [{
                        "request_put": {
                            "key": key_b64,
                            "value": value_b64,
                            "lease": lease_id,
                        },
                    }],
                }),
            )
            .await?;

        Ok(response["succeeded"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl ClusterLock for EtcdLeaseLock {
    async fn acquire(&self, key: &str) -> Result<(), ClientError> {
        let lease_id = self.grant_lease().await?;

        loop {
            if self.try_lock(key, &lease_id).await? {
                *self.lease_id.lock().await = Some(lease_id);
                return Ok(());
            }

            debug!(key, "manifest apply lock contended");
            tokio::time::sleep(LOCK_RETRY_STEP).await;
        }
    }

    async fn release(&self, key: &str) -> Result<(), ClientError> {
        let key_b64 = base64::engine::general_purpose::STANDARD.encode(key);

        self.post("/v3/kv/deleterange", json!({"key": key_b64}))
            .await?;

        if let Some(lease_id) = self.lease_id.lock().await.take() {
            self.post("/v3/lease/revoke", json!({"ID": lease_id})).await?;
        }

        Ok(())
    }
}
