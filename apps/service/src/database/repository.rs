use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Row, params};
use tracing::warn;

use super::models::{AlertState, Owner, i64_to_timestamp, timestamp_to_i64};
use crate::checks::{
    CheckConfig, CheckId, CheckKind, CheckResult, CheckSpec, HttpDetail, OwnerId, ResultDetail,
    TlsDetail,
};
use crate::pool::{LibsqlManager, LibsqlPool};

const CHECK_COLUMNS: &str = "id, owner_id, kind, url, host, port, enabled, created_at, updated_at";

/// Persistence of check definitions and their owners
#[async_trait]
pub trait CheckStore: Send + Sync {
    /// All enabled checks, used once at startup to repopulate the scheduler
    async fn load_active_checks(&self) -> Result<Vec<CheckSpec>>;

    async fn get_check(&self, id: CheckId) -> Result<Option<CheckSpec>>;

    async fn list_checks_by_owner(&self, owner: OwnerId) -> Result<Vec<CheckSpec>>;

    async fn insert_check(&self, spec: &CheckSpec) -> Result<()>;

    async fn update_check(&self, spec: &CheckSpec) -> Result<()>;

    /// Delete a check together with its results and alert state
    async fn delete_check(&self, id: CheckId) -> Result<()>;

    async fn create_owner(&self, owner: &Owner) -> Result<()>;

    async fn get_owner(&self, id: OwnerId) -> Result<Option<Owner>>;
}

/// Persistence of check results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write a batch in one transaction; either all rows land or none
    async fn commit_results(&self, batch: &[CheckResult]) -> Result<()>;

    /// Most recent results of a check, newest first
    async fn recent_results(&self, id: CheckId, limit: usize) -> Result<Vec<CheckResult>>;

    async fn create_result(&self, result: &CheckResult) -> Result<()> {
        self.commit_results(std::slice::from_ref(result)).await
    }
}

/// Persistence of per-check alert state
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_alert_state(&self, id: CheckId) -> Result<Option<AlertState>>;

    /// Insert or update; a state whose check no longer exists is not written
    async fn upsert_alert_state(&self, state: &AlertState) -> Result<()>;

    async fn delete_alert_state(&self, id: CheckId) -> Result<()>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    fn check_from_row(row: &Row) -> Result<CheckSpec> {
        let id: String = row.get(0)?;
        let owner: String = row.get(1)?;
        let kind: String = row.get(2)?;

        let config = match kind.parse::<CheckKind>()? {
            CheckKind::Http => CheckConfig::Http {
                url: row.get::<Option<String>>(3)?.ok_or_else(|| anyhow!("HTTP check {} has no url", id))?,
            },
            CheckKind::Tls => CheckConfig::Tls {
                host: row.get::<Option<String>>(4)?.ok_or_else(|| anyhow!("TLS check {} has no host", id))?,
                port: u16::try_from(row.get::<Option<i64>>(5)?.unwrap_or(443))
                    .with_context(|| format!("TLS check {} has an invalid port", id))?,
            },
        };

        Ok(CheckSpec {
            id: id.parse()?,
            owner: owner.parse()?,
            config,
            enabled: row.get::<i64>(6)? != 0,
            created_at: i64_to_timestamp(row.get(7)?),
            updated_at: i64_to_timestamp(row.get(8)?),
        })
    }

    async fn query_checks(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<CheckSpec>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(sql, params).await?;
        let mut checks = Vec::new();

        while let Some(row) = rows.next().await? {
            match Self::check_from_row(&row) {
                Ok(check) => checks.push(check),
                Err(e) => warn!("Skipping unreadable check row: {}", e),
            }
        }

        Ok(checks)
    }

    /// Config columns (url, host, port) of a check
    fn config_columns(config: &CheckConfig) -> (Option<String>, Option<String>, Option<i64>) {
        match config {
            CheckConfig::Http { url } => (Some(url.clone()), None, None),
            CheckConfig::Tls { host, port } => (None, Some(host.clone()), Some(*port as i64)),
        }
    }

    async fn insert_result(conn: &Connection, result: &CheckResult) -> Result<()> {
        let created_at = timestamp_to_i64(Utc::now());

        match &result.detail {
            ResultDetail::Http(detail) => {
                conn.execute(
                    "INSERT INTO http_results (check_id, timestamp, success, status_code, duration_ms, error, created_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 WHERE EXISTS (SELECT 1 FROM checks WHERE id = ?1)",
                    params![
                        result.check_id.to_string(),
                        timestamp_to_i64(result.timestamp),
                        if result.success { 1 } else { 0 },
                        detail.status_code.map(|v| v as i64),
                        result.duration_ms as i64,
                        detail.error.clone(),
                        created_at
                    ],
                )
                .await?;
            }
            ResultDetail::Tls(detail) => {
                conn.execute(
                    "INSERT INTO tls_results (check_id, timestamp, success, tls_version, cipher_suite, expiry, duration_ms, error, created_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9 WHERE EXISTS (SELECT 1 FROM checks WHERE id = ?1)",
                    params![
                        result.check_id.to_string(),
                        timestamp_to_i64(result.timestamp),
                        if result.success { 1 } else { 0 },
                        detail.tls_version.clone(),
                        detail.cipher_suite.clone(),
                        detail.expiry.map(timestamp_to_i64),
                        result.duration_ms as i64,
                        detail.error.clone(),
                        created_at
                    ],
                )
                .await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl CheckStore for DatabaseImpl {
    async fn load_active_checks(&self) -> Result<Vec<CheckSpec>> {
        self.query_checks(&format!("SELECT {CHECK_COLUMNS} FROM checks WHERE enabled = 1"), ())
            .await
    }

    async fn get_check(&self, id: CheckId) -> Result<Option<CheckSpec>> {
        let checks = self
            .query_checks(
                &format!("SELECT {CHECK_COLUMNS} FROM checks WHERE id = ?"),
                params![id.to_string()],
            )
            .await?;
        Ok(checks.into_iter().next())
    }

    async fn list_checks_by_owner(&self, owner: OwnerId) -> Result<Vec<CheckSpec>> {
        self.query_checks(
            &format!("SELECT {CHECK_COLUMNS} FROM checks WHERE owner_id = ? ORDER BY created_at"),
            params![owner.to_string()],
        )
        .await
    }

    async fn insert_check(&self, spec: &CheckSpec) -> Result<()> {
        let conn = self.get_conn().await?;
        let (url, host, port) = Self::config_columns(&spec.config);

        conn.execute(
            &format!("INSERT INTO checks ({CHECK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                spec.id.to_string(),
                spec.owner.to_string(),
                spec.kind().as_str(),
                url,
                host,
                port,
                if spec.enabled { 1 } else { 0 },
                timestamp_to_i64(spec.created_at),
                timestamp_to_i64(spec.updated_at)
            ],
        )
        .await?;

        Ok(())
    }

    async fn update_check(&self, spec: &CheckSpec) -> Result<()> {
        let conn = self.get_conn().await?;
        let (url, host, port) = Self::config_columns(&spec.config);

        let updated = conn
            .execute(
                "UPDATE checks SET kind = ?, url = ?, host = ?, port = ?, enabled = ?, updated_at = ? WHERE id = ?",
                params![
                    spec.kind().as_str(),
                    url,
                    host,
                    port,
                    if spec.enabled { 1 } else { 0 },
                    timestamp_to_i64(spec.updated_at),
                    spec.id.to_string()
                ],
            )
            .await?;

        if updated == 0 {
            return Err(anyhow!("no check with id {}", spec.id));
        }
        Ok(())
    }

    async fn delete_check(&self, id: CheckId) -> Result<()> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let id = id.to_string();

        for sql in [
            "DELETE FROM http_results WHERE check_id = ?",
            "DELETE FROM tls_results WHERE check_id = ?",
            "DELETE FROM alert_states WHERE check_id = ?",
            "DELETE FROM checks WHERE id = ?",
        ] {
            if let Err(e) = tx.execute(sql, params![id.clone()]).await {
                tx.rollback().await?;
                return Err(e.into());
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_owner(&self, owner: &Owner) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO owners (id, email, created_at) VALUES (?, ?, ?)",
            params![owner.id.to_string(), owner.email.clone(), timestamp_to_i64(owner.created_at)],
        )
        .await?;
        Ok(())
    }

    async fn get_owner(&self, id: OwnerId) -> Result<Option<Owner>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT id, email, created_at FROM owners WHERE id = ?", params![id.to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => {
                let id: String = row.get(0)?;
                Ok(Some(Owner {
                    id: id.parse()?,
                    email: row.get(1)?,
                    created_at: i64_to_timestamp(row.get(2)?),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResultStore for DatabaseImpl {
    async fn commit_results(&self, batch: &[CheckResult]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        for result in batch {
            if let Err(e) = Self::insert_result(&tx, result).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback after failed insert also failed: {}", rollback);
                }
                return Err(e.context(format!("unable to insert result of check {}", result.check_id)));
            }
        }

        tx.commit().await.context("unable to commit result batch")?;
        Ok(())
    }

    async fn recent_results(&self, id: CheckId, limit: usize) -> Result<Vec<CheckResult>> {
        // Before taking a connection: the lookup takes one of its own
        let check = self.get_check(id).await?.ok_or_else(|| anyhow!("no check with id {}", id))?;
        let conn = self.get_conn().await?;
        let mut results = Vec::new();

        match check.kind() {
            CheckKind::Http => {
                let mut rows = conn
                    .query(
                        "SELECT timestamp, success, status_code, duration_ms, error FROM http_results
                         WHERE check_id = ? ORDER BY timestamp DESC LIMIT ?",
                        params![id.to_string(), limit as i64],
                    )
                    .await?;

                while let Some(row) = rows.next().await? {
                    results.push(CheckResult {
                        check_id: id,
                        owner: check.owner,
                        timestamp: i64_to_timestamp(row.get(0)?),
                        success: row.get::<i64>(1)? != 0,
                        duration_ms: row.get::<i64>(3)? as u64,
                        detail: ResultDetail::Http(HttpDetail {
                            status_code: row.get::<Option<i64>>(2)?.map(|v| v as u16),
                            error: row.get(4)?,
                        }),
                    });
                }
            }
            CheckKind::Tls => {
                let mut rows = conn
                    .query(
                        "SELECT timestamp, success, tls_version, cipher_suite, expiry, duration_ms, error FROM tls_results
                         WHERE check_id = ? ORDER BY timestamp DESC LIMIT ?",
                        params![id.to_string(), limit as i64],
                    )
                    .await?;

                while let Some(row) = rows.next().await? {
                    results.push(CheckResult {
                        check_id: id,
                        owner: check.owner,
                        timestamp: i64_to_timestamp(row.get(0)?),
                        success: row.get::<i64>(1)? != 0,
                        duration_ms: row.get::<i64>(5)? as u64,
                        detail: ResultDetail::Tls(TlsDetail {
                            tls_version: row.get(2)?,
                            cipher_suite: row.get(3)?,
                            expiry: row.get::<Option<i64>>(4)?.map(i64_to_timestamp),
                            error: row.get(6)?,
                        }),
                    });
                }
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl AlertStore for DatabaseImpl {
    async fn get_alert_state(&self, id: CheckId) -> Result<Option<AlertState>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT check_id, kind, owner_id, failed_since, last_notified, consecutive_failures
                 FROM alert_states WHERE check_id = ?",
                params![id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let check_id: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let owner: String = row.get(2)?;
                Ok(Some(AlertState {
                    check_id: check_id.parse()?,
                    kind: kind.parse()?,
                    owner: owner.parse()?,
                    failed_since: row.get::<Option<i64>>(3)?.map(i64_to_timestamp),
                    last_notified: row.get::<Option<i64>>(4)?.map(i64_to_timestamp),
                    consecutive_failures: row.get::<i64>(5)?.max(0) as u32,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_alert_state(&self, state: &AlertState) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO alert_states (check_id, kind, owner_id, failed_since, last_notified, consecutive_failures, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 WHERE EXISTS (SELECT 1 FROM checks WHERE id = ?1)
             ON CONFLICT(check_id) DO UPDATE SET
                failed_since = excluded.failed_since,
                last_notified = excluded.last_notified,
                consecutive_failures = excluded.consecutive_failures,
                updated_at = excluded.updated_at",
            params![
                state.check_id.to_string(),
                state.kind.as_str(),
                state.owner.to_string(),
                state.failed_since.map(timestamp_to_i64),
                state.last_notified.map(timestamp_to_i64),
                state.consecutive_failures as i64,
                timestamp_to_i64(Utc::now())
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_alert_state(&self, id: CheckId) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM alert_states WHERE check_id = ?", params![id.to_string()])
            .await?;
        Ok(())
    }
}
