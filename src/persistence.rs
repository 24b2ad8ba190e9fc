// Copyright 2025 Cowboy AI, LLC.

//! The relational store backing `bus`/`rule`/`version`/`event_schema`
//! (§6), plus the two control-plane reflectors (component, reflecting
//! §4.F) that turn a version-counter bump into a keyset-paginated listing
//! and a diff against the last snapshot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{BusBinding, BusMode};
use crate::errors::{EventBridgeError, Result};
use crate::informer::Reflector;
use crate::rule::{Rule, RuleStatus};

const PAGE_SIZE: i64 = 100;

/// Open the connection pool backing the `bus`/`rule`/`version`/
/// `event_schema` tables.
pub async fn connect(dsn: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(dsn)
        .await
        .map_err(EventBridgeError::Storage)
}

/// Run embedded migrations, creating the tables and seeding the `Default`
/// bus and the two version rows (§6).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct BusRow {
    id: i64,
    name: String,
    mode: i16,
    source_topic: String,
    source_delay_topic: String,
    target_exp_decay_topic: String,
    target_backoff_topic: String,
}

impl TryFrom<BusRow> for BusBinding {
    type Error = EventBridgeError;

    fn try_from(row: BusRow) -> Result<Self> {
        let mode = match row.mode {
            0 => BusMode::Concurrent,
            1 => BusMode::Orderly,
            other => {
                return Err(EventBridgeError::Config(format!(
                    "bus {}: unknown mode discriminant {other}",
                    row.name
                )))
            }
        };
        Ok(BusBinding {
            name: row.name,
            mode,
            source_topic: row.source_topic,
            source_delay_topic: row.source_delay_topic,
            target_exp_decay_topic: row.target_exp_decay_topic,
            target_backoff_topic: row.target_backoff_topic,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    bus_name: String,
    status: i16,
    pattern: String,
    targets: serde_json::Value,
}

impl TryFrom<RuleRow> for Rule {
    type Error = EventBridgeError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let targets = serde_json::from_value(row.targets).map_err(EventBridgeError::DataUnmarshalError)?;
        let status = match row.status {
            0 => RuleStatus::Disable,
            1 => RuleStatus::Enable,
            other => {
                return Err(EventBridgeError::Config(format!(
                    "rule {}/{}: unknown status discriminant {other}",
                    row.bus_name, row.name
                )))
            }
        };
        Ok(Rule {
            name: row.name,
            bus_name: row.bus_name,
            status,
            pattern: row.pattern,
            targets,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    version: i64,
}

async fn poll_version(pool: &PgPool, row_id: i64, timeout: Duration) -> Result<i64> {
    let row: VersionRow = tokio::time::timeout(
        timeout,
        sqlx::query_as("SELECT version FROM version WHERE id = $1")
            .bind(row_id)
            .fetch_one(pool),
    )
    .await
    .map_err(|_| EventBridgeError::Storage(sqlx::Error::PoolTimedOut))??;
    Ok(row.version)
}

/// Polls `version` row 1, keyset-lists `bus` on advance, and diffs against
/// the last snapshot.
pub struct BusReflector {
    pool: PgPool,
    poll_interval: Duration,
    db_timeout: Duration,
    last_version: Mutex<i64>,
    snapshot: DashMap<String, BusBinding>,
    closed: CancellationToken,
}

impl BusReflector {
    /// A reflector that polls every `poll_interval`, capping each DB call at
    /// `db_timeout`.
    pub fn new(pool: PgPool, poll_interval: Duration, db_timeout: Duration) -> Self {
        BusReflector {
            pool,
            poll_interval,
            db_timeout,
            last_version: Mutex::new(-1),
            snapshot: DashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    async fn list_all(&self) -> Result<HashMap<String, BusBinding>> {
        let mut out = HashMap::new();
        let mut after_id: i64 = 0;
        loop {
            let rows: Vec<BusRow> = tokio::time::timeout(
                self.db_timeout,
                sqlx::query_as(
                    "SELECT id, name, mode, source_topic, source_delay_topic, target_exp_decay_topic, target_backoff_topic \
                     FROM bus WHERE id > $1 ORDER BY id LIMIT $2",
                )
                .bind(after_id)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool),
            )
            .await
            .map_err(|_| EventBridgeError::Storage(sqlx::Error::PoolTimedOut))??;

            if rows.is_empty() {
                break;
            }
            let last_id = rows.last().map(|r| r.id).unwrap_or(after_id);
            for row in rows {
                let binding = BusBinding::try_from(row)?;
                out.insert(binding.name.clone(), binding);
            }
            if last_id == after_id {
                break;
            }
            after_id = last_id;
        }
        Ok(out)
    }
}

#[async_trait]
impl Reflector for BusReflector {
    type Key = String;
    type Value = BusBinding;

    async fn watch(&self) -> Result<Vec<String>> {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.closed.cancelled() => return Err(EventBridgeError::ReflectorClosed),
        }
        let current = poll_version(&self.pool, 1, self.db_timeout).await?;
        let mut last = self.last_version.lock().await;
        if current <= *last {
            return Ok(vec![]);
        }

        let listed = self.list_all().await?;
        let mut changed = Vec::new();

        for (name, binding) in &listed {
            match self.snapshot.get(name) {
                Some(existing) if *existing == *binding => {}
                _ => changed.push(name.clone()),
            }
        }
        let removed: Vec<String> = self
            .snapshot
            .iter()
            .filter(|entry| !listed.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        changed.extend(removed.iter().cloned());

        self.snapshot.clear();
        for (name, binding) in listed {
            self.snapshot.insert(name, binding);
        }
        for name in &removed {
            self.snapshot.remove(name);
        }

        *last = current;
        debug!(version = current, changed = changed.len(), "bus reflector listed");
        Ok(changed)
    }

    fn get(&self, key: &String) -> Option<BusBinding> {
        self.snapshot.get(key).map(|entry| entry.clone())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// A rule's identity within the reflector: `(bus_name, name)`, matching the
/// `rule` table's unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// The owning bus.
    pub bus_name: String,
    /// Unique within the owning bus.
    pub name: String,
}

/// Polls `version` row 2, keyset-lists `rule` on advance, and diffs against
/// the last snapshot.
pub struct RuleReflector {
    pool: PgPool,
    poll_interval: Duration,
    db_timeout: Duration,
    last_version: Mutex<i64>,
    snapshot: DashMap<RuleKey, Rule>,
    closed: CancellationToken,
}

impl RuleReflector {
    /// A reflector that polls every `poll_interval`, capping each DB call at
    /// `db_timeout`.
    pub fn new(pool: PgPool, poll_interval: Duration, db_timeout: Duration) -> Self {
        RuleReflector {
            pool,
            poll_interval,
            db_timeout,
            last_version: Mutex::new(-1),
            snapshot: DashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    async fn list_all(&self) -> Result<HashMap<RuleKey, Rule>> {
        let mut out = HashMap::new();
        let mut after_id: i64 = 0;
        loop {
            let rows: Vec<RuleRow> = tokio::time::timeout(
                self.db_timeout,
                sqlx::query_as(
                    "SELECT id, name, bus_name, status, pattern, targets FROM rule \
                     WHERE id > $1 ORDER BY id LIMIT $2",
                )
                .bind(after_id)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool),
            )
            .await
            .map_err(|_| EventBridgeError::Storage(sqlx::Error::PoolTimedOut))??;

            if rows.is_empty() {
                break;
            }
            let last_id = rows.iter().map(|r| r.id).max().unwrap_or(after_id);
            for row in rows {
                let key = RuleKey {
                    bus_name: row.bus_name.clone(),
                    name: row.name.clone(),
                };
                let rule = Rule::try_from(row)?;
                out.insert(key, rule);
            }
            if last_id == after_id {
                break;
            }
            after_id = last_id;
        }
        Ok(out)
    }
}

#[async_trait]
impl Reflector for RuleReflector {
    type Key = RuleKey;
    type Value = Rule;

    async fn watch(&self) -> Result<Vec<RuleKey>> {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.closed.cancelled() => return Err(EventBridgeError::ReflectorClosed),
        }
        let current = poll_version(&self.pool, 2, self.db_timeout).await?;
        let mut last = self.last_version.lock().await;
        if current <= *last {
            return Ok(vec![]);
        }

        let listed = self.list_all().await?;
        let mut changed = Vec::new();
        for (key, rule) in &listed {
            match self.snapshot.get(key) {
                Some(existing) if *existing == *rule => {}
                _ => changed.push(key.clone()),
            }
        }
        let removed: Vec<RuleKey> = self
            .snapshot
            .iter()
            .filter(|entry| !listed.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        changed.extend(removed.iter().cloned());

        self.snapshot.clear();
        for (key, rule) in listed {
            self.snapshot.insert(key, rule);
        }
        for key in &removed {
            self.snapshot.remove(key);
        }

        *last = current;
        debug!(version = current, changed = changed.len(), "rule reflector listed");
        Ok(changed)
    }

    fn get(&self, key: &RuleKey) -> Option<Rule> {
        self.snapshot.get(key).map(|entry| entry.clone())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_row_rejects_unknown_mode_discriminant() {
        let row = BusRow {
            id: 1,
            name: "b".into(),
            mode: 9,
            source_topic: "t".into(),
            source_delay_topic: "t".into(),
            target_exp_decay_topic: "t".into(),
            target_backoff_topic: "t".into(),
        };
        assert!(BusBinding::try_from(row).is_err());
    }

    #[test]
    fn rule_row_parses_embedded_target_json() {
        let row = RuleRow {
            id: 1,
            name: "r1".into(),
            bus_name: "Default".into(),
            status: 1,
            pattern: "{}".into(),
            targets: serde_json::json!([{
                "id": 1,
                "type": "NoopDispatcher",
                "params": [],
                "retry_strategy": null,
            }]),
        };
        let rule = Rule::try_from(row).unwrap();
        assert_eq!(rule.status, RuleStatus::Enable);
        assert_eq!(rule.targets.len(), 1);
    }
}
