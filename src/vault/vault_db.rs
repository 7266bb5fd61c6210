use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::vault::clock::UnixSecs;
use crate::vault::events::{VaultEvent, VaultEventRecord};
use crate::vault::math::Amount;
use crate::vault::strategy::StrategyInfo;

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub ts: UnixSecs,
    pub vault: String,
    pub kind: String,
    pub depositor: Option<String>,
    pub amount: Option<Amount>,
    pub event: VaultEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSnapshotRecord {
    pub vault: String,
    pub ts: UnixSecs,
    pub info: StrategyInfo,
}

// SQLite integers stop at i64; amounts go in as decimal text.
fn amount_to_sql(v: Amount) -> String {
    v.to_string()
}

fn amount_from_sql(s: &str) -> Amount {
    s.parse().unwrap_or(0)
}

#[derive(Clone)]
pub struct VaultDb {
    conn: Arc<Mutex<Connection>>,
}

impl VaultDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open vault db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_events (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                vault TEXT NOT NULL,
                kind TEXT NOT NULL,
                depositor TEXT,
                amount TEXT,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vault_events_vault_ts ON vault_events(vault, ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vault_events_depositor_ts ON vault_events(depositor, ts DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_snapshots (
                vault TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                total_assets TEXT NOT NULL,
                total_shares TEXT NOT NULL,
                share_price TEXT NOT NULL,
                apy_bps INTEGER NOT NULL,
                total_yield_generated TEXT NOT NULL,
                paused INTEGER NOT NULL,
                emergency_mode INTEGER NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_event(&self, rec: &VaultEventRecord) -> Result<()> {
        let payload = serde_json::to_string(&rec.event).context("encode vault event")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO vault_events \
             (id, ts, vault, kind, depositor, amount, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &rec.id,
                rec.ts,
                &rec.vault,
                rec.event.kind(),
                rec.event.depositor(),
                rec.event.amount().map(amount_to_sql),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Newest first. Filters are optional and combine.
    pub async fn list_events(
        &self,
        limit: usize,
        vault: Option<&str>,
        depositor: Option<&str>,
    ) -> Result<Vec<StoredEvent>> {
        let limit = limit.clamp(1, 1000) as i64;
        let depositor = depositor.map(|d| d.trim().to_lowercase());
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, vault, kind, depositor, amount, payload \
             FROM vault_events \
             WHERE (?1 IS NULL OR vault = ?1) AND (?2 IS NULL OR depositor = ?2) \
             ORDER BY ts DESC, rowid DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![vault, depositor, limit], |row| {
            let amount: Option<String> = row.get(5)?;
            let payload: String = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                amount,
                payload,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (id, ts, vault, kind, depositor, amount, payload) = r?;
            let event: VaultEvent = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping undecodable vault event");
                    continue;
                }
            };
            out.push(StoredEvent {
                id,
                ts,
                vault,
                kind,
                depositor,
                amount: amount.as_deref().map(amount_from_sql),
                event,
            });
        }
        Ok(out)
    }

    pub async fn count_events(&self, vault: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vault_events WHERE vault = ?1",
            [vault],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub async fn upsert_snapshot(&self, ts: UnixSecs, info: &StrategyInfo) -> Result<()> {
        let payload = serde_json::to_string(info).context("encode vault snapshot")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vault_snapshots \
             (vault, ts, kind, total_assets, total_shares, share_price, apy_bps, total_yield_generated, paused, emergency_mode, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(vault) DO UPDATE SET \
                ts = excluded.ts, \
                kind = excluded.kind, \
                total_assets = excluded.total_assets, \
                total_shares = excluded.total_shares, \
                share_price = excluded.share_price, \
                apy_bps = excluded.apy_bps, \
                total_yield_generated = excluded.total_yield_generated, \
                paused = excluded.paused, \
                emergency_mode = excluded.emergency_mode, \
                payload = excluded.payload",
            params![
                &info.name,
                ts,
                info.kind.as_str(),
                amount_to_sql(info.total_assets),
                amount_to_sql(info.total_shares),
                amount_to_sql(info.share_price),
                info.apy_bps,
                amount_to_sql(info.total_yield_generated),
                info.paused,
                info.emergency_mode,
                payload,
            ],
        )?;
        Ok(())
    }

    pub async fn load_snapshot(&self, vault: &str) -> Result<Option<VaultSnapshotRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT ts, payload FROM vault_snapshots WHERE vault = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![vault])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let ts: i64 = row.get(0)?;
        let payload: String = row.get(1)?;
        let info: StrategyInfo =
            serde_json::from_str(&payload).context("decode vault snapshot")?;
        Ok(Some(VaultSnapshotRecord {
            vault: vault.to_string(),
            ts,
            info,
        }))
    }

    pub async fn list_snapshots(&self) -> Result<Vec<VaultSnapshotRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT vault, ts, payload FROM vault_snapshots ORDER BY vault ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (vault, ts, payload) = r?;
            match serde_json::from_str::<StrategyInfo>(&payload) {
                Ok(info) => out.push(VaultSnapshotRecord { vault, ts, info }),
                Err(e) => warn!(vault = %vault, error = %e, "skipping undecodable snapshot"),
            }
        }
        Ok(out)
    }
}

/// Persist every event published on the bus until the channel closes.
pub fn spawn_event_recorder(
    db: VaultDb,
    mut rx: broadcast::Receiver<VaultEventRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    if let Err(e) = db.insert_event(&record).await {
                        warn!(vault = %record.vault, kind = record.event.kind(), error = %e, "failed to persist vault event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "vault event recorder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("vault event channel closed, recorder shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::events::EventBus;
    use crate::vault::math::SHARE_PRICE_SCALE;
    use crate::vault::strategy::StrategyKind;

    fn info(name: &str, total_assets: Amount) -> StrategyInfo {
        StrategyInfo {
            name: name.to_string(),
            kind: StrategyKind::SimpleAccrual,
            total_assets,
            total_shares: total_assets,
            apy_bps: 500,
            risk_score: 2,
            last_harvest: 0,
            active: true,
            paused: false,
            emergency_mode: false,
            total_yield_generated: 0,
            share_price: SHARE_PRICE_SCALE,
            depositors: 1,
        }
    }

    #[tokio::test]
    async fn test_events_round_trip_with_large_amounts() {
        let db = VaultDb::new(":memory:").unwrap();
        let big: Amount = u64::MAX as u128 * 1_000;
        let rec = VaultEventRecord {
            id: "e1".to_string(),
            ts: 100,
            vault: "noble".to_string(),
            event: VaultEvent::Deposited {
                depositor: "alice".to_string(),
                amount: big,
                shares: big,
            },
        };
        db.insert_event(&rec).await.unwrap();
        db.insert_event(&VaultEventRecord {
            id: "e2".to_string(),
            ts: 101,
            vault: "aave".to_string(),
            event: VaultEvent::Paused,
        })
        .await
        .unwrap();

        let all = db.list_events(10, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "e2");

        let alice = db.list_events(10, None, Some("ALICE")).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].amount, Some(big));
        assert_eq!(alice[0].event, rec.event);
        assert_eq!(db.count_events("aave").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_upsert_replaces_row() {
        let db = VaultDb::new(":memory:").unwrap();
        db.upsert_snapshot(10, &info("noble", 1_000)).await.unwrap();
        db.upsert_snapshot(20, &info("noble", 2_000)).await.unwrap();

        let snap = db.load_snapshot("noble").await.unwrap().unwrap();
        assert_eq!(snap.ts, 20);
        assert_eq!(snap.info.total_assets, 2_000);
        assert_eq!(db.list_snapshots().await.unwrap().len(), 1);
        assert!(db.load_snapshot("aave").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recorder_persists_published_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let db = VaultDb::new(path.to_str().unwrap()).unwrap();

        let bus = EventBus::new(16);
        let handle = spawn_event_recorder(db.clone(), bus.subscribe());
        bus.publish("resolv", 5, vec![VaultEvent::Paused, VaultEvent::Unpaused]);
        drop(bus);
        handle.await.unwrap();

        assert_eq!(db.count_events("resolv").await.unwrap(), 2);
    }
}
