use crate::ledger::FlowSample;
use crate::report::FlowDescription;
use flowacct_common::{AddressFamily, FlowStats};
use rusqlite::{params, Connection, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Receiver;

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS flow_samples (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                family TEXT NOT NULL,
                src_addr TEXT NOT NULL,
                src_port INTEGER NOT NULL,
                dst_addr TEXT NOT NULL,
                dst_port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                out_bytes INTEGER NOT NULL,
                out_packets INTEGER NOT NULL,
                in_bytes INTEGER NOT NULL,
                in_packets INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_flow_samples_timestamp ON flow_samples(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist every batch the poller sends, one transaction per batch.
    pub async fn run_writer(&self, mut rx: Receiver<Vec<FlowSample>>) {
        while let Some(batch) = rx.recv().await {
            if let Err(e) = self.insert_samples(&batch) {
                tracing::error!("Failed to persist {} flow samples: {}", batch.len(), e);
            }
        }
    }

    pub fn insert_samples(&self, samples: &[FlowSample]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO flow_samples (timestamp, family, src_addr, src_port, dst_addr, dst_port,
                    protocol, out_bytes, out_packets, in_bytes, in_packets)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.timestamp,
                    family_name(sample.flow.family),
                    sample.flow.src_addr,
                    sample.flow.src_port,
                    sample.flow.dst_addr,
                    sample.flow.dst_port,
                    sample.flow.protocol,
                    to_sql(sample.delta.out_bytes),
                    to_sql(sample.delta.out_packets),
                    to_sql(sample.delta.in_bytes),
                    to_sql(sample.delta.in_packets),
                ])?;
            }
        }
        tx.commit()
    }

    pub fn query_history(&self, limit: usize) -> Result<Vec<FlowSample>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, family, src_addr, src_port, dst_addr, dst_port, protocol,
                    out_bytes, out_packets, in_bytes, in_packets
             FROM flow_samples ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let family: String = row.get(1)?;
            Ok(FlowSample {
                timestamp: row.get(0)?,
                flow: FlowDescription {
                    family: if family == "ipv6" {
                        AddressFamily::V6
                    } else {
                        AddressFamily::V4
                    },
                    src_addr: row.get(2)?,
                    src_port: row.get(3)?,
                    dst_addr: row.get(4)?,
                    dst_port: row.get(5)?,
                    protocol: row.get(6)?,
                },
                delta: FlowStats {
                    out_bytes: from_sql(row.get(7)?),
                    out_packets: from_sql(row.get(8)?),
                    in_bytes: from_sql(row.get(9)?),
                    in_packets: from_sql(row.get(10)?),
                },
            })
        })?;

        rows.collect()
    }

    pub fn delete_old_data(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms =
            chrono::Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        let conn = self.lock();
        conn.execute(
            "DELETE FROM flow_samples WHERE timestamp < ?1",
            params![cutoff_ms],
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SQLite integers are signed; counters beyond `i64::MAX` saturate.
fn to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn family_name(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "ipv4",
        AddressFamily::V6 => "ipv6",
    }
}
