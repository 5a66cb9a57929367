//! SQLite tick store.
//!
//! Ticks are keyed by `(symbol, ts_ms, price, quantity)`, so re-inserting a
//! duplicate delivery is a no-op.

use pairs_core::{Error, Result, Tick, TimestampMs};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ticks (
    symbol   TEXT    NOT NULL,
    ts_ms    INTEGER NOT NULL,
    price    REAL    NOT NULL,
    quantity REAL    NOT NULL,
    PRIMARY KEY (symbol, ts_ms, price, quantity)
);
CREATE INDEX IF NOT EXISTS idx_ticks_ts ON ticks (ts_ms);
";

fn db_error(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

fn tick_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tick> {
    Ok(Tick {
        symbol: row.get(0)?,
        ts_ms: row.get(1)?,
        price: row.get(2)?,
        quantity: row.get(3)?,
    })
}

/// Persistent tick storage.
pub struct TickStore {
    conn: Connection,
}

impl TickStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path.as_ref()).map_err(db_error)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_error)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self { conn })
    }

    /// Insert ticks in one transaction. Returns how many were new.
    pub fn insert_batch(&mut self, ticks: &[Tick]) -> Result<usize> {
        let tx = self.conn.transaction().map_err(db_error)?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO ticks (symbol, ts_ms, price, quantity) VALUES (?1, ?2, ?3, ?4)")
                .map_err(db_error)?;
            for tick in ticks {
                inserted += stmt
                    .execute(params![tick.symbol, tick.ts_ms, tick.price, tick.quantity])
                    .map_err(db_error)?;
            }
        }
        tx.commit().map_err(db_error)?;
        debug!(batch = ticks.len(), inserted, "stored ticks");
        Ok(inserted)
    }

    /// Ticks of one symbol with `from <= ts_ms < to`, in arrival order per timestamp.
    pub fn load(&self, symbol: &str, from: TimestampMs, to: TimestampMs) -> Result<Vec<Tick>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT symbol, ts_ms, price, quantity
                 FROM ticks
                 WHERE symbol = ?1 AND ts_ms >= ?2 AND ts_ms < ?3
                 ORDER BY ts_ms, rowid",
            )
            .map_err(db_error)?;
        let ticks = stmt
            .query_map(params![symbol, from, to], tick_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(ticks)
    }

    /// Every stored tick in timestamp order, for replay.
    pub fn load_all_ordered(&self) -> Result<Vec<Tick>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, ts_ms, price, quantity FROM ticks ORDER BY ts_ms, rowid")
            .map_err(db_error)?;
        let ticks = stmt
            .query_map([], tick_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(ticks)
    }

    /// Delete ticks older than `ts_ms`. Returns the number removed.
    pub fn prune_before(&self, ts_ms: TimestampMs) -> Result<usize> {
        self.conn
            .execute("DELETE FROM ticks WHERE ts_ms < ?1", params![ts_ms])
            .map_err(db_error)
    }

    /// Newest stored timestamp.
    pub fn latest_ts(&self) -> Result<Option<TimestampMs>> {
        self.conn
            .query_row("SELECT MAX(ts_ms) FROM ticks", [], |row| row.get(0))
            .map_err(db_error)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))
            .map_err(db_error)?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks() -> Vec<Tick> {
        vec![
            Tick::new("BTCUSDT", 1_000, 50_000.0, 0.5),
            Tick::new("ETHUSDT", 1_200, 3_000.0, 2.0),
            Tick::new("BTCUSDT", 2_000, 50_010.0, 0.1),
            Tick::new("BTCUSDT", 2_000, 50_005.0, 0.3),
        ]
    }

    #[test]
    fn test_duplicates_are_idempotent() {
        let mut store = TickStore::open_in_memory().unwrap();
        assert_eq!(store.insert_batch(&ticks()).unwrap(), 4);
        assert_eq!(store.insert_batch(&ticks()).unwrap(), 0);

        // same timestamp but different price is a distinct trade
        assert_eq!(store.insert_batch(&[Tick::new("BTCUSDT", 1_000, 50_001.0, 0.5)]).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[test]
    fn test_load_range_is_half_open() {
        let mut store = TickStore::open_in_memory().unwrap();
        store.insert_batch(&ticks()).unwrap();

        let btc = store.load("BTCUSDT", 1_000, 2_000).unwrap();
        assert_eq!(btc, vec![Tick::new("BTCUSDT", 1_000, 50_000.0, 0.5)]);

        let btc = store.load("BTCUSDT", 0, 10_000).unwrap();
        assert_eq!(btc.len(), 3);
        // insertion order kept within a timestamp
        assert_eq!(btc[1].price, 50_010.0);
        assert_eq!(btc[2].price, 50_005.0);
    }

    #[test]
    fn test_load_all_ordered_and_prune() {
        let mut store = TickStore::open_in_memory().unwrap();
        let mut shuffled = ticks();
        shuffled.reverse();
        store.insert_batch(&shuffled).unwrap();

        let all = store.load_all_ordered().unwrap();
        let times: Vec<i64> = all.iter().map(|t| t.ts_ms).collect();
        assert_eq!(times, vec![1_000, 1_200, 2_000, 2_000]);
        assert_eq!(store.latest_ts().unwrap(), Some(2_000));

        assert_eq!(store.prune_before(1_500).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_empty_store() {
        let store = TickStore::open_in_memory().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.latest_ts().unwrap(), None);
        assert!(store.load_all_ordered().unwrap().is_empty());
    }
}
