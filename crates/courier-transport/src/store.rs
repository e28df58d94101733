//! # Persistent Store
//!
//! Durable record of bundles, chunks, and custody entries backed by
//! `rusqlite` (bundled SQLite), opened once at startup with WAL journaling.
//! Every write is a single `INSERT OR REPLACE`, which SQLite runs in its own
//! implicit transaction — satisfying the "persist before transmit/ack"
//! crash-safety rule without the node needing to manage transactions itself.
//! The store is the single source of truth; in-memory engine state is
//! rebuildable from it on restart.

use courier_core::error::CourierError;
use courier_core::ids::BundleId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS bundles (
        bundle_id BLOB PRIMARY KEY,
        src TEXT NOT NULL,
        dst TEXT NOT NULL,
        ttl_ms INTEGER NOT NULL,
        length INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL,
        fec_enabled INTEGER NOT NULL,
        k INTEGER NOT NULL,
        r INTEGER NOT NULL,
        state TEXT NOT NULL,
        bytes_sent INTEGER NOT NULL DEFAULT 0,
        chunks_retransmitted INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS chunks (
        bundle_id BLOB NOT NULL,
        chunk_id INTEGER NOT NULL,
        is_parity INTEGER NOT NULL,
        block_id INTEGER NOT NULL,
        k INTEGER NOT NULL,
        r INTEGER NOT NULL,
        checksum INTEGER NOT NULL,
        payload BLOB NOT NULL,
        PRIMARY KEY (bundle_id, chunk_id)
    );

    CREATE TABLE IF NOT EXISTS custody (
        bundle_id BLOB NOT NULL,
        owner_node TEXT NOT NULL,
        chunk_ranges TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        retry_timer INTEGER NOT NULL,
        retry_count INTEGER NOT NULL,
        ack_nonce INTEGER NOT NULL,
        state TEXT NOT NULL,
        PRIMARY KEY (bundle_id, owner_node)
    );
";

/// A bundle's durable row.
#[derive(Debug, Clone)]
pub struct BundleRow {
    pub bundle_id: BundleId,
    pub src: String,
    pub dst: String,
    pub ttl_ms: u64,
    pub length: u64,
    pub total_chunks: u32,
    pub fec_enabled: bool,
    pub k: u8,
    pub r: u8,
    pub state: String,
    pub bytes_sent: u64,
    pub chunks_retransmitted: u64,
}

/// A chunk's durable row (payload included, so a restart never needs the
/// network to recover already-generated chunks).
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub bundle_id: BundleId,
    pub chunk_id: u32,
    pub is_parity: bool,
    pub block_id: u32,
    pub k: u8,
    pub r: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

/// A custody record's durable row. `chunk_ranges` is stored as a compact
/// `"start-end,start-end"` text encoding — simple enough that no separate
/// schema migration is needed if the range format changes.
#[derive(Debug, Clone)]
pub struct CustodyRow {
    pub bundle_id: BundleId,
    pub owner_node: String,
    pub chunk_ranges: String,
    pub acquired_at: u64,
    pub retry_timer: u64,
    pub retry_count: u32,
    pub ack_nonce: u64,
    pub state: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CourierError> {
        let conn = Connection::open(path).map_err(|e| CourierError::TransportFault(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        Ok(Store { conn })
    }

    pub fn open_in_memory() -> Result<Self, CourierError> {
        let conn = Connection::open_in_memory().map_err(|e| CourierError::TransportFault(e.to_string()))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        Ok(Store { conn })
    }

    pub fn put_bundle(&self, row: &BundleRow) -> Result<(), CourierError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO bundles
                 (bundle_id, src, dst, ttl_ms, length, total_chunks, fec_enabled, k, r, state, bytes_sent, chunks_retransmitted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.bundle_id.as_bytes().to_vec(),
                    row.src,
                    row.dst,
                    row.ttl_ms as i64,
                    row.length as i64,
                    row.total_chunks,
                    row.fec_enabled as i64,
                    row.k,
                    row.r,
                    row.state,
                    row.bytes_sent as i64,
                    row.chunks_retransmitted as i64,
                ],
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        Ok(())
    }

    pub fn put_chunk(&self, row: &ChunkRow) -> Result<(), CourierError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO chunks
                 (bundle_id, chunk_id, is_parity, block_id, k, r, checksum, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.bundle_id.as_bytes().to_vec(),
                    row.chunk_id,
                    row.is_parity as i64,
                    row.block_id,
                    row.k,
                    row.r,
                    row.checksum,
                    row.payload,
                ],
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        Ok(())
    }

    pub fn put_custody(&self, row: &CustodyRow) -> Result<(), CourierError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO custody
                 (bundle_id, owner_node, chunk_ranges, acquired_at, retry_timer, retry_count, ack_nonce, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.bundle_id.as_bytes().to_vec(),
                    row.owner_node,
                    row.chunk_ranges,
                    row.acquired_at as i64,
                    row.retry_timer as i64,
                    row.retry_count,
                    row.ack_nonce as i64,
                    row.state,
                ],
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        Ok(())
    }

    pub fn load_in_flight_bundles(&self) -> Result<Vec<BundleRow>, CourierError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT bundle_id, src, dst, ttl_ms, length, total_chunks, fec_enabled, k, r, state, bytes_sent, chunks_retransmitted
                 FROM bundles WHERE state = 'IN_FLIGHT' OR state = 'NEW'",
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        let rows = stmt
            .query_map([], |r| {
                let id_bytes: Vec<u8> = r.get(0)?;
                Ok(BundleRow {
                    bundle_id: bundle_id_from_row(id_bytes),
                    src: r.get(1)?,
                    dst: r.get(2)?,
                    ttl_ms: r.get::<_, i64>(3)? as u64,
                    length: r.get::<_, i64>(4)? as u64,
                    total_chunks: r.get(5)?,
                    fec_enabled: r.get::<_, i64>(6)? != 0,
                    k: r.get(7)?,
                    r: r.get(8)?,
                    state: r.get(9)?,
                    bytes_sent: r.get::<_, i64>(10)? as u64,
                    chunks_retransmitted: r.get::<_, i64>(11)? as u64,
                })
            })
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CourierError::TransportFault(e.to_string()))
    }

    pub fn load_chunks(&self, bundle_id: &BundleId) -> Result<Vec<ChunkRow>, CourierError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT bundle_id, chunk_id, is_parity, block_id, k, r, checksum, payload
                 FROM chunks WHERE bundle_id = ?1",
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        let rows = stmt
            .query_map(params![bundle_id.as_bytes().to_vec()], |r| {
                let id_bytes: Vec<u8> = r.get(0)?;
                Ok(ChunkRow {
                    bundle_id: bundle_id_from_row(id_bytes),
                    chunk_id: r.get(1)?,
                    is_parity: r.get::<_, i64>(2)? != 0,
                    block_id: r.get(3)?,
                    k: r.get(4)?,
                    r: r.get(5)?,
                    checksum: r.get(6)?,
                    payload: r.get(7)?,
                })
            })
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CourierError::TransportFault(e.to_string()))
    }

    pub fn load_custody_records(&self) -> Result<Vec<CustodyRow>, CourierError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT bundle_id, owner_node, chunk_ranges, acquired_at, retry_timer, retry_count, ack_nonce, state
                 FROM custody WHERE state = 'HELD'",
            )
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        let rows = stmt
            .query_map([], |r| {
                let id_bytes: Vec<u8> = r.get(0)?;
                Ok(CustodyRow {
                    bundle_id: bundle_id_from_row(id_bytes),
                    owner_node: r.get(1)?,
                    chunk_ranges: r.get(2)?,
                    acquired_at: r.get::<_, i64>(3)? as u64,
                    retry_timer: r.get::<_, i64>(4)? as u64,
                    retry_count: r.get(5)?,
                    ack_nonce: r.get::<_, i64>(6)? as u64,
                    state: r.get(7)?,
                })
            })
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CourierError::TransportFault(e.to_string()))
    }

    /// Drop bundle/chunk/custody rows for bundles past their TTL and not in
    /// a terminal-but-recent state. Called from the tick loop, not on every
    /// tick — the node orchestrator rate-limits this.
    pub fn purge_expired(&self, now_ms: u64) -> Result<usize, CourierError> {
        let bundle_ids: Vec<Vec<u8>> = {
            let mut stmt = self
                .conn
                .prepare("SELECT bundle_id FROM bundles WHERE ttl_ms < ?1 AND state NOT IN ('DELIVERED', 'EXPIRED', 'FAILED')")
                .map_err(|e| CourierError::TransportFault(e.to_string()))?;
            let rows = stmt
                .query_map(params![now_ms as i64], |r| r.get::<_, Vec<u8>>(0))
                .map_err(|e| CourierError::TransportFault(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| CourierError::TransportFault(e.to_string()))?
        };
        for id in &bundle_ids {
            self.conn
                .execute("UPDATE bundles SET state = 'EXPIRED' WHERE bundle_id = ?1", params![id])
                .map_err(|e| CourierError::TransportFault(e.to_string()))?;
            self.conn
                .execute("DELETE FROM chunks WHERE bundle_id = ?1", params![id])
                .map_err(|e| CourierError::TransportFault(e.to_string()))?;
        }
        Ok(bundle_ids.len())
    }

    pub fn get_bundle(&self, bundle_id: &BundleId) -> Result<Option<BundleRow>, CourierError> {
        self.conn
            .query_row(
                "SELECT bundle_id, src, dst, ttl_ms, length, total_chunks, fec_enabled, k, r, state, bytes_sent, chunks_retransmitted
                 FROM bundles WHERE bundle_id = ?1",
                params![bundle_id.as_bytes().to_vec()],
                |r| {
                    let id_bytes: Vec<u8> = r.get(0)?;
                    Ok(BundleRow {
                        bundle_id: bundle_id_from_row(id_bytes),
                        src: r.get(1)?,
                        dst: r.get(2)?,
                        ttl_ms: r.get::<_, i64>(3)? as u64,
                        length: r.get::<_, i64>(4)? as u64,
                        total_chunks: r.get(5)?,
                        fec_enabled: r.get::<_, i64>(6)? != 0,
                        k: r.get(7)?,
                        r: r.get(8)?,
                        state: r.get(9)?,
                        bytes_sent: r.get::<_, i64>(10)? as u64,
                        chunks_retransmitted: r.get::<_, i64>(11)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|e| CourierError::TransportFault(e.to_string()))
    }
}

fn bundle_id_from_row(bytes: Vec<u8>) -> BundleId {
    let arr: [u8; 16] = bytes.try_into().unwrap_or([0u8; 16]);
    BundleId::from_bytes(arr)
}
