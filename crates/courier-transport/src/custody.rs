//! # Custody Manager
//!
//! Pure logic — no I/O. Tracks store-and-forward custody obligations this
//! node has accepted from an upstream peer, periodically re-offers custody
//! to a next hop until the offer is acknowledged, and releases the
//! obligation on a covering CUSTODY_ACK or a bundle DELIVERED. The retry
//! timer is the same now_ms-driven shape as the send engine's RTO timer,
//! generalized from per-chunk to per-custody-record granularity.
//!
//! Next-hop routing is not this module's concern (no dynamic topology
//! discovery, no multi-path) — the caller supplies the next hop when custody
//! is accepted, and retries are re-offers to that same fixed endpoint.

use courier_core::ids::{BundleId, Endpoint};
use rand::Rng;
use std::collections::HashMap;

use crate::wire::{ChunkRange, CustodyAckMessage, CustodyReqMessage, DeliveredMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    Eager,
    Deferred,
}

#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub max_retries: u32,
    pub backoff_base_sec: u64,
    pub backoff_cap_sec: u64,
    pub release_policy: ReleasePolicy,
    pub cap_bytes: u64,
    pub chunk_size: u64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        CustodyConfig {
            max_retries: 10,
            backoff_base_sec: 2,
            backoff_cap_sec: 64,
            release_policy: ReleasePolicy::Eager,
            cap_bytes: 10 * 1024 * 1024 * 1024,
            chunk_size: 1150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Held,
    Failed,
}

struct CustodyRecord {
    next_hop: Endpoint,
    /// The bundle's final destination, carried in every re-offered
    /// CUSTODY_REQ so a downstream relay knows where to forward it.
    final_dst: Endpoint,
    ranges: Vec<ChunkRange>,
    retry_timer: u64,
    retry_count: u32,
    ack_nonce: u64,
    ttl_deadline_ms: u64,
    state: RecordState,
}

impl CustodyRecord {
    fn chunk_count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| (r.end - r.start + 1) as u64)
            .sum()
    }
}

/// A message the node orchestrator should send on this engine's behalf.
#[derive(Debug, Clone)]
pub enum CustodyEvent {
    Ack(Endpoint, CustodyAckMessage),
    Req(Endpoint, CustodyReqMessage),
    Delivered(Endpoint, DeliveredMessage),
}

pub struct CustodyManager {
    config: CustodyConfig,
    records: HashMap<BundleId, CustodyRecord>,
    held_chunks: u64,
    output: Vec<CustodyEvent>,
}

impl CustodyManager {
    pub fn new(config: CustodyConfig) -> Self {
        CustodyManager {
            config,
            records: HashMap::new(),
            held_chunks: 0,
            output: Vec::new(),
        }
    }

    /// Decide whether to accept a custody offer from `src` for `bundle_id`,
    /// forwarding subsequently to `next_hop`. Rejection is a silent drop —
    /// the caller (upstream) will retry on its own schedule. Returns the
    /// ack_nonce on acceptance, so the caller can persist the record.
    pub fn on_custody_req(
        &mut self,
        bundle_id: BundleId,
        msg: &CustodyReqMessage,
        src: Endpoint,
        next_hop: Endpoint,
        now_ms: u64,
    ) -> Option<u64> {
        if msg.ttl_remaining == 0 {
            return None;
        }
        let capacity_chunks = self.config.cap_bytes / self.config.chunk_size.max(1);
        let incoming_chunks: u64 = msg.ranges.iter().map(|r| (r.end - r.start + 1) as u64).sum();
        if self.held_chunks + incoming_chunks > capacity_chunks {
            return None;
        }
        if let Some(existing) = self.records.get(&bundle_id) {
            if fully_covers(&existing.ranges, &msg.ranges) {
                return None;
            }
        }

        let ack_nonce = rand::rng().random::<u64>();
        let record = CustodyRecord {
            next_hop,
            final_dst: Endpoint(msg.dst.clone()),
            ranges: msg.ranges.clone(),
            retry_timer: now_ms + self.config.backoff_base_sec * 1000,
            retry_count: 0,
            ack_nonce,
            ttl_deadline_ms: now_ms + (msg.ttl_remaining as u64) * 1000,
            state: RecordState::Held,
        };
        self.held_chunks += record.chunk_count();
        self.records.insert(bundle_id, record);

        self.output.push(CustodyEvent::Ack(
            src,
            CustodyAckMessage {
                bundle_id,
                ack_nonce,
                ranges: msg.ranges.clone(),
            },
        ));
        Some(ack_nonce)
    }

    /// Originate a fresh custody offer as the bundle's own origin node,
    /// holding custody of its own bundle so the existing retry machinery in
    /// `tick` drives the first (and every subsequent) CUSTODY_REQ. The
    /// timer is due immediately — the very next `tick` call emits it.
    pub fn offer(
        &mut self,
        bundle_id: BundleId,
        next_hop: Endpoint,
        final_dst: Endpoint,
        ranges: Vec<ChunkRange>,
        ttl_remaining_sec: u64,
        now_ms: u64,
    ) -> u64 {
        let ack_nonce = rand::rng().random::<u64>();
        let record = CustodyRecord {
            next_hop,
            final_dst,
            ranges,
            retry_timer: now_ms,
            retry_count: 0,
            ack_nonce,
            ttl_deadline_ms: now_ms + ttl_remaining_sec * 1000,
            state: RecordState::Held,
        };
        self.held_chunks += record.chunk_count();
        self.records.insert(bundle_id, record);
        ack_nonce
    }

    /// Rehydrate a custody record recovered from the store after a restart.
    /// The original TTL deadline isn't persisted, so resumed records only
    /// fail via `max_retries`, never via TTL expiry.
    pub fn resume(
        &mut self,
        bundle_id: BundleId,
        next_hop: Endpoint,
        final_dst: Endpoint,
        ranges: Vec<ChunkRange>,
        retry_timer: u64,
        retry_count: u32,
        ack_nonce: u64,
    ) {
        let record = CustodyRecord {
            next_hop,
            final_dst,
            ranges,
            retry_timer,
            retry_count,
            ack_nonce,
            ttl_deadline_ms: u64::MAX,
            state: RecordState::Held,
        };
        self.held_chunks += record.chunk_count();
        self.records.insert(bundle_id, record);
    }

    /// A downstream peer has confirmed custody for (at least part of) a
    /// record this node is forwarding on behalf of an upstream holder.
    pub fn on_custody_ack(&mut self, bundle_id: BundleId, msg: &CustodyAckMessage) {
        let Some(record) = self.records.get_mut(&bundle_id) else {
            return;
        };
        if record.ack_nonce != msg.ack_nonce {
            return;
        }
        record.ranges = subtract_ranges(&record.ranges, &msg.ranges);
        if record.ranges.is_empty() && self.config.release_policy == ReleasePolicy::Eager {
            self.release(bundle_id);
        }
    }

    /// The bundle reached its destination — release every record for it and
    /// cascade the notice upstream. A no-op if this node holds no record for
    /// the bundle (e.g. it is the final destination itself, not a relay),
    /// so the DELIVERED notice doesn't bounce back and forth forever.
    pub fn on_delivered(&mut self, bundle_id: BundleId, upstream: Endpoint) {
        let had_record = self.records.contains_key(&bundle_id);
        self.release(bundle_id);
        if had_record {
            self.output.push(CustodyEvent::Delivered(
                upstream,
                DeliveredMessage { bundle_id },
            ));
        }
    }

    fn release(&mut self, bundle_id: BundleId) {
        if let Some(record) = self.records.remove(&bundle_id) {
            self.held_chunks = self.held_chunks.saturating_sub(record.chunk_count());
        }
    }

    /// Fire due retry timers: re-offer custody to the next hop for any
    /// record still awaiting a covering ack.
    pub fn tick(&mut self, now_ms: u64) {
        let mut failed = Vec::new();
        for (&bundle_id, record) in self.records.iter_mut() {
            if record.state != RecordState::Held || record.ranges.is_empty() {
                continue;
            }
            if now_ms < record.retry_timer {
                continue;
            }
            let remaining_sec = (record.ttl_deadline_ms.saturating_sub(now_ms) / 1000) as u32;
            if remaining_sec == 0 || record.retry_count >= self.config.max_retries {
                record.state = RecordState::Failed;
                failed.push(bundle_id);
                continue;
            }
            record.retry_count += 1;
            let backoff = 2u64
                .saturating_pow(record.retry_count)
                .min(self.config.backoff_cap_sec);
            record.retry_timer = now_ms + backoff * 1000;
            self.output.push(CustodyEvent::Req(
                record.next_hop.clone(),
                CustodyReqMessage {
                    bundle_id,
                    ttl_remaining: remaining_sec,
                    dst: record.final_dst.0.clone(),
                    ranges: record.ranges.clone(),
                },
            ));
        }
        for bundle_id in failed {
            if let Some(record) = self.records.remove(&bundle_id) {
                self.held_chunks = self.held_chunks.saturating_sub(record.chunk_count());
            }
        }
    }

    pub fn drain_output(&mut self) -> Vec<CustodyEvent> {
        self.output.drain(..).collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn held_chunks(&self) -> u64 {
        self.held_chunks
    }
}

/// Whether `existing` (a set of disjoint ranges) fully covers every chunk id
/// named in `requested`.
fn fully_covers(existing: &[ChunkRange], requested: &[ChunkRange]) -> bool {
    requested
        .iter()
        .all(|r| (r.start..=r.end).all(|id| existing.iter().any(|e| e.start <= id && id <= e.end)))
}

/// Remove every chunk id in `covered` from `ranges`, returning the remaining
/// disjoint ranges.
fn subtract_ranges(ranges: &[ChunkRange], covered: &[ChunkRange]) -> Vec<ChunkRange> {
    let mut remaining = Vec::new();
    for r in ranges {
        let mut segments = vec![(r.start, r.end)];
        for c in covered {
            segments = segments
                .into_iter()
                .flat_map(|(s, e)| split_range(s, e, c.start, c.end))
                .collect();
        }
        for (s, e) in segments {
            remaining.push(ChunkRange { start: s, end: e });
        }
    }
    remaining
}

/// Split `[s, e]` around the hole `[cs, ce]`, yielding zero, one, or two
/// surviving sub-ranges.
fn split_range(s: u32, e: u32, cs: u32, ce: u32) -> Vec<(u32, u32)> {
    if ce < s || cs > e {
        return vec![(s, e)];
    }
    let mut out = Vec::new();
    if s < cs {
        out.push((s, cs - 1));
    }
    if e > ce {
        out.push((ce + 1, e));
    }
    out
}

/// Render chunk ranges as the store's `"start-end,start-end"` text encoding.
pub fn format_ranges(ranges: &[ChunkRange]) -> String {
    ranges
        .iter()
        .map(|r| format!("{}-{}", r.start, r.end))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the store's `"start-end,start-end"` text encoding back into chunk
/// ranges. Malformed segments are skipped rather than failing the whole
/// parse — a corrupted range only costs that one sub-range, not recovery.
pub fn parse_ranges(s: &str) -> Vec<ChunkRange> {
    s.split(',')
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| {
            let (start, end) = segment.split_once('-')?;
            Some(ChunkRange { start: start.parse().ok()?, end: end.parse().ok()? })
        })
        .collect()
}
