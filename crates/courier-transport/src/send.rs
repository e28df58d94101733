//! # Send Engine
//!
//! Pure logic — no I/O. Chunks a submitted file, maintains one sliding send
//! window per in-flight bundle, drives the RTO estimator, and retransmits
//! unacknowledged chunks on timeout. The node orchestrator owns the socket
//! and the persistent store; this module only ever sees bytes and
//! millisecond timestamps.

use bytes::Bytes;
use courier_core::error::CourierError;
use courier_core::ids::{BundleId, Endpoint};
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::fec::BlockEncoder;
use crate::pool::{ChunkContext, ChunkPool};
use crate::rto::RttEstimator;
use crate::wire::DataMessage;

/// FEC parameters for a send, mirroring `courier_core::config::FecConfig`.
#[derive(Debug, Clone, Copy)]
pub struct FecParams {
    pub k: u8,
    pub r: u8,
}

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub chunk_size: usize,
    pub window_size: u32,
    pub base_rto_ms: u64,
    pub max_rto_ms: u64,
    pub ttl_sec: u64,
    pub fec: Option<FecParams>,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            chunk_size: 1150,
            window_size: 64,
            base_rto_ms: 50,
            max_rto_ms: 5000,
            ttl_sec: 300,
            fec: None,
        }
    }
}

/// A chunk ready to go out on the wire, addressed to its destination.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub dst: Endpoint,
    pub message: DataMessage,
}

struct PreparedChunk {
    chunk_id: u32,
    block_id: u32,
    k: u8,
    r: u8,
    is_parity: bool,
    payload: Bytes,
}

/// A generated chunk's durable shape, handed to the node orchestrator for
/// persistence right after `submit` (crash-safety: chunks exist on disk
/// before anything is sent on the wire).
#[derive(Debug, Clone)]
pub struct ChunkSnapshot {
    pub chunk_id: u32,
    pub block_id: u32,
    pub k: u8,
    pub r: u8,
    pub is_parity: bool,
    pub payload: Bytes,
}

struct SendState {
    dst: Endpoint,
    total_chunks: u32,
    chunks: Vec<PreparedChunk>,
    /// Lowest data chunk id not yet cumulatively acknowledged.
    window_start: u32,
    /// Next data chunk id not yet queued for first transmission.
    next_to_send: u32,
    acked: HashSet<u32>,
    pool: ChunkPool,
    /// Parity chunk ids already queued once — parity is fire-and-forget and
    /// never retransmitted, so it is never placed in `pool`.
    sent_parity: HashSet<u32>,
    rtt: RttEstimator,
    deadline_ms: u64,
    complete: bool,
}

/// Drives every in-flight outbound bundle.
pub struct SendEngine {
    config: SendConfig,
    bundles: HashMap<BundleId, SendState>,
    output: VecDeque<OutboundChunk>,
}

impl SendEngine {
    pub fn new(config: SendConfig) -> Self {
        SendEngine {
            config,
            bundles: HashMap::new(),
            output: VecDeque::new(),
        }
    }

    /// Chunk `data` and begin transmitting it to `dst`. Chunks within the
    /// first window are queued immediately; later chunks are released as
    /// SACKs advance the window.
    pub fn submit(
        &mut self,
        bundle_id: BundleId,
        dst: Endpoint,
        data: Bytes,
        now_ms: u64,
    ) -> Result<(), CourierError> {
        if data.is_empty() {
            return Err(CourierError::SubmitRejected("empty payload".into()));
        }
        let chunks = self.chunk_and_protect(&data);
        let total_chunks = chunks
            .iter()
            .filter(|c| !c.is_parity)
            .count() as u32;

        let mut state = SendState {
            dst,
            total_chunks,
            chunks,
            window_start: 0,
            next_to_send: 0,
            acked: HashSet::new(),
            pool: ChunkPool::new((self.config.window_size as usize + 8).max(16)),
            sent_parity: HashSet::new(),
            rtt: RttEstimator::new(self.config.base_rto_ms, self.config.max_rto_ms),
            deadline_ms: now_ms + self.config.ttl_sec * 1000,
            complete: false,
        };
        Self::fill_window(&mut self.output, &self.config, bundle_id, &mut state, now_ms);
        self.bundles.insert(bundle_id, state);
        Ok(())
    }

    /// Split `data` into fixed-size data chunks and, if FEC is enabled,
    /// append parity chunks per block. The final, possibly short, chunk
    /// always gets its own solo block so parity never needs padding — every
    /// chunk in a block shares the same length.
    fn chunk_and_protect(&self, data: &Bytes) -> Vec<PreparedChunk> {
        let chunk_size = self.config.chunk_size;
        let mut data_chunks = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            data_chunks.push(data.slice(offset..end));
            offset = end;
        }
        let total_chunks = data_chunks.len() as u32;
        let last_is_short = data_chunks
            .last()
            .map(|c| c.len() != chunk_size)
            .unwrap_or(false);
        let full_count = if last_is_short {
            total_chunks - 1
        } else {
            total_chunks
        };

        let mut out = Vec::with_capacity(data_chunks.len());
        let fec = self.config.fec;
        let k = fec.map(|f| f.k as u32).unwrap_or(u32::MAX);
        let mut block_id = 0u32;
        let mut next_parity_id = total_chunks;

        let mut i = 0u32;
        while i < full_count {
            let block_end = i.saturating_add(k).min(full_count);
            let members: Vec<u32> = (i..block_end).collect();
            for &id in &members {
                out.push(PreparedChunk {
                    chunk_id: id,
                    block_id,
                    k: fec.map(|f| f.k).unwrap_or(1),
                    r: fec.map(|f| f.r).unwrap_or(0),
                    is_parity: false,
                    payload: data_chunks[id as usize].clone(),
                });
            }
            if let Some(f) = fec {
                let block_payloads: Vec<Bytes> =
                    members.iter().map(|&id| data_chunks[id as usize].clone()).collect();
                let parity = BlockEncoder::new(f.r as usize).encode(&block_payloads);
                for payload in parity {
                    out.push(PreparedChunk {
                        chunk_id: next_parity_id,
                        block_id,
                        k: f.k,
                        r: f.r,
                        is_parity: true,
                        payload,
                    });
                    next_parity_id += 1;
                }
            }
            block_id += 1;
            i = block_end;
        }

        if last_is_short {
            let id = total_chunks - 1;
            out.push(PreparedChunk {
                chunk_id: id,
                block_id,
                k: 1,
                r: fec.map(|f| f.r).unwrap_or(0),
                is_parity: false,
                payload: data_chunks[id as usize].clone(),
            });
            if let Some(f) = fec {
                let parity = BlockEncoder::new(f.r as usize).encode(&[data_chunks[id as usize].clone()]);
                for payload in parity {
                    out.push(PreparedChunk {
                        chunk_id: next_parity_id,
                        block_id,
                        k: 1,
                        r: f.r,
                        is_parity: true,
                        payload,
                    });
                    next_parity_id += 1;
                }
            }
        }

        out
    }

    fn fill_window(
        output: &mut VecDeque<OutboundChunk>,
        config: &SendConfig,
        bundle_id: BundleId,
        state: &mut SendState,
        now_ms: u64,
    ) {
        let window_end = state.window_start + config.window_size;
        while state.next_to_send < state.total_chunks && state.next_to_send < window_end {
            let id = state.next_to_send;
            Self::queue_chunk(output, bundle_id, state, id, now_ms);
            state.next_to_send += 1;
        }
        // Parity chunks ride along as soon as every data member of their
        // block has entered the window; send-once, never retransmitted.
        let window_ceiling = state.next_to_send;
        let parity_ids: Vec<u32> = state
            .chunks
            .iter()
            .filter(|c| c.is_parity)
            .map(|c| c.chunk_id)
            .collect();
        for parity_id in parity_ids {
            if state.sent_parity.contains(&parity_id) {
                continue;
            }
            let block_id = state
                .chunks
                .iter()
                .find(|c| c.chunk_id == parity_id)
                .unwrap()
                .block_id;
            let block_ready = state
                .chunks
                .iter()
                .filter(|c| c.block_id == block_id && !c.is_parity)
                .all(|c| c.chunk_id < window_ceiling);
            if block_ready {
                Self::queue_parity(output, bundle_id, state, parity_id, now_ms);
            }
        }
    }

    fn queue_chunk(
        output: &mut VecDeque<OutboundChunk>,
        bundle_id: BundleId,
        state: &mut SendState,
        chunk_id: u32,
        now_ms: u64,
    ) {
        let prepared = state.chunks.iter().find(|c| c.chunk_id == chunk_id && !c.is_parity).unwrap();
        let message = DataMessage::new(
            bundle_id,
            prepared.chunk_id,
            state.total_chunks,
            prepared.block_id,
            prepared.k,
            prepared.r,
            false,
            prepared.payload.clone(),
        );
        if state
            .pool
            .insert(ChunkContext::new(chunk_id, false, now_ms), prepared.payload.clone())
            .is_none()
        {
            warn!(chunk_id, "chunk pool full; retransmission tracking lost for this chunk");
        }
        output.push_back(OutboundChunk {
            dst: state.dst.clone(),
            message,
        });
    }

    fn queue_parity(
        output: &mut VecDeque<OutboundChunk>,
        bundle_id: BundleId,
        state: &mut SendState,
        chunk_id: u32,
        now_ms: u64,
    ) {
        let prepared = state.chunks.iter().find(|c| c.chunk_id == chunk_id).unwrap();
        let message = DataMessage::new(
            bundle_id,
            prepared.chunk_id,
            state.total_chunks,
            prepared.block_id,
            prepared.k,
            prepared.r,
            true,
            prepared.payload.clone(),
        );
        state.sent_parity.insert(chunk_id);
        output.push_back(OutboundChunk {
            dst: state.dst.clone(),
            message,
        });
    }

    /// Process a SACK, advancing the window and sampling RTT for newly
    /// acknowledged chunks that were never retransmitted (Karn's rule).
    pub fn on_sack(
        &mut self,
        bundle_id: BundleId,
        recv_watermark: u32,
        is_set: impl Fn(u32) -> bool,
        bitmap_bits: u32,
        now_ms: u64,
    ) {
        let Some(state) = self.bundles.get_mut(&bundle_id) else {
            return;
        };
        for id in 0..recv_watermark.max(state.window_start) {
            Self::ack_one(state, id, now_ms);
        }
        for i in 0..bitmap_bits {
            if is_set(i) {
                Self::ack_one(state, recv_watermark + i, now_ms);
            }
        }
        state.window_start = state.window_start.max(recv_watermark);
        if state.acked.len() as u32 >= state.total_chunks {
            state.complete = true;
        }
        Self::fill_window(&mut self.output, &self.config, bundle_id, state, now_ms);
    }

    fn ack_one(state: &mut SendState, chunk_id: u32, now_ms: u64) {
        if chunk_id >= state.total_chunks || state.acked.contains(&chunk_id) {
            return;
        }
        state.acked.insert(chunk_id);
        if let Some(entry) = state.pool.get_by_chunk_id(chunk_id) {
            if entry.context.retry_count == 0 {
                let rtt = (now_ms.saturating_sub(entry.context.first_sent_at)) as f64;
                state.rtt.sample(rtt);
            }
            state.pool.remove_by_chunk_id(chunk_id);
        }
    }

    /// Mark a bundle fully delivered — drops all local send-side state.
    pub fn on_delivered(&mut self, bundle_id: BundleId) {
        self.bundles.remove(&bundle_id);
    }

    /// Advance time: retransmit chunks whose RTO has elapsed, expire bundles
    /// past their TTL.
    pub fn tick(&mut self, now_ms: u64) -> Vec<BundleId> {
        let mut expired = Vec::new();
        for (bundle_id, state) in self.bundles.iter_mut() {
            if now_ms >= state.deadline_ms && !state.complete {
                expired.push(*bundle_id);
                continue;
            }
            let rto = state.rtt.rto_ms();
            let due: Vec<u32> = state
                .pool
                .iter()
                .filter(|(_, e)| !e.context.is_parity && now_ms.saturating_sub(e.context.last_sent_at) >= rto)
                .map(|(_, e)| e.context.chunk_id)
                .collect();
            for chunk_id in due {
                let prepared = state
                    .chunks
                    .iter()
                    .find(|c| c.chunk_id == chunk_id && !c.is_parity)
                    .unwrap();
                let message = DataMessage::new(
                    *bundle_id,
                    prepared.chunk_id,
                    state.total_chunks,
                    prepared.block_id,
                    prepared.k,
                    prepared.r,
                    false,
                    prepared.payload.clone(),
                );
                if let Some(handle) = state.pool.handle_for(chunk_id) {
                    if let Some(entry) = state.pool.get_mut(handle) {
                        entry.context.retry_count += 1;
                        entry.context.last_sent_at = now_ms;
                    }
                }
                state.rtt.backoff();
                self.output.push_back(OutboundChunk { dst: state.dst.clone(), message });
            }
        }
        for bundle_id in &expired {
            self.bundles.remove(bundle_id);
        }
        expired
    }

    /// Drain chunks queued for transmission since the last call.
    pub fn drain_output(&mut self) -> Vec<OutboundChunk> {
        self.output.drain(..).collect()
    }

    pub fn is_complete(&self, bundle_id: &BundleId) -> bool {
        self.bundles.get(bundle_id).map(|s| s.complete).unwrap_or(false)
    }

    pub fn in_flight_bundle_count(&self) -> usize {
        self.bundles.len()
    }

    /// The total data-chunk count for a submitted bundle, for persisting
    /// alongside its bundle row.
    pub fn total_chunks(&self, bundle_id: &BundleId) -> Option<u32> {
        self.bundles.get(bundle_id).map(|s| s.total_chunks)
    }

    /// Every chunk (data and parity) generated for a submitted bundle, for
    /// persisting right after `submit` returns.
    pub fn snapshot_chunks(&self, bundle_id: &BundleId) -> Vec<ChunkSnapshot> {
        self.bundles
            .get(bundle_id)
            .map(|s| {
                s.chunks
                    .iter()
                    .map(|c| ChunkSnapshot {
                        chunk_id: c.chunk_id,
                        block_id: c.block_id,
                        k: c.k,
                        r: c.r,
                        is_parity: c.is_parity,
                        payload: c.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
