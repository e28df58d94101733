//! # Receive Engine
//!
//! Pure logic — no I/O. Accepts decoded DATA messages, deduplicates against
//! chunks already seen, recovers single-erasure FEC blocks, advances the
//! cumulative receive watermark, and emits SACKs on a schedule. Assembly is a
//! plain concatenation of chunks `0..total_chunks` — the sender gives the
//! final, possibly short, chunk its own solo FEC block, so no member is ever
//! padded and no truncation is needed here.

use bytes::{Bytes, BytesMut};
use courier_core::ids::{BundleId, Endpoint};
use std::collections::{HashMap, VecDeque};

use crate::fec::BlockDecoder;
use crate::wire::{DataMessage, DeliveredMessage, SackMessage};

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    /// How often to emit a SACK for a bundle with outstanding gaps, absent
    /// any event that triggers one sooner.
    pub sack_interval_ms: u64,
    /// Emit a SACK immediately once this many new chunks have landed since
    /// the last one.
    pub sack_every_n_chunks: u32,
    /// Width, in chunks, of the SACK bitmap anchored at the watermark.
    pub sack_bitmap_span: u32,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        ReceiveConfig {
            sack_interval_ms: 100,
            sack_every_n_chunks: 32,
            sack_bitmap_span: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReceiverMessage {
    Sack(SackMessage),
    Delivered(DeliveredMessage),
}

#[derive(Debug, Clone)]
pub struct OutboundReceiverMessage {
    pub dst: Endpoint,
    pub message: ReceiverMessage,
}

/// A fully reassembled bundle, ready to be handed to the application layer.
#[derive(Debug, Clone)]
pub struct CompletedBundle {
    pub bundle_id: BundleId,
    pub data: Bytes,
}

struct RecvState {
    src: Endpoint,
    total_chunks: u32,
    data: HashMap<u32, Bytes>,
    decoder: BlockDecoder,
    /// Lowest chunk id of each block, derived once from its first member —
    /// blocks are contiguous ranges of `k` chunk ids starting at a multiple
    /// of `k`, so `chunk_id - chunk_id % k` is stable no matter which member
    /// arrives first.
    block_start: HashMap<u32, u32>,
    recv_watermark: u32,
    new_since_sack: u32,
    last_sack_at: u64,
    complete: bool,
}

/// Drives every in-flight inbound bundle.
pub struct ReceiveEngine {
    config: ReceiveConfig,
    bundles: HashMap<BundleId, RecvState>,
    output: VecDeque<OutboundReceiverMessage>,
    completed: Vec<CompletedBundle>,
}

impl ReceiveEngine {
    pub fn new(config: ReceiveConfig) -> Self {
        ReceiveEngine {
            config,
            bundles: HashMap::new(),
            output: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    /// Process one DATA message arriving from `src`.
    pub fn on_data(&mut self, msg: DataMessage, src: Endpoint, now_ms: u64) {
        let bundle_id = msg.bundle_id;
        let state = self.bundles.entry(bundle_id).or_insert_with(|| RecvState {
            src: src.clone(),
            total_chunks: msg.total_chunks,
            data: HashMap::new(),
            decoder: BlockDecoder::new(),
            block_start: HashMap::new(),
            recv_watermark: 0,
            new_since_sack: 0,
            last_sack_at: now_ms,
            complete: false,
        });

        if state.complete || state.data.contains_key(&msg.chunk_id) {
            return;
        }

        let k = (msg.k as u32).max(1);
        if msg.is_parity {
            state.decoder.add_parity_chunk(msg.block_id, k, msg.payload.clone());
        } else {
            // Parity chunk ids legitimately sit at or above total_chunks; only
            // non-parity chunk ids are bounded by it.
            if msg.chunk_id >= state.total_chunks {
                return;
            }
            let idx = msg.chunk_id % k;
            state.block_start.entry(msg.block_id).or_insert(msg.chunk_id - idx);
            state.decoder.add_data_chunk(msg.block_id, idx, k, msg.payload.clone());
            state.data.insert(msg.chunk_id, msg.payload);
            state.new_since_sack += 1;
        }

        if state.decoder.is_complete(msg.block_id) {
            state.decoder.remove_block(msg.block_id);
        } else if let Some((idx, payload)) = state.decoder.try_recover(msg.block_id) {
            if let Some(&start) = state.block_start.get(&msg.block_id) {
                let recovered_id = start + idx;
                if !state.data.contains_key(&recovered_id) {
                    state.data.insert(recovered_id, payload);
                    state.new_since_sack += 1;
                }
            }
            state.decoder.remove_block(msg.block_id);
        }

        let mut gap_filled = false;
        while state.data.contains_key(&state.recv_watermark) {
            state.recv_watermark += 1;
            gap_filled = true;
        }

        if state.recv_watermark >= state.total_chunks {
            Self::finish_bundle(&mut self.output, &mut self.completed, bundle_id, state);
            return;
        }

        let due = gap_filled || state.new_since_sack >= self.config.sack_every_n_chunks;
        if due {
            Self::emit_sack(&mut self.output, &self.config, bundle_id, state, now_ms);
        }
    }

    fn finish_bundle(
        output: &mut VecDeque<OutboundReceiverMessage>,
        completed: &mut Vec<CompletedBundle>,
        bundle_id: BundleId,
        state: &mut RecvState,
    ) {
        let mut assembled = BytesMut::new();
        for id in 0..state.total_chunks {
            if let Some(chunk) = state.data.get(&id) {
                assembled.extend_from_slice(chunk);
            }
        }
        state.data.clear();
        state.complete = true;
        completed.push(CompletedBundle {
            bundle_id,
            data: assembled.freeze(),
        });
        output.push_back(OutboundReceiverMessage {
            dst: state.src.clone(),
            message: ReceiverMessage::Delivered(DeliveredMessage { bundle_id }),
        });
    }

    fn emit_sack(
        output: &mut VecDeque<OutboundReceiverMessage>,
        config: &ReceiveConfig,
        bundle_id: BundleId,
        state: &mut RecvState,
        now_ms: u64,
    ) {
        let mut bitmap = vec![0u8; (config.sack_bitmap_span as usize).div_ceil(8)];
        for i in 0..config.sack_bitmap_span {
            if state.data.contains_key(&(state.recv_watermark + i)) {
                bitmap[(i / 8) as usize] |= 1 << (i % 8);
            }
        }
        let message = SackMessage {
            bundle_id,
            recv_watermark: state.recv_watermark,
            bitmap: Bytes::from(bitmap),
        };
        output.push_back(OutboundReceiverMessage {
            dst: state.src.clone(),
            message: ReceiverMessage::Sack(message),
        });
        state.new_since_sack = 0;
        state.last_sack_at = now_ms;
    }

    /// Advance time: emit a catch-up SACK for any bundle whose interval has
    /// elapsed since its last one.
    pub fn tick(&mut self, now_ms: u64) {
        for (bundle_id, state) in self.bundles.iter_mut() {
            if state.complete {
                continue;
            }
            if now_ms.saturating_sub(state.last_sack_at) >= self.config.sack_interval_ms {
                Self::emit_sack(&mut self.output, &self.config, *bundle_id, state, now_ms);
            }
        }
    }

    pub fn drain_output(&mut self) -> Vec<OutboundReceiverMessage> {
        self.output.drain(..).collect()
    }

    pub fn drain_completed(&mut self) -> Vec<CompletedBundle> {
        std::mem::take(&mut self.completed)
    }

    pub fn is_complete(&self, bundle_id: &BundleId) -> bool {
        self.bundles.get(bundle_id).map(|s| s.complete).unwrap_or(false)
    }

    pub fn outstanding_bundle_count(&self) -> usize {
        self.bundles.values().filter(|s| !s.complete).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(n: u8) -> BundleId {
        BundleId::from_bytes([n; 16])
    }

    fn src() -> Endpoint {
        Endpoint("127.0.0.1:9000".into())
    }

    fn data_msg(bundle: BundleId, chunk_id: u32, total: u32, block_id: u32, payload: &[u8]) -> DataMessage {
        DataMessage::new(bundle, chunk_id, total, block_id, 1, 0, false, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn single_chunk_bundle_completes_immediately() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        rx.on_data(data_msg(bid(1), 0, 1, 0, b"hello"), src(), 0);
        let done = rx.drain_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, Bytes::from_static(b"hello"));

        let out = rx.drain_output();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, ReceiverMessage::Delivered(_)));
    }

    #[test]
    fn out_of_order_chunks_assemble_in_order() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        rx.on_data(data_msg(bid(1), 1, 3, 0, b"BBB"), src(), 0);
        rx.on_data(data_msg(bid(1), 2, 3, 0, b"CCC"), src(), 0);
        assert!(rx.drain_completed().is_empty());
        rx.on_data(data_msg(bid(1), 0, 3, 0, b"AAA"), src(), 0);

        let done = rx.drain_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, Bytes::from_static(b"AAABBBCCC"));
    }

    #[test]
    fn duplicate_chunk_is_ignored() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        rx.on_data(data_msg(bid(1), 0, 2, 0, b"AAAA"), src(), 0);
        rx.on_data(data_msg(bid(1), 0, 2, 0, b"AAAA"), src(), 10);
        rx.on_data(data_msg(bid(1), 1, 2, 0, b"BBBB"), src(), 20);
        let done = rx.drain_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, Bytes::from_static(b"AAAABBBB"));
    }

    #[test]
    fn gap_fill_triggers_immediate_sack() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        // total_chunks=4 so the bundle doesn't complete on the gap fill.
        rx.on_data(data_msg(bid(1), 1, 4, 0, b"b"), src(), 0);
        assert!(rx.drain_output().is_empty(), "no gap closed yet, no watermark advance");

        rx.on_data(data_msg(bid(1), 0, 4, 0, b"a"), src(), 5);
        let out = rx.drain_output();
        assert_eq!(out.len(), 1);
        match &out[0].message {
            ReceiverMessage::Sack(s) => assert_eq!(s.recv_watermark, 2),
            _ => panic!("expected SACK"),
        }
    }

    #[test]
    fn tick_emits_catchup_sack_after_interval() {
        let mut rx = ReceiveEngine::new(ReceiveConfig {
            sack_interval_ms: 100,
            ..Default::default()
        });
        rx.on_data(data_msg(bid(1), 1, 4, 0, b"b"), src(), 0);
        rx.drain_output();

        rx.tick(50);
        assert!(rx.drain_output().is_empty(), "interval not elapsed");

        rx.tick(120);
        let out = rx.drain_output();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, ReceiverMessage::Sack(_)));
    }

    #[test]
    fn sack_every_n_chunks_fires_without_gap_fill() {
        let mut rx = ReceiveEngine::new(ReceiveConfig {
            sack_every_n_chunks: 2,
            ..Default::default()
        });
        // chunk 0 arrives first (advances watermark, doesn't count as a "gap fill" event
        // distinct from normal progress) then two more out-of-order chunks trip the counter.
        rx.on_data(data_msg(bid(1), 0, 10, 0, b"a"), src(), 0);
        rx.drain_output();
        rx.on_data(data_msg(bid(1), 5, 10, 0, b"f"), src(), 1);
        rx.on_data(data_msg(bid(1), 6, 10, 0, b"g"), src(), 2);
        let out = rx.drain_output();
        assert_eq!(out.len(), 1, "sack fires once the new-chunk counter trips");
    }

    #[test]
    fn fec_recovers_missing_data_chunk_via_parity() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        let a = Bytes::from_static(b"aaaa");
        let b = Bytes::from_static(b"bbbb");
        let parity = crate::fec::BlockEncoder::new(1).encode(&[a.clone(), b.clone()]);

        rx.on_data(DataMessage::new(bid(1), 0, 2, 0, 2, 1, false, a.clone()), src(), 0);
        // chunk 1 lost; parity arrives instead.
        rx.on_data(DataMessage::new(bid(1), 2, 2, 0, 2, 1, true, parity[0].clone()), src(), 5);

        let done = rx.drain_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, Bytes::from_static(b"aaaabbbb"));
    }

    #[test]
    fn unrecoverable_block_stalls_completion() {
        let mut rx = ReceiveEngine::new(ReceiveConfig::default());
        // Two data chunks missing out of k=3, one parity present: unrecoverable.
        rx.on_data(DataMessage::new(bid(1), 0, 3, 0, 3, 1, false, Bytes::from_static(b"a")), src(), 0);
        rx.on_data(DataMessage::new(bid(1), 3, 3, 0, 3, 1, true, Bytes::from_static(b"x")), src(), 1);
        assert!(rx.drain_completed().is_empty());
        assert_eq!(rx.outstanding_bundle_count(), 1);
    }
}
