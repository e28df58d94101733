//! # Node Orchestrator
//!
//! Owns the socket, the store, and the three pure-logic engines, and drives
//! them with a real millisecond clock. This is the one place in the crate
//! that talks to the network and the filesystem — everything it calls into
//! is otherwise deterministic and clock-agnostic.

use bytes::Bytes;
use courier_core::config::CourierConfig;
use courier_core::error::CourierError;
use courier_core::ids::{BundleId, Endpoint};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::custody::{self, format_ranges, parse_ranges, CustodyConfig, CustodyEvent, CustodyManager};
use crate::io::DatagramIo;
use crate::receive::{ReceiveConfig, ReceiveEngine, ReceiverMessage};
use crate::send::{FecParams, OutboundChunk, SendConfig, SendEngine};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::store::{BundleRow, ChunkRow, CustodyRow, Store};
use crate::wire::{ChunkRange, DataMessage, Message};

/// How long the tick loop blocks waiting for the first inbound datagram
/// before running its own `tick(now)` pass regardless.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// How often `purge_expired` runs against the store, in ticks, since it is
/// a table scan and need not run on every 10ms tick.
const PURGE_EVERY_N_TICKS: u32 = 100;

pub struct Node {
    io: DatagramIo,
    send: SendEngine,
    receive: ReceiveEngine,
    custody: CustodyManager,
    store: Store,
    relay_next_hop: Option<Endpoint>,
    /// Bundles this node is forwarding on behalf of an upstream holder,
    /// keyed by bundle id, mapped to the real final destination. Populated
    /// when a CUSTODY_REQ is accepted; consulted by `flush_receive_output`
    /// to forward instead of delivering locally, and to suppress the
    /// locally-complete DELIVERED notice this node's own receive engine
    /// would otherwise emit (this node isn't the real recipient).
    relay_targets: HashMap<BundleId, Endpoint>,
    ttl_sec: u64,
    out_dir: PathBuf,
    started: Instant,
    tick_count: u32,
    stats: TransportStats,
}

impl Node {
    /// Binds the datagram socket, opens (or creates) the store at
    /// `store_path`, and rebuilds in-flight state from it.
    pub fn start(config: &CourierConfig, store_path: &Path) -> Result<Self, CourierError> {
        let io = DatagramIo::bind(("0.0.0.0", config.node.port))?;

        let store = if store_path.as_os_str() == "memory" {
            Store::open_in_memory()?
        } else {
            Store::open(store_path)?
        };

        let send_config = SendConfig {
            chunk_size: config.transfer.chunk_size,
            window_size: config.transfer.window_size as u32,
            base_rto_ms: config.transfer.base_rto_ms,
            max_rto_ms: config.transfer.max_rto_ms,
            ttl_sec: config.transfer.ttl_sec,
            fec: config
                .fec
                .enabled
                .then_some(FecParams { k: config.fec.k as u8, r: config.fec.r as u8 }),
        };

        let release_policy = match config.custody.release_policy {
            courier_core::config::ReleasePolicy::Eager => custody::ReleasePolicy::Eager,
            courier_core::config::ReleasePolicy::Deferred => custody::ReleasePolicy::Deferred,
        };
        let custody_config = CustodyConfig {
            max_retries: config.custody.max_retries,
            backoff_base_sec: config.custody.backoff_base_sec,
            backoff_cap_sec: config.custody.backoff_cap_sec,
            release_policy,
            cap_bytes: config.storage.cap_bytes,
            chunk_size: config.transfer.chunk_size as u64,
        };

        let mut node = Node {
            io,
            send: SendEngine::new(send_config),
            receive: ReceiveEngine::new(ReceiveConfig::default()),
            custody: CustodyManager::new(custody_config),
            store,
            relay_next_hop: config.node.relay_next_hop.clone().map(Endpoint),
            relay_targets: HashMap::new(),
            ttl_sec: config.transfer.ttl_sec,
            out_dir: PathBuf::from("./received"),
            started: Instant::now(),
            tick_count: 0,
            stats: TransportStats::new(),
        };
        node.rebuild_from_store()?;
        Ok(node)
    }

    /// Directory delivered (non-relayed) bundles are written to, keyed by
    /// bundle id. Defaults to `./received` if never called.
    pub fn set_out_dir(&mut self, dir: PathBuf) {
        self.out_dir = dir;
    }

    /// Rehydrate in-flight sends, in-flight receives, and held custody
    /// records from the store after a restart. Outbound bundles (`src ==
    /// "self"`) are reconstructed from their persisted chunk rows and handed
    /// back to `send.submit`, which re-populates the sliding window exactly
    /// as a fresh submission would. Inbound bundles are replayed chunk by
    /// chunk through `receive.on_data`, reusing the same dedup/FEC/assembly
    /// path a live datagram would take.
    fn rebuild_from_store(&mut self) -> Result<(), CourierError> {
        let now = self.now_ms();
        let in_flight = self.store.load_in_flight_bundles()?;
        for row in &in_flight {
            let chunks = self.store.load_chunks(&row.bundle_id)?;
            if row.src == "self" {
                let mut data_chunks: Vec<&ChunkRow> = chunks.iter().filter(|c| !c.is_parity).collect();
                data_chunks.sort_by_key(|c| c.chunk_id);
                let mut assembled = Vec::with_capacity(row.length as usize);
                for chunk in &data_chunks {
                    assembled.extend_from_slice(&chunk.payload);
                }
                if !assembled.is_empty() {
                    if let Err(e) = self.send.submit(row.bundle_id, Endpoint(row.dst.clone()), Bytes::from(assembled), now) {
                        warn!(bundle_id = %row.bundle_id, error = %e, "failed to resume outbound bundle");
                    }
                }
            } else {
                for chunk in &chunks {
                    let message = DataMessage::new(
                        chunk.bundle_id,
                        chunk.chunk_id,
                        row.total_chunks,
                        chunk.block_id,
                        chunk.k,
                        chunk.r,
                        chunk.is_parity,
                        Bytes::from(chunk.payload.clone()),
                    );
                    self.receive.on_data(message, Endpoint(row.src.clone()), now);
                }
            }
            debug!(bundle_id = %row.bundle_id, chunks = chunks.len(), "resumed in-flight bundle from store");
        }

        let custody_rows = self.store.load_custody_records()?;
        for row in &custody_rows {
            let ranges = parse_ranges(&row.chunk_ranges);
            // `CustodyRow` has no column for the bundle's final destination,
            // so a resumed record can't re-populate it; the next re-offer
            // after a restart carries an empty `dst` until this node
            // receives a fresh CUSTODY_REQ for the same bundle. Documented
            // limitation (see DESIGN.md) rather than a schema migration.
            self.custody.resume(
                row.bundle_id,
                Endpoint(row.owner_node.clone()),
                Endpoint(String::new()),
                ranges,
                row.retry_timer,
                row.retry_count,
                row.ack_nonce,
            );
        }
        debug!(records = custody_rows.len(), "resumed custody records from store");
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Submit a file for transfer to `dst`, persisting the bundle and every
    /// chunk before anything is queued for transmission. If a relay next hop
    /// is configured, this node also offers custody of the whole bundle to
    /// it and shadow-sends every chunk there (see `flush_send_output`), so
    /// the relay can forward the bundle onward if the direct path to `dst`
    /// is disrupted.
    pub fn submit(&mut self, dst: Endpoint, data: Bytes) -> Result<BundleId, CourierError> {
        let bundle_id = BundleId::generate();
        let now = self.now_ms();
        self.originate(bundle_id, dst, data, now)?;
        self.flush_send_output()?;
        Ok(bundle_id)
    }

    /// Persist a bundle and every generated chunk, then queue it for
    /// transmission — shared by fresh submissions and by a relay forwarding
    /// a bundle it finished assembling on behalf of an upstream holder.
    fn originate(&mut self, bundle_id: BundleId, dst: Endpoint, data: Bytes, now: u64) -> Result<(), CourierError> {
        let length = data.len() as u64;
        self.send.submit(bundle_id, dst.clone(), data, now)?;
        let total_chunks = self.send.total_chunks(&bundle_id).unwrap_or(0);

        self.store.put_bundle(&BundleRow {
            bundle_id,
            src: "self".to_string(),
            dst: dst.0.clone(),
            ttl_ms: now + self.send_ttl_ms(),
            length,
            total_chunks,
            fec_enabled: false,
            k: 1,
            r: 0,
            state: "IN_FLIGHT".to_string(),
            bytes_sent: 0,
            chunks_retransmitted: 0,
        })?;
        for chunk in self.send.snapshot_chunks(&bundle_id) {
            self.store.put_chunk(&ChunkRow {
                bundle_id,
                chunk_id: chunk.chunk_id,
                is_parity: chunk.is_parity,
                block_id: chunk.block_id,
                k: chunk.k,
                r: chunk.r,
                checksum: crc32fast::hash(&chunk.payload),
                payload: chunk.payload.to_vec(),
            })?;
        }

        if total_chunks > 0 {
            if let Some(next_hop) = self.relay_next_hop.clone() {
                let ranges = vec![ChunkRange { start: 0, end: total_chunks - 1 }];
                let ack_nonce = self.custody.offer(bundle_id, next_hop.clone(), dst, ranges.clone(), self.ttl_sec, now);
                self.store.put_custody(&CustodyRow {
                    bundle_id,
                    owner_node: next_hop.0,
                    chunk_ranges: format_ranges(&ranges),
                    acquired_at: now,
                    retry_timer: now,
                    retry_count: 0,
                    ack_nonce,
                    state: "HELD".to_string(),
                })?;
            }
        }
        Ok(())
    }

    fn send_ttl_ms(&self) -> u64 {
        self.ttl_sec * 1000
    }

    /// One iteration of the tick loop: drain inbound datagrams, dispatch by
    /// kind, advance every engine's clock, and flush whatever they queued.
    pub fn tick(&mut self) -> Result<(), CourierError> {
        let inbound = self.io.recv_inbound(TICK_INTERVAL);
        for datagram in inbound {
            if let Err(e) = self.dispatch(datagram.payload, datagram.from) {
                warn!(error = %e, from = %datagram.from, "dropping malformed datagram");
            }
        }

        let now = self.now_ms();
        let expired = self.send.tick(now);
        for bundle_id in expired {
            warn!(bundle_id = %bundle_id, "bundle expired before delivery");
            self.stats.record_bundle_expired();
        }
        self.receive.tick(now);
        self.custody.tick(now);

        self.flush_send_output()?;
        self.flush_receive_output()?;
        self.flush_custody_output()?;

        let io_stats = self.io.stats();
        self.stats
            .record_datagram_dropped_total(io_stats.datagrams_dropped.load(std::sync::atomic::Ordering::Relaxed));
        self.stats.set_custody_counts(self.custody.record_count() as u64, 0);

        self.tick_count = self.tick_count.wrapping_add(1);
        if self.tick_count % PURGE_EVERY_N_TICKS == 0 {
            let purged = self.store.purge_expired(now)?;
            if purged > 0 {
                debug!(purged, "purged expired bundles from store");
            }
        }
        Ok(())
    }

    /// Runs the tick loop forever. Callers that want a graceful shutdown
    /// hook should instead call `tick()` in their own loop.
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.tick() {
                warn!(error = %e, "tick failed");
            }
        }
    }

    fn dispatch(&mut self, payload: Bytes, from: SocketAddr) -> Result<(), CourierError> {
        let message = Message::decode(payload)?;
        let src = Endpoint(from.to_string());
        let now = self.now_ms();
        match message {
            Message::Data(data) => {
                let chunk_row = ChunkRow {
                    bundle_id: data.bundle_id,
                    chunk_id: data.chunk_id,
                    is_parity: data.is_parity,
                    block_id: data.block_id,
                    k: data.k,
                    r: data.r,
                    checksum: data.checksum,
                    payload: data.payload.to_vec(),
                };
                self.store.put_chunk(&chunk_row)?;
                self.stats.record_chunk_received(chunk_row.payload.len());
                self.receive.on_data(data, src, now);
            }
            Message::Sack(sack) => {
                let bitmap = sack.bitmap.clone();
                self.send.on_sack(
                    sack.bundle_id,
                    sack.recv_watermark,
                    move |i| bitmap.get((i / 8) as usize).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false),
                    (sack.bitmap.len() as u32) * 8,
                    now,
                );
            }
            Message::CustodyReq(req) => {
                if let Some(next_hop) = self.relay_next_hop.clone() {
                    let bundle_id = req.bundle_id;
                    let dst = req.dst.clone();
                    let ranges = req.ranges.clone();
                    if let Some(ack_nonce) = self.custody.on_custody_req(bundle_id, &req, src, next_hop.clone(), now) {
                        self.relay_targets.insert(bundle_id, Endpoint(dst.clone()));
                        self.store.put_custody(&CustodyRow {
                            bundle_id,
                            owner_node: next_hop.0,
                            chunk_ranges: format_ranges(&ranges),
                            acquired_at: now,
                            retry_timer: now,
                            retry_count: 0,
                            ack_nonce,
                            state: "HELD".to_string(),
                        })?;
                    }
                }
            }
            Message::CustodyAck(ack) => {
                self.custody.on_custody_ack(ack.bundle_id, &ack);
            }
            Message::Delivered(delivered) => {
                self.send.on_delivered(delivered.bundle_id);
                self.custody.on_delivered(delivered.bundle_id, src);
            }
        }
        Ok(())
    }

    fn flush_send_output(&mut self) -> Result<(), CourierError> {
        for OutboundChunk { dst, message } in self.send.drain_output() {
            let addr = resolve(&dst)?;
            self.stats.record_chunk_sent(message.payload.len());
            let encoded = Message::Data(message.clone()).encode();
            self.io.send_to(&encoded, addr)?;

            // Shadow-send every chunk to the configured relay too, so it can
            // hold custody and forward the bundle onward if the direct path
            // to `dst` is disrupted.
            if let Some(relay) = self.relay_next_hop.clone() {
                if relay != dst {
                    let relay_addr = resolve(&relay)?;
                    self.io.send_to(&encoded, relay_addr)?;
                }
            }
        }
        Ok(())
    }

    fn flush_receive_output(&mut self) -> Result<(), CourierError> {
        for envelope in self.receive.drain_output() {
            // This node is only relaying the bundle on an upstream holder's
            // behalf — its own receive engine finishing its shadow copy isn't
            // a real delivery, so the DELIVERED notice doesn't belong upstream.
            if let ReceiverMessage::Delivered(ref delivered) = envelope.message {
                if self.relay_targets.contains_key(&delivered.bundle_id) {
                    continue;
                }
            }
            let addr = resolve(&envelope.dst)?;
            let wire = match envelope.message {
                ReceiverMessage::Sack(sack) => Message::Sack(sack),
                ReceiverMessage::Delivered(delivered) => Message::Delivered(delivered),
            };
            self.io.send_to(&wire.encode(), addr)?;
        }

        let now = self.now_ms();
        for bundle in self.receive.drain_completed() {
            if let Some(final_dst) = self.relay_targets.remove(&bundle.bundle_id) {
                debug!(bundle_id = %bundle.bundle_id, dst = %final_dst, "relaying completed bundle onward");
                if let Err(e) = self.originate(bundle.bundle_id, final_dst, bundle.data, now) {
                    warn!(bundle_id = %bundle.bundle_id, error = %e, "failed to forward relayed bundle");
                }
                continue;
            }

            std::fs::create_dir_all(&self.out_dir)
                .map_err(|e| CourierError::TransportFault(e.to_string()))?;
            let out_path = self.out_dir.join(bundle.bundle_id.to_hex());
            std::fs::write(&out_path, &bundle.data).map_err(|e| CourierError::TransportFault(e.to_string()))?;

            debug!(bundle_id = %bundle.bundle_id, bytes = bundle.data.len(), path = %out_path.display(), "bundle delivered");
            self.stats.record_bundle_delivered();
            self.store.put_bundle(&BundleRow {
                bundle_id: bundle.bundle_id,
                src: "peer".to_string(),
                dst: "self".to_string(),
                ttl_ms: now,
                length: bundle.data.len() as u64,
                total_chunks: 0,
                fec_enabled: false,
                k: 1,
                r: 0,
                state: "DELIVERED".to_string(),
                bytes_sent: 0,
                chunks_retransmitted: 0,
            })?;
        }
        Ok(())
    }

    fn flush_custody_output(&mut self) -> Result<(), CourierError> {
        for event in self.custody.drain_output() {
            let (dst, wire) = match event {
                CustodyEvent::Ack(dst, ack) => (dst, Message::CustodyAck(ack)),
                CustodyEvent::Req(dst, req) => (dst, Message::CustodyReq(req)),
                CustodyEvent::Delivered(dst, delivered) => (dst, Message::Delivered(delivered)),
            };
            let addr = resolve(&dst)?;
            self.io.send_to(&wire.encode(), addr)?;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CourierError> {
        self.io.local_addr()
    }

    pub fn is_bundle_delivered(&self, bundle_id: &BundleId) -> bool {
        self.send.is_complete(bundle_id) || self.receive.is_complete(bundle_id)
    }

    pub fn in_flight_bundle_count(&self) -> usize {
        self.send.in_flight_bundle_count() + self.receive.outstanding_bundle_count()
    }

    pub fn custody_record_count(&self) -> usize {
        self.custody.record_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, CourierError> {
    SocketAddr::from_str(&endpoint.0).map_err(|e| CourierError::TransportFault(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::config::CourierConfig;

    fn free_port_config() -> CourierConfig {
        let mut config = CourierConfig::default();
        config.node.port = 0;
        config
    }

    #[test]
    fn start_binds_socket_and_opens_in_memory_store() {
        let node = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        assert!(node.local_addr().is_ok());
        assert_eq!(node.in_flight_bundle_count(), 0);
    }

    #[test]
    fn submit_persists_bundle_and_queues_transmission() {
        let mut sender = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        let mut receiver = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let bundle_id = sender
            .submit(Endpoint(receiver_addr.to_string()), Bytes::from_static(b"hello courier"))
            .unwrap();

        assert_eq!(sender.in_flight_bundle_count(), 1);
        let stored = sender.store.get_bundle(&bundle_id).unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn end_to_end_tick_delivers_small_bundle() {
        let mut sender = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        let mut receiver = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let out_dir = std::env::temp_dir().join(format!("courier-test-{}", receiver_addr.port()));
        receiver.set_out_dir(out_dir.clone());

        let bundle_id = sender
            .submit(Endpoint(receiver_addr.to_string()), Bytes::from_static(b"hello courier"))
            .unwrap();

        for _ in 0..20 {
            sender.tick().unwrap();
            receiver.tick().unwrap();
            if receiver.is_bundle_delivered(&bundle_id) {
                break;
            }
        }

        assert!(receiver.is_bundle_delivered(&bundle_id), "bundle should be delivered within a handful of ticks");
        let written = std::fs::read(out_dir.join(bundle_id.to_hex())).expect("delivered bundle written to out_dir");
        assert_eq!(written, b"hello courier");
        let _ = std::fs::remove_dir_all(&out_dir);
    }

    #[test]
    fn relay_target_suppresses_local_delivery_bookkeeping() {
        let mut relay = Node::start(&free_port_config(), Path::new("memory")).unwrap();
        let final_dst = Endpoint("127.0.0.1:1".into());
        let bundle_id = BundleId::generate();
        relay.relay_targets.insert(bundle_id, final_dst.clone());

        let out_dir = std::env::temp_dir().join(format!("courier-test-relay-{}", std::process::id()));
        relay.set_out_dir(out_dir.clone());

        // Forwarding a bundle this node holds custody for on behalf of an
        // upstream holder goes through `originate`, never `out_dir`.
        relay.originate(bundle_id, final_dst, Bytes::from_static(b"never written"), 0).unwrap();

        assert!(!out_dir.exists(), "relay forwarding must not write to out_dir");
        assert_eq!(relay.in_flight_bundle_count(), 1, "forwarded bundle is now in-flight as an outbound send");
    }
}
