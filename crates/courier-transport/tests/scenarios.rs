//! Multi-tick integration scenarios driving the Send and Receive engines
//! directly against a simulated lossy channel and a fake millisecond clock —
//! no real sockets, no real time, so runs are deterministic and fast.

use bytes::Bytes;
use courier_core::ids::{BundleId, Endpoint};
use courier_transport::custody::{CustodyConfig, CustodyManager, ReleasePolicy};
use courier_transport::receive::{ReceiveConfig, ReceiveEngine, ReceiverMessage};
use courier_transport::send::{FecParams, SendConfig, SendEngine};
use courier_transport::store::{BundleRow, ChunkRow, Store};
use courier_transport::wire::{CustodyAckMessage, CustodyReqMessage};

fn bid() -> BundleId {
    BundleId::from_bytes([42u8; 16])
}

fn dst() -> Endpoint {
    Endpoint("receiver:9000".into())
}

fn src() -> Endpoint {
    Endpoint("sender:9000".into())
}

/// Outcome of pumping a send/receive pair to completion.
struct DeliveryStats {
    /// Distinct data chunk ids that went out at least once (parity excluded;
    /// parity is sent exactly once per block and never retransmitted).
    first_sends: u32,
    /// Data chunk sends beyond the first for the same chunk id — the cost a
    /// loss pattern actually imposes on the link.
    retransmits: u32,
}

/// Pumps a send/receive engine pair to completion, dropping chunk ids for
/// which `drop_chunk` returns true exactly once (so retransmissions still
/// get through).
fn run_to_delivery(
    send: &mut SendEngine,
    recv: &mut ReceiveEngine,
    drop_chunk: impl Fn(u32, u32) -> bool,
) -> DeliveryStats {
    let mut already_dropped: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
    let mut ever_sent: std::collections::HashSet<u32> = std::collections::HashSet::new();
    let mut first_sends = 0u32;
    let mut retransmits = 0u32;
    let mut now = 0u64;

    for _ in 0..100_000 {
        for outbound in send.drain_output() {
            if !outbound.message.is_parity {
                if ever_sent.insert(outbound.message.chunk_id) {
                    first_sends += 1;
                } else {
                    retransmits += 1;
                }
            }
            let attempt = *already_dropped.entry(outbound.message.chunk_id).or_insert(0u32);
            if !outbound.message.is_parity && drop_chunk(outbound.message.chunk_id, attempt) {
                already_dropped.insert(outbound.message.chunk_id, attempt + 1);
                continue;
            }
            recv.on_data(outbound.message, src(), now);
        }

        for envelope in recv.drain_output() {
            if let ReceiverMessage::Sack(sack) = envelope.message {
                let bitmap = sack.bitmap.clone();
                send.on_sack(
                    sack.bundle_id,
                    sack.recv_watermark,
                    move |i| bitmap.get((i / 8) as usize).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false),
                    (sack.bitmap.len() as u32) * 8,
                    now,
                );
            }
        }

        if recv.is_complete(&bid()) {
            return DeliveryStats { first_sends, retransmits };
        }

        now += 10;
        send.tick(now);
        recv.tick(now);
    }
    panic!("bundle never reached DELIVERED within the tick budget");
}

#[test]
fn clean_link_delivers_with_no_retransmission() {
    let mut config = SendConfig::default();
    config.chunk_size = 1150;
    let payload = Bytes::from(vec![0xABu8; 1150 * 20]);
    let expected_chunks = payload.len().div_ceil(config.chunk_size) as u32;

    let mut send = SendEngine::new(config);
    let mut recv = ReceiveEngine::new(ReceiveConfig::default());
    send.submit(bid(), dst(), payload.clone(), 0).unwrap();

    let stats = run_to_delivery(&mut send, &mut recv, |_, _| false);

    assert_eq!(stats.first_sends, expected_chunks, "every chunk should go out exactly once");
    assert_eq!(stats.retransmits, 0, "clean link should need no retransmissions");
    let delivered = recv.drain_completed();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].data, payload);
}

#[test]
fn lossy_link_without_fec_still_delivers_byte_identical() {
    let mut config = SendConfig::default();
    config.chunk_size = 500;
    config.base_rto_ms = 40;
    let payload: Bytes = (0..20_000u32).map(|b| (b % 256) as u8).collect::<Vec<u8>>().into();

    let mut send = SendEngine::new(config);
    let mut recv = ReceiveEngine::new(ReceiveConfig::default());
    send.submit(bid(), dst(), payload.clone(), 0).unwrap();

    // Drop every 7th chunk's first transmission attempt only; the
    // retransmission always gets through.
    let stats = run_to_delivery(&mut send, &mut recv, |chunk_id, attempt| chunk_id % 7 == 0 && attempt == 0);

    let delivered = recv.drain_completed();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].data, payload, "assembled bytes must match the source exactly");
    assert!(stats.retransmits > 0, "loss should force at least one retransmission");
}

#[test]
fn fec_enabled_reduces_retransmissions_under_the_same_loss_pattern() {
    let loss = |chunk_id: u32, attempt: u32| chunk_id % 7 == 0 && attempt == 0;
    let payload: Bytes = (0..20_000u32).map(|b| (b % 256) as u8).collect::<Vec<u8>>().into();

    let mut no_fec_config = SendConfig::default();
    no_fec_config.chunk_size = 500;
    no_fec_config.base_rto_ms = 40;
    let mut send_no_fec = SendEngine::new(no_fec_config);
    let mut recv_no_fec = ReceiveEngine::new(ReceiveConfig::default());
    send_no_fec.submit(bid(), dst(), payload.clone(), 0).unwrap();
    let stats_no_fec = run_to_delivery(&mut send_no_fec, &mut recv_no_fec, loss);

    let mut fec_config = SendConfig::default();
    fec_config.chunk_size = 500;
    fec_config.base_rto_ms = 40;
    fec_config.fec = Some(FecParams { k: 4, r: 2 });
    let mut send_fec = SendEngine::new(fec_config);
    let mut recv_fec = ReceiveEngine::new(ReceiveConfig::default());
    send_fec.submit(bid(), dst(), payload.clone(), 0).unwrap();
    let stats_fec = run_to_delivery(&mut send_fec, &mut recv_fec, loss);

    assert_eq!(recv_fec.drain_completed()[0].data, payload);
    assert!(stats_no_fec.retransmits > 0, "the non-FEC run should need at least one retransmission");
    assert_eq!(
        stats_fec.retransmits, 0,
        "FEC should recover every single-chunk loss within a block without a retransmission round trip"
    );
}

#[test]
fn relay_custody_releases_on_covering_ack_and_delivered_cascades() {
    let mut custody = CustodyManager::new(CustodyConfig {
        max_retries: 10,
        backoff_base_sec: 2,
        backoff_cap_sec: 64,
        release_policy: ReleasePolicy::Eager,
        cap_bytes: 1024 * 1024,
        chunk_size: 1150,
    });

    let upstream = Endpoint("node-a:9000".into());
    let next_hop = Endpoint("node-c:9000".into());
    let req = CustodyReqMessage {
        bundle_id: bid(),
        ttl_remaining: 300,
        dst: "final:9000".into(),
        ranges: vec![courier_transport::wire::ChunkRange { start: 0, end: 9 }],
    };

    custody.on_custody_req(bid(), &req, upstream.clone(), next_hop.clone(), 0);
    assert_eq!(custody.record_count(), 1);

    let ack_events = custody.drain_output();
    let nonce = ack_events
        .iter()
        .find_map(|event| match event {
            courier_transport::custody::CustodyEvent::Ack(_, ack) => Some(ack.ack_nonce),
            _ => None,
        })
        .expect("accepted offer should emit a CUSTODY_ACK upstream");

    let covering_ack = CustodyAckMessage {
        bundle_id: bid(),
        ack_nonce: nonce,
        ranges: vec![courier_transport::wire::ChunkRange { start: 0, end: 9 }],
    };
    custody.on_custody_ack(bid(), &covering_ack);

    assert_eq!(custody.record_count(), 0, "a fully covering ACK releases the record under the eager policy");
}

#[test]
fn store_survives_a_restart_at_partial_progress() {
    let store = Store::open_in_memory().unwrap();
    let bundle_id = bid();

    store
        .put_bundle(&BundleRow {
            bundle_id,
            src: "a".into(),
            dst: "b".into(),
            ttl_ms: 300_000,
            length: 4000,
            total_chunks: 4,
            fec_enabled: false,
            k: 1,
            r: 0,
            state: "IN_FLIGHT".into(),
            bytes_sent: 2000,
            chunks_retransmitted: 0,
        })
        .unwrap();

    for chunk_id in 0..2u32 {
        store
            .put_chunk(&ChunkRow {
                bundle_id,
                chunk_id,
                is_parity: false,
                block_id: 0,
                k: 1,
                r: 0,
                checksum: 0,
                payload: vec![0u8; 1000],
            })
            .unwrap();
    }

    // Simulate process restart: reopen recovery entry points against the
    // same connection (an in-memory store stands in for the file on disk).
    let resumed = store.load_in_flight_bundles().unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].bundle_id, bundle_id);

    let chunks = store.load_chunks(&bundle_id).unwrap();
    assert_eq!(chunks.len(), 2, "chunks persisted before the restart are still there");
}
