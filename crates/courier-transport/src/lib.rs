//! # courier-transport
//!
//! Reliable, disruption-tolerant file transfer over unreliable datagrams.
//! Pure logic, no I/O: the send and receive engines are driven by a
//! caller-supplied millisecond clock so the whole protocol state machine can
//! be exercised deterministically in tests.
//!
//! ## Crate structure
//!
//! - [`wire`] — fixed-width wire message codec
//! - [`pool`] — slab-based chunk buffer pool
//! - [`fec`] — block-XOR forward error correction
//! - [`rto`] — RFC 6298 retransmission timeout estimation
//! - [`send`] — send engine: chunking, windowing, retransmission
//! - [`receive`] — receive engine: reassembly, FEC recovery, SACK generation
//! - [`custody`] — store-and-forward custody tracking
//! - [`store`] — durable SQLite-backed record store
//! - [`io`] — UDP socket binding, reader thread, bounded inbound queue
//! - [`node`] — orchestrator tying the engines and I/O together
//! - [`stats`] — aggregate counters for `courier status`

pub mod custody;
pub mod fec;
pub mod io;
pub mod node;
pub mod pool;
pub mod receive;
pub mod rto;
pub mod send;
pub mod stats;
pub mod store;
pub mod wire;
