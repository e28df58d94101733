//! # Datagram I/O
//!
//! Thin wrapper around `std::net::UdpSocket`. A dedicated reader thread
//! blocks on `recv_from` and pushes `(Bytes, SocketAddr)` onto a bounded
//! channel; the tick loop drains it with `recv_timeout` so it never busy
//! waits and never blocks past one tick. This channel is the only
//! synchronization primitive crossing the reader/tick thread boundary.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use courier_core::error::CourierError;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_DATAGRAM_BYTES: usize = 65507;
const INBOUND_QUEUE_CAPACITY: usize = 1024;

pub struct InboundDatagram {
    pub payload: Bytes,
    pub from: SocketAddr,
}

/// Shared counters exposed to the node orchestrator for `courier status`.
#[derive(Default)]
pub struct IoStats {
    pub datagrams_dropped: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub send_retries: AtomicU64,
}

pub struct DatagramIo {
    socket: UdpSocket,
    inbound_rx: Receiver<InboundDatagram>,
    stats: Arc<IoStats>,
    _reader: std::thread::JoinHandle<()>,
}

impl DatagramIo {
    /// Binds a socket and spawns the reader thread. The socket is cloned
    /// (via `try_clone`) so the reader thread owns its own handle and the
    /// caller keeps one for `send_to`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, CourierError> {
        let socket = UdpSocket::bind(addr).map_err(|e| CourierError::TransportFault(e.to_string()))?;
        let reader_socket = socket.try_clone().map_err(|e| CourierError::TransportFault(e.to_string()))?;
        let (tx, rx) = crossbeam_channel::bounded(INBOUND_QUEUE_CAPACITY);
        let stats = Arc::new(IoStats::default());
        let reader_stats = stats.clone();
        let reader = std::thread::Builder::new()
            .name("courier-reader".into())
            .spawn(move || reader_loop(reader_socket, tx, reader_stats))
            .map_err(|e| CourierError::TransportFault(e.to_string()))?;

        Ok(DatagramIo { socket, inbound_rx: rx, stats, _reader: reader })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CourierError> {
        self.socket.local_addr().map_err(|e| CourierError::TransportFault(e.to_string()))
    }

    /// Drains everything currently queued, never blocking.
    pub fn drain_inbound(&self) -> Vec<InboundDatagram> {
        self.inbound_rx.try_iter().collect()
    }

    /// Waits up to `timeout` for the first inbound datagram, then drains
    /// whatever else has queued up alongside it. Used by the tick loop so
    /// it neither busy-waits nor blocks past one tick interval.
    pub fn recv_inbound(&self, timeout: Duration) -> Vec<InboundDatagram> {
        let mut out = Vec::new();
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(first) => out.push(first),
            Err(RecvTimeoutError::Timeout) => return out,
            Err(RecvTimeoutError::Disconnected) => return out,
        }
        out.extend(self.inbound_rx.try_iter());
        out
    }

    /// Synchronous send with a single retry on a transient OS error
    /// (`EAGAIN`/`ENOBUFS`, surfaced by `std::io` as `WouldBlock` or
    /// `Other` depending on platform).
    pub fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<(), CourierError> {
        match self.socket.send_to(payload, dst) {
            Ok(_) => {
                self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                self.stats.send_retries.fetch_add(1, Ordering::Relaxed);
                self.socket
                    .send_to(payload, dst)
                    .map(|_| {
                        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    })
                    .map_err(|e| CourierError::TransportFault(e.to_string()))
            }
            Err(e) => Err(CourierError::TransportFault(e.to_string())),
        }
    }

    pub fn stats(&self) -> Arc<IoStats> {
        self.stats.clone()
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) || e.raw_os_error() == Some(105) // ENOBUFS
}

fn reader_loop(socket: UdpSocket, tx: Sender<InboundDatagram>, stats: Arc<IoStats>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let payload = Bytes::copy_from_slice(&buf[..len]);
                stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                match tx.try_send(InboundDatagram { payload, from }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}
