use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::transport::message_type::MessageType;
use crate::transport::transport_events::ConnectionEvent;

/// Tracks per-peer liveness with a sliding timeout.
///
/// A peer becomes tracked on its first Connect message and stays tracked as long as
///  *any* valid packet from it arrives often enough. Timeout checking works through a
///  FIFO queue of candidates that is re-armed on each check, so a single call only
///  inspects the front of the queue instead of scanning the whole table: expired
///  entries at the front are evicted, and the first live entry is rotated to the back.
pub struct ConnectionTracker {
    connections: FxHashMap<SocketAddr, Instant>,
    timeout_queue: VecDeque<SocketAddr>,
    timeout: Duration,
}

impl ConnectionTracker {
    pub fn new(timeout: Duration) -> ConnectionTracker {
        ConnectionTracker {
            connections: FxHashMap::default(),
            timeout_queue: VecDeque::new(),
            timeout,
        }
    }

    /// refreshes the liveness timestamp of a tracked peer; packets from untracked
    ///  peers carry no liveness meaning and are ignored here
    pub fn record(&mut self, peer: SocketAddr, now: Instant) {
        if let Some(last_seen) = self.connections.get_mut(&peer) {
            *last_seen = now;
        }
    }

    /// Feeds the leading tag byte of an inbound packet into liveness tracking.
    ///
    /// Disconnect evicts immediately (a no-op for untracked peers), Connect from an
    ///  unseen peer starts tracking it, anything else refreshes a tracked peer.
    pub fn packet_received(
        &mut self,
        peer: SocketAddr,
        first_byte: u8,
        now: Instant,
    ) -> Option<ConnectionEvent> {
        if first_byte == u8::from(MessageType::Disconnect) {
            if self.connections.remove(&peer).is_none() {
                return None;
            }
            debug!("peer {:?} disconnected", peer);
            return Some(ConnectionEvent::PeerDisconnected(peer));
        }

        if first_byte == u8::from(MessageType::Connect) && !self.connections.contains_key(&peer) {
            debug!("peer {:?} connected", peer);
            self.connections.insert(peer, now);
            self.timeout_queue.push_back(peer);
            return Some(ConnectionEvent::PeerConnected(peer));
        }

        self.record(peer, now);
        None
    }

    /// Monotonic timeout sweep: evicts expired peers from the front of the candidate
    ///  queue and returns them. Stops at the first live entry, rotating it to the back
    ///  so repeated calls cycle through the whole table over time.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<SocketAddr> {
        let mut evicted = Vec::new();
        while let Some(peer) = self.timeout_queue.pop_front() {
            let last_seen = match self.connections.get(&peer) {
                Some(last_seen) => *last_seen,
                None => continue, // evicted by an explicit Disconnect earlier
            };

            if last_seen + self.timeout < now {
                debug!("peer {:?} timed out", peer);
                self.connections.remove(&peer);
                evicted.push(peer);
                continue;
            }

            self.timeout_queue.push_back(peer);
            break;
        }
        evicted
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.connections.contains_key(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.connections.keys().copied()
    }
}
