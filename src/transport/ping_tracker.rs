use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::transport::message_type::MessageType;
use crate::transport::socket::Socket;

const PING_MESSAGE_SIZE: usize = 2;

struct PingSample {
    sequence: u8,
    sent_at: Instant,
}

/// Measures per-peer round-trip latency with sequence-tagged 2-byte probes
///  (`[Ping, seq]` answered by `[Pong, seq]`).
///
/// Only tracked peers are probed; at most one probe per peer per interval is in
///  flight, and both outstanding probes and retained RTT samples are bounded queues
///  so a peer that stops answering cannot grow state without limit.
pub struct PingTracker {
    socket: Rc<dyn Socket>,
    outstanding: FxHashMap<SocketAddr, VecDeque<PingSample>>,
    rtt_samples: FxHashMap<SocketAddr, VecDeque<Duration>>,
    interval: Duration,
    max_tracked: usize,
}

impl PingTracker {
    pub fn new(socket: Rc<dyn Socket>, interval: Duration, max_tracked: usize) -> PingTracker {
        PingTracker {
            socket,
            outstanding: FxHashMap::default(),
            rtt_samples: FxHashMap::default(),
            interval,
            max_tracked,
        }
    }

    pub fn on_peer_connected(&mut self, peer: SocketAddr) {
        self.outstanding.entry(peer).or_default();
        self.rtt_samples.entry(peer).or_default();
    }

    pub fn on_peer_disconnected(&mut self, peer: SocketAddr) {
        self.outstanding.remove(&peer);
        self.rtt_samples.remove(&peer);
    }

    /// sends the next probe to every tracked peer whose probe interval has elapsed
    pub fn check_pending(&mut self, now: Instant) {
        for (peer, pending) in &mut self.outstanding {
            if let Some(last) = pending.back() {
                if last.sent_at + self.interval > now {
                    continue;
                }
            }
            if pending.len() > self.max_tracked {
                pending.pop_front();
            }

            let sequence = pending.back().map(|s| s.sequence.wrapping_add(1)).unwrap_or(0);
            pending.push_back(PingSample { sequence, sent_at: now });
            self.socket.send(*peer, &[MessageType::Ping.into(), sequence]);
        }
    }

    /// echoes a probe back with the tag flipped to Pong; malformed probes are dropped
    pub fn ping_received(&self, peer: SocketAddr, packet: &[u8]) {
        if packet.len() != PING_MESSAGE_SIZE {
            return;
        }
        self.socket.send(peer, &[MessageType::Pong.into(), packet[1]]);
    }

    /// matches a pong against the outstanding probes and records the round trip
    pub fn pong_received(&mut self, peer: SocketAddr, packet: &[u8], now: Instant) {
        if packet.len() != PING_MESSAGE_SIZE {
            return;
        }
        let Some(pending) = self.outstanding.get(&peer) else {
            return;
        };
        let Some(sample) = pending.iter().find(|s| s.sequence == packet[1]) else {
            return;
        };
        let rtt = now.duration_since(sample.sent_at);
        trace!("rtt probe answered by {:?}: {:?}", peer, rtt);

        let Some(samples) = self.rtt_samples.get_mut(&peer) else {
            return;
        };
        if samples.len() > self.max_tracked {
            samples.pop_front();
        }
        samples.push_back(rtt);
    }

    /// average over the retained samples, `None` until the first pong arrives
    pub fn rtt(&self, peer: SocketAddr) -> Option<Duration> {
        let samples = self.rtt_samples.get(&peer)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }
}
