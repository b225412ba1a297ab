use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::rc::Rc;

use kcp::Kcp;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::message_type::MessageType;
use crate::transport::socket::Socket;

/// both sides of a connection use the same fixed conversation id
const KCP_CONV: u32 = 0;

/// low-latency tuning: nodelay, 20ms internal timer, fast resend after 2 duplicate
///  acks, congestion window limited to flow control only
const KCP_INTERVAL_MS: i32 = 20;
const KCP_FAST_RESEND: i32 = 2;

#[derive(Debug, Error)]
#[error("reliable channel rejected send of {message_len} bytes: {source}")]
pub struct ReliableSendError {
    pub message_len: usize,
    source: kcp::Error,
}

/// Adapter between the ARQ engine's frame output and the datagram substrate: every
///  frame the engine emits is prefixed with the Reliable tag byte and handed down as
///  one physical packet.
struct TaggedOutput {
    socket: Rc<dyn Socket>,
    peer: SocketAddr,
    frame: Vec<u8>,
}

impl Write for TaggedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.frame.clear();
        self.frame.push(MessageType::Reliable.into());
        self.frame.extend_from_slice(buf);
        self.socket.send(self.peer, &self.frame);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Ordered, retransmitted, flow-controlled delivery to a single peer, built on the
///  `kcp` ARQ engine.
///
/// The engine is wrapped behind this owned handle; all buffer hand-offs across the
///  boundary are borrowed slices with explicit lengths. The channel never blocks:
///  [`update`](Self::update) must be invoked at a bounded interval (tens of
///  milliseconds) to drive retransmission timers and flush pending segments.
pub struct ReliableChannel {
    kcp: Kcp<TaggedOutput>,
    recv_buf: Vec<u8>,
}

impl ReliableChannel {
    /// The maximum segment size is the substrate MTU minus one byte for the channel
    ///  type tag.
    pub fn new(socket: Rc<dyn Socket>, peer: SocketAddr) -> anyhow::Result<ReliableChannel> {
        let mtu = socket.mtu() - 1;
        let output = TaggedOutput {
            socket,
            peer,
            frame: Vec::with_capacity(mtu + 1),
        };

        let mut kcp = Kcp::new(KCP_CONV, output);
        kcp.set_mtu(mtu)?;
        kcp.set_nodelay(true, KCP_INTERVAL_MS, KCP_FAST_RESEND, true);

        Ok(ReliableChannel {
            kcp,
            recv_buf: Vec::new(),
        })
    }

    /// Enqueues `data` into the ARQ send window. Segments go out on subsequent
    ///  `update` calls, not synchronously.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ReliableSendError> {
        match self.kcp.send(data) {
            Ok(_) => Ok(()),
            Err(e) => Err(ReliableSendError {
                message_len: data.len(),
                source: e,
            }),
        }
    }

    /// pure time-driven step: retransmission timers, ack flushing, window probing
    pub fn update(&mut self, now_ms: u32) {
        if let Err(e) = self.kcp.update(now_ms) {
            warn!("reliable channel timer step failed: {}", e);
        }
    }

    /// Feeds a raw inbound segment (leading tag byte still attached) into the ARQ
    ///  input stage, then attempts to pull one completed, reordered message. Returns
    ///  its length (retrieve via [`assembled`](Self::assembled)), or `None` while no
    ///  message is complete.
    pub fn try_receive(&mut self, packet: &[u8]) -> Option<usize> {
        if packet.len() < 2 {
            return None;
        }
        if let Err(e) = self.kcp.input(&packet[1..]) {
            debug!("dropping undecodable reliable segment: {}", e);
            return None;
        }

        let size = match self.kcp.peeksize() {
            Ok(size) => size,
            Err(_) => return None, // nothing complete yet
        };
        if self.recv_buf.len() < size {
            self.recv_buf.resize(size, 0);
        }

        match self.kcp.recv(&mut self.recv_buf) {
            Ok(len) => Some(len),
            Err(kcp::Error::RecvQueueEmpty) | Err(kcp::Error::ExpectingFragment) => None,
            Err(e) => {
                debug!("reliable channel receive failed: {}", e);
                None
            }
        }
    }

    /// the most recently completed message; valid only until the next `try_receive`
    pub fn assembled(&self, len: usize) -> &[u8] {
        &self.recv_buf[..len]
    }
}


#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use rand::RngCore;
    use rstest::rstest;

    use crate::test_util::hub::RecordingSocket;

    use super::*;

    const MTU: usize = 1200;

    fn endpoint(n: u16) -> SocketAddr {
        SocketAddr::from_str(&format!("10.2.0.1:{}", 5000 + n)).unwrap()
    }

    struct Loopback {
        a_socket: Rc<RecordingSocket>,
        b_socket: Rc<RecordingSocket>,
        a: ReliableChannel,
        b: ReliableChannel,
    }

    impl Loopback {
        fn new() -> Loopback {
            let a_socket = Rc::new(RecordingSocket::new(MTU));
            let b_socket = Rc::new(RecordingSocket::new(MTU));
            let a = ReliableChannel::new(a_socket.clone(), endpoint(2)).unwrap();
            let b = ReliableChannel::new(b_socket.clone(), endpoint(1)).unwrap();
            Loopback { a_socket, b_socket, a, b }
        }

        /// Advances simulated time in 10ms ticks, shuttling frames both ways.
        ///  `drop_frame` decides per a->b frame (by running index) whether the
        ///  network eats it. Returns every message b completed.
        fn pump(&mut self, millis: u32, mut drop_frame: impl FnMut(usize) -> bool) -> Vec<Vec<u8>> {
            let mut delivered = Vec::new();
            let mut frame_count = 0;

            for now_ms in (0..millis).step_by(10) {
                self.a.update(now_ms);
                self.b.update(now_ms);

                for (_, frame) in self.a_socket.sent.borrow_mut().drain(..) {
                    let dropped = drop_frame(frame_count);
                    frame_count += 1;
                    if dropped {
                        continue;
                    }
                    if let Some(len) = self.b.try_receive(&frame) {
                        delivered.push(self.b.assembled(len).to_vec());
                    }
                }
                for (_, frame) in self.b_socket.sent.borrow_mut().drain(..) {
                    if let Some(len) = self.a.try_receive(&frame) {
                        delivered.push(self.a.assembled(len).to_vec());
                    }
                }
            }
            delivered
        }
    }

    fn random_message(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[rstest]
    fn test_round_trip_preserves_order_and_boundaries() {
        let mut loopback = Loopback::new();
        let first = random_message(5000);
        let second = random_message(100);

        loopback.a.send(&first).unwrap();
        loopback.a.send(&second).unwrap();

        let delivered = loopback.pump(2000, |_| false);
        assert_eq!(delivered, vec![first, second]);
    }

    #[rstest]
    fn test_retransmission_recovers_dropped_frames() {
        let mut loopback = Loopback::new();
        let message = random_message(8000);
        loopback.a.send(&message).unwrap();

        // the first transmission of every second frame is lost
        let delivered = loopback.pump(10_000, |i| i < 12 && i % 2 == 0);
        assert_eq!(delivered, vec![message]);
    }

    #[rstest]
    fn test_delivery_is_exactly_once() {
        let mut loopback = Loopback::new();
        let message = random_message(3000);
        loopback.a.send(&message).unwrap();

        // generous budget: retransmissions must not surface duplicates
        let delivered = loopback.pump(5000, |_| false);
        assert_eq!(delivered.len(), 1);
    }

    #[rstest]
    fn test_send_queue_exhaustion_is_reported() {
        let mut loopback = Loopback::new();

        // more fragments than the ARQ receive window allows in a single message
        let oversized = random_message(250 * (MTU - 1));
        let result = loopback.a.send(&oversized);
        assert!(result.is_err());

        // the channel stays usable afterwards
        let message = random_message(500);
        loopback.a.send(&message).unwrap();
        assert_eq!(loopback.pump(2000, |_| false), vec![message]);
    }

    #[rstest]
    fn test_garbage_segment_is_dropped() {
        let mut loopback = Loopback::new();
        assert_eq!(loopback.b.try_receive(&[2, 1, 2, 3]), None);
        assert_eq!(loopback.b.try_receive(&[2]), None);

        // and does not poison subsequent traffic
        let message = random_message(200);
        loopback.a.send(&message).unwrap();
        assert_eq!(loopback.pump(2000, |_| false), vec![message]);
    }
}
