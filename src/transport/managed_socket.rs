use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use crate::transport::connection_tracker::ConnectionTracker;
use crate::transport::message_type::MessageType;
use crate::transport::ping_tracker::PingTracker;
use crate::transport::reliable_channel::ReliableChannel;
use crate::transport::socket::Socket;
use crate::transport::transport_config::TransportConfig;
use crate::transport::transport_events::{ConnectionEvent, ConnectionEventNotifier, ConnectionListener};
use crate::transport::unreliable_channel::UnreliableChannel;

/// channels need room for their own headers on top of the substrate's
const MIN_MTU: usize = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    Reliable,
    Unreliable,
}

/// One completed inbound message, borrowed from the channel that assembled it. The
///  payload is valid until the next [`ManagedSocket::poll`] call.
#[derive(Debug)]
pub struct Received<'a> {
    pub from: SocketAddr,
    pub kind: ChannelKind,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocalState {
    Stopped,
    Starting,
    Started,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeProgress {
    InProgress,
    Established,
    Failed,
}

enum HandshakeState {
    Idle,
    InProgress {
        peer: SocketAddr,
        attempts_left: u32,
        next_attempt: Instant,
    },
    Established,
    Failed,
}

/// The protocol engine: one instance per participant, orchestrating liveness tracking,
///  RTT probing, the connect handshake and the per-peer channel pairs over a shared
///  datagram substrate.
///
/// Everything runs on the caller's thread. [`poll`](Self::poll) is the single step
///  function - it advances every timer from the passed timestamp, drains the
///  substrate, and surfaces at most one completed message per call, so callers drain
///  it in a loop until `None`.
pub struct ManagedSocket {
    socket: Rc<dyn Socket>,
    config: TransportConfig,
    connections: ConnectionTracker,
    pings: PingTracker,
    reliable_channels: FxHashMap<SocketAddr, ReliableChannel>,
    unreliable_channels: FxHashMap<SocketAddr, UnreliableChannel>,
    notifier: ConnectionEventNotifier,
    start_time: Instant,
    is_host: bool,
    state: LocalState,
    handshake: HandshakeState,
    recv_buf: Vec<u8>,
    closed: bool,
}

impl ManagedSocket {
    pub fn new(
        socket: Rc<dyn Socket>,
        config: TransportConfig,
        now: Instant,
    ) -> anyhow::Result<ManagedSocket> {
        let mtu = socket.mtu();
        if mtu < MIN_MTU {
            bail!("substrate mtu of {} is below the supported minimum of {}", mtu, MIN_MTU);
        }

        Ok(ManagedSocket {
            pings: PingTracker::new(socket.clone(), config.ping_interval, config.max_tracked_pings),
            connections: ConnectionTracker::new(config.connection_timeout),
            socket,
            config,
            reliable_channels: FxHashMap::default(),
            unreliable_channels: FxHashMap::default(),
            notifier: ConnectionEventNotifier::new(),
            start_time: now,
            is_host: false,
            state: LocalState::Stopped,
            handshake: HandshakeState::Idle,
            recv_buf: vec![0; mtu],
            closed: false,
        })
    }

    /// Switches into host mode: incoming Connect requests are acknowledged and start
    ///  tracking the sender. A host never initiates a handshake itself.
    pub fn host(&mut self) {
        info!("accepting connections");
        self.is_host = true;
        self.state = LocalState::Started;
    }

    /// Starts the connect handshake towards `peer`. Progress is driven by `poll` and
    ///  observable through [`handshake_progress`](Self::handshake_progress).
    pub fn start_connect(&mut self, peer: SocketAddr, now: Instant) {
        info!("connecting to {:?}", peer);
        self.state = LocalState::Starting;
        self.handshake = HandshakeState::InProgress {
            peer,
            attempts_left: self.config.handshake_attempts,
            next_attempt: now,
        };
    }

    pub fn handshake_progress(&self) -> Option<HandshakeProgress> {
        match self.handshake {
            HandshakeState::Idle => None,
            HandshakeState::InProgress { .. } => Some(HandshakeProgress::InProgress),
            HandshakeState::Established => Some(HandshakeProgress::Established),
            HandshakeState::Failed => Some(HandshakeProgress::Failed),
        }
    }

    pub fn state(&self) -> LocalState {
        self.state
    }

    pub fn add_listener(&mut self, listener: Rc<dyn ConnectionListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.connections.is_connected(peer)
    }

    /// average round-trip time to `peer`, `None` until the first probe is answered
    pub fn rtt(&self, peer: SocketAddr) -> Option<Duration> {
        self.pings.rtt(peer)
    }

    /// Hands `data` to the ordered, retransmitted channel towards `to`, creating the
    ///  channel pair on first use. Fails if the message exceeds the channel's send
    ///  window.
    pub fn send_reliable(&mut self, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.ensure_channels(to)?;
        if let Some(channel) = self.reliable_channels.get_mut(&to) {
            channel.send(data)?;
        }
        Ok(())
    }

    /// Emits `data` towards `to` with best-effort semantics, fragmenting if it exceeds
    ///  a single packet. Fails if the message needs more slices than the wire format
    ///  can express.
    pub fn send_unreliable(&mut self, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.ensure_channels(to)?;
        if let Some(channel) = self.unreliable_channels.get_mut(&to) {
            channel.send(data)?;
        }
        Ok(())
    }

    /// Notifies `peer` and drops all local state for it. Idempotent: disconnecting an
    ///  untracked peer only sends the (harmless) notification.
    pub fn disconnect(&mut self, peer: SocketAddr, now: Instant) {
        self.socket.send(peer, &[MessageType::Disconnect.into()]);
        if let Some(event) = self.connections.packet_received(peer, MessageType::Disconnect.into(), now) {
            self.apply_connection_event(event);
        }
    }

    /// Single step function, to be called at a bounded interval (tens of milliseconds):
    ///  advances all timers to `now`, drains the substrate and returns the first
    ///  completed message, or `None` once there is nothing more to surface this tick.
    pub fn poll(&mut self, now: Instant) -> Option<Received<'_>> {
        for peer in self.connections.check_timeouts(now) {
            self.teardown_peer(peer);
        }
        self.advance_handshake(now);
        self.pings.check_pending(now);

        let now_ms = self.elapsed_ms(now);
        for channel in self.reliable_channels.values_mut() {
            channel.update(now_ms);
        }

        let completed = loop {
            let (from, len) = match self.socket.recv(now, &mut self.recv_buf) {
                Some(received) => received,
                None => break None,
            };
            if len == 0 {
                continue;
            }

            let first_byte = self.recv_buf[0];
            if let Some(event) = self.connections.packet_received(from, first_byte, now) {
                self.apply_connection_event(event);
            }

            match MessageType::try_from(first_byte) {
                Ok(MessageType::Reliable) => {
                    if let Some(channel) = self.reliable_channels.get_mut(&from) {
                        if let Some(len) = channel.try_receive(&self.recv_buf[..len]) {
                            break Some((from, ChannelKind::Reliable, len));
                        }
                    }
                }
                Ok(MessageType::Unreliable) => {
                    if let Some(channel) = self.unreliable_channels.get_mut(&from) {
                        if let Some(len) = channel.try_receive(&self.recv_buf[..len]) {
                            break Some((from, ChannelKind::Unreliable, len));
                        }
                    }
                }
                Ok(MessageType::Ping) => self.pings.ping_received(from, &self.recv_buf[..len]),
                Ok(MessageType::Pong) => self.pings.pong_received(from, &self.recv_buf[..len], now),
                Ok(MessageType::Connect) => {
                    if self.is_host {
                        self.socket.send(from, &[MessageType::Connect.into()]);
                    }
                }
                Ok(MessageType::Disconnect) | Ok(MessageType::None) => {}
                Err(_) => trace!("dropping packet with unknown type {} from {:?}", first_byte, from),
            }
        };

        let (from, kind, len) = completed?;
        let data = match kind {
            ChannelKind::Reliable => self.reliable_channels.get(&from)?.assembled(len),
            ChannelKind::Unreliable => self.unreliable_channels.get(&from)?.assembled(len),
        };
        Some(Received { from, kind, data })
    }

    /// Notifies every still-tracked peer that we are going away. Further use of the
    ///  engine after closing is not meaningful.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = LocalState::Stopped;
        for peer in self.connections.peers() {
            debug!("notifying {:?} of shutdown", peer);
            self.socket.send(peer, &[MessageType::Disconnect.into()]);
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.start_time).as_millis() as u32
    }

    fn ensure_channels(&mut self, peer: SocketAddr) -> anyhow::Result<()> {
        if !self.reliable_channels.contains_key(&peer) {
            let channel = ReliableChannel::new(self.socket.clone(), peer)?;
            self.reliable_channels.insert(peer, channel);
        }
        if !self.unreliable_channels.contains_key(&peer) {
            self.unreliable_channels
                .insert(peer, UnreliableChannel::new(self.socket.clone(), peer));
        }
        Ok(())
    }

    fn teardown_peer(&mut self, peer: SocketAddr) {
        self.reliable_channels.remove(&peer);
        self.unreliable_channels.remove(&peer);
        self.pings.on_peer_disconnected(peer);
        self.notifier.send_event(ConnectionEvent::PeerDisconnected(peer));
    }

    fn apply_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::PeerConnected(peer) => {
                if let Err(e) = self.ensure_channels(peer) {
                    error!("could not set up channels for {:?}: {}", peer, e);
                }
                self.pings.on_peer_connected(peer);
                self.notifier.send_event(event);
            }
            ConnectionEvent::PeerDisconnected(peer) => {
                self.teardown_peer(peer);
            }
        }
    }

    fn advance_handshake(&mut self, now: Instant) {
        let HandshakeState::InProgress { peer, attempts_left, next_attempt } = self.handshake else {
            return;
        };

        if self.connections.is_connected(peer) {
            info!("connection to {:?} established", peer);
            self.handshake = HandshakeState::Established;
            self.state = LocalState::Started;
            return;
        }
        if now < next_attempt {
            return;
        }

        if attempts_left == 0 {
            warn!("giving up on connecting to {:?}", peer);
            self.handshake = HandshakeState::Failed;
            self.state = LocalState::Stopped;
            return;
        }

        debug!("sending connect request to {:?}, {} attempts left", peer, attempts_left);
        self.socket.send(peer, &[MessageType::Connect.into()]);
        self.handshake = HandshakeState::InProgress {
            peer,
            attempts_left: attempts_left - 1,
            next_attempt: now + self.config.handshake_retry_interval,
        };
    }
}

impl Drop for ManagedSocket {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use rand::RngCore;
    use rstest::rstest;

    use crate::test_util::hub::NetworkHub;
    use crate::transport::socket::MockSocket;

    use super::*;

    struct RecordingListener(RefCell<Vec<ConnectionEvent>>);
    impl ConnectionListener for RecordingListener {
        fn on_event(&self, event: ConnectionEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    struct Harness {
        host: ManagedSocket,
        client: ManagedSocket,
        host_addr: SocketAddr,
        client_addr: SocketAddr,
        host_events: Rc<RecordingListener>,
        client_events: Rc<RecordingListener>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Harness {
            let hub = NetworkHub::new(1200);
            let host_socket = hub.socket("10.0.0.1:7777");
            let client_socket = hub.socket("10.0.0.2:7001");
            let host_addr = host_socket.addr();
            let client_addr = client_socket.addr();
            let now = Instant::now();

            let mut host = ManagedSocket::new(host_socket, TransportConfig::default(), now).unwrap();
            host.host();
            let mut client = ManagedSocket::new(client_socket, TransportConfig::default(), now).unwrap();

            let host_events = Rc::new(RecordingListener(RefCell::new(Vec::new())));
            let client_events = Rc::new(RecordingListener(RefCell::new(Vec::new())));
            host.add_listener(host_events.clone());
            client.add_listener(client_events.clone());

            Harness { host, client, host_addr, client_addr, host_events, client_events, now }
        }

        fn connect(&mut self) {
            let now = self.now;
            self.client.start_connect(self.host_addr, now);
            self.run(200);
            assert_eq!(self.client.handshake_progress(), Some(HandshakeProgress::Established));
        }

        /// advances both engines in 20ms ticks, collecting every completed message as
        ///  (receiving side's address, kind, payload)
        fn run(&mut self, millis: u64) -> Vec<(SocketAddr, ChannelKind, Vec<u8>)> {
            let mut delivered = Vec::new();
            for _ in 0..millis / 20 {
                self.now += Duration::from_millis(20);
                while let Some(received) = self.client.poll(self.now) {
                    delivered.push((self.client_addr, received.kind, received.data.to_vec()));
                }
                while let Some(received) = self.host.poll(self.now) {
                    delivered.push((self.host_addr, received.kind, received.data.to_vec()));
                }
            }
            delivered
        }

        /// only the host side keeps running, the client has gone silent
        fn run_host_only(&mut self, millis: u64) {
            for _ in 0..millis / 20 {
                self.now += Duration::from_millis(20);
                while self.host.poll(self.now).is_some() {}
            }
        }
    }

    fn random_message(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[rstest]
    fn test_undersized_substrate_is_rejected() {
        let mut socket = MockSocket::new();
        socket.expect_mtu().return_const(MIN_MTU - 1);

        let result = ManagedSocket::new(Rc::new(socket), TransportConfig::default(), Instant::now());
        assert!(result.is_err());
    }

    #[rstest]
    fn test_handshake_establishes_connection_on_both_sides() {
        let mut harness = Harness::new();
        harness.connect();

        assert!(harness.host.is_connected(harness.client_addr));
        assert!(harness.client.is_connected(harness.host_addr));
        assert_eq!(harness.client.state(), LocalState::Started);
        assert_eq!(
            harness.host_events.0.borrow().as_slice(),
            &[ConnectionEvent::PeerConnected(harness.client_addr)]
        );
        assert_eq!(
            harness.client_events.0.borrow().as_slice(),
            &[ConnectionEvent::PeerConnected(harness.host_addr)]
        );
    }

    #[rstest]
    fn test_handshake_gives_up_after_configured_attempts() {
        let mut harness = Harness::new();
        let unreachable = SocketAddr::from(([10, 9, 9, 9], 1));
        let now = harness.now;
        harness.client.start_connect(unreachable, now);

        harness.run(2900);
        assert_eq!(harness.client.handshake_progress(), Some(HandshakeProgress::InProgress));

        harness.run(1200);
        assert_eq!(harness.client.handshake_progress(), Some(HandshakeProgress::Failed));
        assert_eq!(harness.client.state(), LocalState::Stopped);
    }

    #[rstest]
    fn test_messages_flow_on_both_channels() {
        let mut harness = Harness::new();
        harness.connect();

        let ordered = random_message(5000);
        let best_effort = random_message(3000);
        let host_addr = harness.host_addr;
        harness.client.send_reliable(host_addr, &ordered).unwrap();
        harness.client.send_unreliable(host_addr, &best_effort).unwrap();

        let delivered = harness.run(2000);
        assert!(delivered.contains(&(harness.host_addr, ChannelKind::Reliable, ordered)));
        assert!(delivered.contains(&(harness.host_addr, ChannelKind::Unreliable, best_effort)));
    }

    #[rstest]
    fn test_reply_reaches_the_client() {
        let mut harness = Harness::new();
        harness.connect();

        let client_addr = harness.client_addr;
        harness.host.send_reliable(client_addr, b"welcome").unwrap();

        let delivered = harness.run(1000);
        assert!(delivered.contains(&(harness.client_addr, ChannelKind::Reliable, b"welcome".to_vec())));
    }

    #[rstest]
    fn test_silent_peer_is_evicted_after_timeout() {
        let mut harness = Harness::new();
        harness.connect();

        harness.run_host_only(11_000);

        assert!(!harness.host.is_connected(harness.client_addr));
        assert_eq!(
            harness.host_events.0.borrow().last(),
            Some(&ConnectionEvent::PeerDisconnected(harness.client_addr))
        );
    }

    #[rstest]
    fn test_disconnect_notifies_both_sides() {
        let mut harness = Harness::new();
        harness.connect();

        let host_addr = harness.host_addr;
        let now = harness.now;
        harness.client.disconnect(host_addr, now);
        assert!(!harness.client.is_connected(host_addr));

        harness.run(100);
        assert!(!harness.host.is_connected(harness.client_addr));
        assert_eq!(
            harness.host_events.0.borrow().last(),
            Some(&ConnectionEvent::PeerDisconnected(harness.client_addr))
        );
        assert_eq!(
            harness.client_events.0.borrow().last(),
            Some(&ConnectionEvent::PeerDisconnected(harness.host_addr))
        );

        // disconnecting again does not fire a second notification
        let event_count = harness.client_events.0.borrow().len();
        let now = harness.now;
        harness.client.disconnect(host_addr, now);
        assert_eq!(harness.client_events.0.borrow().len(), event_count);
    }

    #[rstest]
    fn test_rtt_is_measured_once_connected() {
        let mut harness = Harness::new();
        assert_eq!(harness.client.rtt(harness.host_addr), None);

        harness.connect();
        harness.run(500);
        assert!(harness.client.rtt(harness.host_addr).is_some());
        assert!(harness.host.rtt(harness.client_addr).is_some());
    }
}
