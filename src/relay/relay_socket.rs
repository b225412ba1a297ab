use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::relay::packet_encryption::{PassthroughEncryption, RelayEncryption};
use crate::relay::relay_config::RelayConfig;
use crate::transport::socket::Socket;

/// connection id of the relay server itself: announcements go there, and an envelope
///  addressed to it that arrives back carries our assigned id in the sender slot
pub const RELAY_CONTROL_ID: u8 = 0;
/// the room's host always has connection id 1
pub const HOST_CONNECTION_ID: u8 = 1;

/// `[room_id: i32 le][from: u8][to: u8]`
const ENVELOPE_SIZE: usize = 6;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayHandshake {
    deadline: Instant,
    next_send: Instant,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayConnectProgress {
    Pending,
    Connected(u8),
    TimedOut,
}

struct RelayState {
    connection_id: u8,
    to_connection: FxHashMap<SocketAddr, u8>,
    to_endpoint: FxHashMap<u8, SocketAddr>,
    /// `None` until the first packet goes out, then drives the keep-alive timer
    last_send: Option<Instant>,
    /// the engine's tick timestamp, refreshed on every `recv`
    clock: Instant,
    send_buf: BytesMut,
    raw_buf: Vec<u8>,
}

/// Tunnels the transport's packets through a relay server.
///
/// Peers behind the relay have no reachable address, so each one is identified by a
///  relay-assigned connection id and represented towards the layers above by a
///  synthetic `1.1.1.<id>:10000` address. The relay never initiates anything: this
///  side announces itself into a room (see [`start_connect`](Self::start_connect)),
///  and keeps announcing once a second as long as traffic is otherwise idle so the
///  relay's NAT mapping stays warm.
pub struct RelaySocket {
    inner: Rc<dyn Socket>,
    config: RelayConfig,
    encryption: Box<dyn RelayEncryption>,
    state: RefCell<RelayState>,
}

impl RelaySocket {
    pub fn new(inner: Rc<dyn Socket>, config: RelayConfig, now: Instant) -> RelaySocket {
        let encryption = Box::new(PassthroughEncryption::new(&config.room_secret));
        let raw_buf = vec![0; inner.mtu()];

        RelaySocket {
            inner,
            config,
            encryption,
            state: RefCell::new(RelayState {
                connection_id: RELAY_CONTROL_ID,
                to_connection: FxHashMap::default(),
                to_endpoint: FxHashMap::default(),
                last_send: None,
                clock: now,
                send_buf: BytesMut::new(),
                raw_buf,
            }),
        }
    }

    /// the relay-assigned connection id, [`RELAY_CONTROL_ID`] until connected
    pub fn connection_id(&self) -> u8 {
        self.state.borrow().connection_id
    }

    /// Registers `addr` as the address under which the layers above know the room's
    ///  host, so packets they send there are tunneled to connection id 1.
    pub fn assign_host(&self, addr: SocketAddr) {
        let mut state = self.state.borrow_mut();
        state.to_endpoint.insert(HOST_CONNECTION_ID, addr);
        state.to_connection.insert(addr, HOST_CONNECTION_ID);
    }

    /// Begins announcing into the configured room. Drive the handshake by calling
    ///  [`poll_connect`](Self::poll_connect) until it leaves `Pending`.
    pub fn start_connect(&self, now: Instant) -> RelayHandshake {
        debug!("connecting to relay {:?} for room {}", self.config.relay_addr, self.config.room_id);
        RelayHandshake {
            deadline: now + CONNECT_TIMEOUT,
            next_send: now,
        }
    }

    /// One handshake step: re-announces on a fixed cadence and scans inbound traffic
    ///  for the relay's control reply carrying our assigned connection id.
    pub fn poll_connect(&self, handshake: &mut RelayHandshake, now: Instant) -> RelayConnectProgress {
        self.state.borrow_mut().clock = now;
        if now >= handshake.deadline {
            warn!("relay {:?} did not assign a connection id within {:?}", self.config.relay_addr, CONNECT_TIMEOUT);
            return RelayConnectProgress::TimedOut;
        }
        if now >= handshake.next_send {
            self.send_announcement();
            handshake.next_send = now + ANNOUNCE_INTERVAL;
        }

        loop {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            let Some((from_addr, len)) = self.inner.recv(now, &mut state.raw_buf) else {
                return RelayConnectProgress::Pending;
            };
            if from_addr != self.config.relay_addr || len < ENVELOPE_SIZE {
                continue;
            }

            let mut header = &state.raw_buf[..len];
            let room_id = header.get_i32_le();
            let assigned = header.get_u8();
            let to = header.get_u8();
            if room_id != self.config.room_id || assigned == RELAY_CONTROL_ID || to != RELAY_CONTROL_ID {
                continue;
            }

            info!("relay assigned connection id {}", assigned);
            state.connection_id = assigned;
            return RelayConnectProgress::Connected(assigned);
        }
    }

    /// room announcement: both credentials, each length-prefixed
    fn send_announcement(&self) {
        let mut payload = BytesMut::new();
        payload.put_u32_le(self.config.room_secret.len() as u32);
        payload.put_slice(&self.config.room_secret);
        payload.put_u32_le(self.config.connection_secret.len() as u32);
        payload.put_slice(&self.config.connection_secret);
        self.send_internal(RELAY_CONTROL_ID, &payload);
    }

    fn send_internal(&self, to: u8, payload: &[u8]) {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        state.last_send = Some(state.clock);

        state.send_buf.clear();
        state.send_buf.put_i32_le(self.config.room_id);
        state.send_buf.put_u8(state.connection_id);
        state.send_buf.put_u8(to);

        let payload_start = state.send_buf.len();
        state.send_buf.resize(payload_start + payload.len() + self.encryption.overhead(), 0);
        let written = self.encryption.encrypt(payload, &mut state.send_buf[payload_start..]);
        state.send_buf.truncate(payload_start + written);

        self.inner.send(self.config.relay_addr, &state.send_buf);
    }
}

impl Socket for RelaySocket {
    fn send(&self, to: SocketAddr, data: &[u8]) {
        let connection_id = match self.state.borrow().to_connection.get(&to) {
            Some(id) => *id,
            None => {
                debug!("dropping packet to {:?}: no relay mapping", to);
                return;
            }
        };
        self.send_internal(connection_id, data);
    }

    fn recv(&self, now: Instant, buf: &mut [u8]) -> Option<(SocketAddr, usize)> {
        let keep_alive_due = {
            let mut state = self.state.borrow_mut();
            state.clock = now;
            matches!(state.last_send, Some(last) if last + KEEP_ALIVE_INTERVAL < now)
        };
        if keep_alive_due {
            trace!("announcing to keep the relay session alive");
            self.send_announcement();
        }

        loop {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            let (from_addr, len) = self.inner.recv(now, &mut state.raw_buf)?;
            if from_addr != self.config.relay_addr || len < ENVELOPE_SIZE {
                continue;
            }

            let mut header = &state.raw_buf[..len];
            let room_id = header.get_i32_le();
            let from = header.get_u8();
            let to = header.get_u8();
            if room_id != self.config.room_id {
                debug!("dropping relay packet for foreign room {}", room_id);
                continue;
            }
            if to != state.connection_id {
                continue;
            }

            let ciphertext = &state.raw_buf[ENVELOPE_SIZE..len];
            if ciphertext.len() > buf.len() {
                debug!("dropping relay packet: {} byte payload exceeds receive buffer", ciphertext.len());
                continue;
            }
            let written = self.encryption.decrypt(ciphertext, buf);
            let peer = endpoint_mapping(state, from);
            return Some((peer, written));
        }
    }

    fn mtu(&self) -> usize {
        self.inner.mtu() - ENVELOPE_SIZE - self.encryption.overhead()
    }
}

/// resolves a connection id to its synthetic peer address, creating the bidirectional
///  mapping on first contact
fn endpoint_mapping(state: &mut RelayState, connection_id: u8) -> SocketAddr {
    if let Some(addr) = state.to_endpoint.get(&connection_id) {
        return *addr;
    }
    let addr = SocketAddr::from(([1, 1, 1, connection_id], 10_000));
    trace!("mapping relay connection {} to {:?}", connection_id, addr);
    state.to_endpoint.insert(connection_id, addr);
    state.to_connection.insert(addr, connection_id);
    addr
}
