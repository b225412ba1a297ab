use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::transport::socket::Socket;

/// Socket stub that records every outbound packet and replays scripted inbound ones.
pub struct RecordingSocket {
    mtu: usize,
    pub sent: RefCell<Vec<(SocketAddr, Vec<u8>)>>,
    pub inbound: RefCell<VecDeque<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSocket {
    pub fn new(mtu: usize) -> RecordingSocket {
        RecordingSocket {
            mtu,
            sent: RefCell::new(Vec::new()),
            inbound: RefCell::new(VecDeque::new()),
        }
    }

    pub fn push_inbound(&self, from: SocketAddr, data: &[u8]) {
        self.inbound.borrow_mut().push_back((from, data.to_vec()));
    }
}

impl Socket for RecordingSocket {
    fn send(&self, to: SocketAddr, data: &[u8]) {
        assert!(data.len() <= self.mtu, "packet of {} bytes exceeds mtu {}", data.len(), self.mtu);
        self.sent.borrow_mut().push((to, data.to_vec()));
    }

    fn recv(&self, _now: Instant, buf: &mut [u8]) -> Option<(SocketAddr, usize)> {
        let (from, data) = self.inbound.borrow_mut().pop_front()?;
        buf[..data.len()].copy_from_slice(&data);
        Some((from, data.len()))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}


/// Lossless in-memory network: every [`HubSocket`] has an address and a queue, and a
///  send lands directly in the destination's queue. Packets to unregistered addresses
///  vanish, like on a real network.
pub struct NetworkHub {
    mtu: usize,
    queues: RefCell<FxHashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>>,
}

impl NetworkHub {
    pub fn new(mtu: usize) -> Rc<NetworkHub> {
        Rc::new(NetworkHub {
            mtu,
            queues: RefCell::new(FxHashMap::default()),
        })
    }

    pub fn socket(self: &Rc<Self>, addr: &str) -> Rc<HubSocket> {
        let addr = SocketAddr::from_str(addr).unwrap();
        self.queues.borrow_mut().insert(addr, VecDeque::new());
        Rc::new(HubSocket {
            hub: self.clone(),
            addr,
        })
    }
}

pub struct HubSocket {
    hub: Rc<NetworkHub>,
    addr: SocketAddr,
}

impl HubSocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Socket for HubSocket {
    fn send(&self, to: SocketAddr, data: &[u8]) {
        assert!(data.len() <= self.hub.mtu, "packet of {} bytes exceeds mtu {}", data.len(), self.hub.mtu);
        let mut queues = self.hub.queues.borrow_mut();
        match queues.get_mut(&to) {
            Some(queue) => queue.push_back((self.addr, data.to_vec())),
            None => warn!("dropping packet to unregistered address {:?}", to),
        }
    }

    fn recv(&self, _now: Instant, buf: &mut [u8]) -> Option<(SocketAddr, usize)> {
        let (from, data) = self.hub.queues.borrow_mut().get_mut(&self.addr)?.pop_front()?;
        buf[..data.len()].copy_from_slice(&data);
        Some((from, data.len()))
    }

    fn mtu(&self) -> usize {
        self.hub.mtu
    }
}
