use std::net::SocketAddr;
use std::rc::Rc;

use tracing::trace;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
}

/// Observer interface for connection lifecycle. Any number of collaborators may
///  register; each registered listener is invoked exactly once per event, in
///  unspecified order.
pub trait ConnectionListener {
    fn on_event(&self, event: ConnectionEvent);
}

pub struct ConnectionEventNotifier {
    listeners: Vec<Rc<dyn ConnectionListener>>,
}

impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        ConnectionEventNotifier {
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Rc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
