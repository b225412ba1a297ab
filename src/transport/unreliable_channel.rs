use std::net::SocketAddr;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::transport::message_type::MessageType;
use crate::transport::socket::Socket;

const HEADER_SIZE: usize = 4;

/// 255 is reserved: it never appears as a live sequence number, slice index or slice
///  count, and packets carrying it in any of those fields are dropped as malformed.
const RESERVED: u8 = u8::MAX;

const MAX_SLICES: usize = u8::MAX as usize;

#[derive(Debug, Error, Eq, PartialEq)]
#[error("message of {message_len} bytes needs more than {MAX_SLICES} slices for unreliable transfer")]
pub struct FragmentationError {
    pub message_len: usize,
}

struct Slot {
    data: Vec<u8>,
    /// sequence number and payload length of the slice currently occupying this slot,
    ///  `None` when the slot is logically cleared
    stamp: Option<(u8, usize)>,
}

/// Best-effort delivery of possibly-oversized messages over the datagram substrate,
///  one instance per peer.
///
/// Oversized messages are split into sequenced slices
///  (`[type][sequence][slice_index][slice_count][payload]`) and reassembled on the
///  far side from a fixed array of per-index slots. There is no retransmission and no
///  ordering: a message completes when all of its slices have arrived, whatever the
///  order, and is abandoned if a newer sequence starts overwriting its slots first.
///  That cross-sequence overwrite is wire-visible behavior and is kept as-is.
pub struct UnreliableChannel {
    socket: Rc<dyn Socket>,
    peer: SocketAddr,
    available_mtu: usize,
    sequence: u8,
    send_buf: Vec<u8>,
    slots: Vec<Slot>,
    assembly_buf: Vec<u8>,
}

impl UnreliableChannel {
    pub fn new(socket: Rc<dyn Socket>, peer: SocketAddr) -> UnreliableChannel {
        let available_mtu = socket.mtu() - HEADER_SIZE;
        let slots = (0..MAX_SLICES)
            .map(|_| Slot {
                data: vec![0; available_mtu],
                stamp: None,
            })
            .collect();

        UnreliableChannel {
            socket,
            peer,
            available_mtu,
            sequence: 0,
            send_buf: Vec::with_capacity(HEADER_SIZE + available_mtu),
            slots,
            assembly_buf: vec![0; available_mtu * MAX_SLICES],
        }
    }

    /// the largest payload a single slice can carry
    pub fn available_mtu(&self) -> usize {
        self.available_mtu
    }

    /// Splits `data` into slices and emits one physical packet per slice, all tagged
    ///  with the same sequence number. Fails before emitting anything if the message
    ///  does not fit into the slice budget.
    pub fn send(&mut self, data: &[u8]) -> Result<(), FragmentationError> {
        let slice_count = data.len().div_ceil(self.available_mtu);
        if slice_count > MAX_SLICES {
            return Err(FragmentationError {
                message_len: data.len(),
            });
        }

        for (slice_index, slice) in data.chunks(self.available_mtu).enumerate() {
            self.send_buf.clear();
            self.send_buf.push(MessageType::Unreliable.into());
            self.send_buf.push(self.sequence);
            self.send_buf.push(slice_index as u8);
            self.send_buf.push(slice_count as u8);
            self.send_buf.extend_from_slice(slice);
            self.socket.send(self.peer, &self.send_buf);
        }
        trace!("sent sequence {} to {:?} in {} slices", self.sequence, self.peer, slice_count);

        // skip the reserved value when wrapping
        self.sequence = if self.sequence >= RESERVED - 1 { 0 } else { self.sequence + 1 };
        Ok(())
    }

    /// Feeds one raw inbound packet into reassembly. Returns the length of a completed
    ///  message (retrieve it with [`assembled`](Self::assembled)) once every slot from
    ///  0 to `slice_count - 1` holds data stamped with the arriving sequence number,
    ///  `None` while the message is still incomplete or the packet is malformed.
    pub fn try_receive(&mut self, packet: &[u8]) -> Option<usize> {
        if packet.len() < HEADER_SIZE {
            return None;
        }
        if packet[0] != u8::from(MessageType::Unreliable) {
            return None;
        }
        let sequence = packet[1];
        let slice_index = packet[2];
        let slice_count = packet[3];
        if sequence == RESERVED || slice_index == RESERVED || slice_count == RESERVED {
            debug!("dropping unreliable slice with reserved header field from {:?}", self.peer);
            return None;
        }

        let payload = &packet[HEADER_SIZE..];
        if payload.len() > self.available_mtu {
            debug!("dropping oversized unreliable slice from {:?}", self.peer);
            return None;
        }

        let slot = &mut self.slots[slice_index as usize];
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.stamp = Some((sequence, payload.len()));

        for slot in &self.slots[..slice_count as usize] {
            match slot.stamp {
                Some((stamped_sequence, _)) if stamped_sequence == sequence => {}
                _ => return None,
            }
        }

        let mut assembled_len = 0;
        for slot in &mut self.slots[..slice_count as usize] {
            let (_, slice_len) = slot.stamp.take().expect("checked above");
            self.assembly_buf[assembled_len..assembled_len + slice_len]
                .copy_from_slice(&slot.data[..slice_len]);
            assembled_len += slice_len;
        }
        trace!("reassembled sequence {} from {:?}: {} bytes", sequence, self.peer, assembled_len);
        Some(assembled_len)
    }

    /// the most recently completed message; valid only until the next `try_receive`
    pub fn assembled(&self, len: usize) -> &[u8] {
        &self.assembly_buf[..len]
    }

    #[cfg(test)]
    fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }
}
