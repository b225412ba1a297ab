use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The leading tag byte on every physical packet. Everything the engine does with an
///  inbound datagram starts with demultiplexing on this value; packets with a tag that
///  does not parse are dropped as noise.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Unreliable = 1,
    Reliable = 2,
    Connect = 3,
    Disconnect = 4,
    Ping = 5,
    Pong = 6,
}
