pub mod connection_tracker;
pub mod managed_socket;
pub mod message_type;
pub mod ping_tracker;
pub mod reliable_channel;
pub mod socket;
pub mod transport_config;
pub mod transport_events;
pub mod unreliable_channel;
