//! Tunneling of the transport's packets through a rendezvous relay server, for peers
//!  that cannot reach each other directly. The relay speaks a thin envelope protocol
//!  on top of the same datagram substrate; to the layers above, the tunnel is just
//!  another [`Socket`](crate::transport::socket::Socket) with a smaller MTU.

pub mod packet_encryption;
pub mod relay_config;
pub mod relay_socket;
