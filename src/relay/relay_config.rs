use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Everything needed to join a room on a relay server. Credentials are opaque to this
///  layer - they are forwarded verbatim in the room announcement and the relay decides
///  what they mean.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub relay_addr: SocketAddr,
    pub room_id: i32,
    pub room_secret: Vec<u8>,
    pub connection_secret: Vec<u8>,
}

impl RelayConfig {
    /// Validates and decodes the raw settings. Errors here are fatal configuration
    ///  mistakes, reported before any network activity starts.
    pub fn new(
        host: &str,
        port: u16,
        room_id: i32,
        room_secret_base64: &str,
        connection_secret: &str,
    ) -> anyhow::Result<RelayConfig> {
        let ip = IpAddr::from_str(host)
            .with_context(|| format!("relay address {:?} is not a valid IP address", host))?;
        let room_secret = STANDARD
            .decode(room_secret_base64)
            .context("room secret is not valid base64")?;

        Ok(RelayConfig {
            relay_addr: SocketAddr::new(ip, port),
            room_id,
            room_secret,
            connection_secret: connection_secret.as_bytes().to_vec(),
        })
    }
}
