use std::time::Duration;

/// Timing knobs for the protocol engine. All timers are advanced exclusively by the
///  caller's tick, so these durations are measured against whatever clock the caller
///  passes into the step functions.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// a peer that has not sent anything for this long is evicted and reported as
    ///  disconnected
    pub connection_timeout: Duration,

    /// number of Connect messages a joining peer sends before giving up
    pub handshake_attempts: u32,
    pub handshake_retry_interval: Duration,

    /// interval between RTT probes per peer
    pub ping_interval: Duration,
    /// bound for both outstanding probes and retained RTT samples per peer
    pub max_tracked_pings: usize,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            connection_timeout: Duration::from_secs(10),
            handshake_attempts: 3,
            handshake_retry_interval: Duration::from_secs(1),
            ping_interval: Duration::from_millis(100),
            max_tracked_pings: 10,
        }
    }
}
