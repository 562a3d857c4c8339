use anyhow::bail;

/// Default retransmission interval for unacknowledged data segments.
pub const RETRANSMIT_TIMEOUT_MS: u32 = 500;
/// Accelerated retransmission interval used after the socket reported
/// would-block: the segment may never have left this host, so it is resent
/// much sooner than a segment that was probably just lost on the network.
pub const URGENT_RETRANSMIT_TIMEOUT_MS: u32 = RETRANSMIT_TIMEOUT_MS >> 2;
/// Number of retransmissions before a segment is given up on.
pub const RETRANSMIT_RETRIES: u16 = 4;
/// Interval between re-delivery attempts after the host refused a received
/// message.
pub const RECV_TIMEOUT_MS: u32 = 300;
/// Number of re-delivery attempts before the connection is torn down.
pub const RECV_RETRIES: u16 = 4;

/// Smallest acceptable segment buffer size. Below this there is not even room
/// for a header plus the IP/UDP overhead.
pub const MIN_SEGMENT_BMAX: u16 = 120;

/// Global configuration for an engine instance.
///
/// All timeouts are in milliseconds of the engine's monotonic clock. The
/// defaults are the values the protocol was tuned with; `validate()` is
/// called when the engine is created.
#[derive(Debug, Clone)]
pub struct ArdpConfig {
    /// How long an active or passive open may sit in SYN_SENT / SYN_RCVD
    /// before the connect callback fires with a timeout and the connection
    /// record is destroyed.
    pub connect_timeout: u32,

    /// Period of the per-connection window-check timer. Each firing may emit
    /// a NUL probe when the link has been quiet for this long, or when the
    /// peer's advertised window is too small to carry a maximum-size message.
    pub persist_timeout: u32,

    /// Base interval for liveness accounting. A connection that has not seen
    /// any traffic for `10 * probe_timeout` is declared dead and torn down.
    pub probe_timeout: u32,

    /// Delay between entering CLOSE_WAIT and the disconnect callback. Gives
    /// in-flight segments time to drain before the record disappears.
    pub timewait: u32,

    /// Upper bound for a single application message. Together with the
    /// negotiated segment size this determines the minimum send window needed
    /// to carry a maximum-size message without stalling.
    pub max_message_len: u32,
}

impl Default for ArdpConfig {
    fn default() -> Self {
        ArdpConfig {
            connect_timeout: 10_000,
            persist_timeout: 5_000,
            probe_timeout: 3_000,
            timewait: 1_000,
            max_message_len: 128 * 1024,
        }
    }
}

impl ArdpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout == 0 {
            bail!("connect timeout must be non-zero");
        }
        if self.persist_timeout == 0 || self.probe_timeout == 0 {
            bail!("liveness timeouts must be non-zero");
        }
        if self.timewait == 0 {
            bail!("timewait must be non-zero");
        }
        if self.max_message_len == 0 {
            bail!("max message length must be non-zero");
        }
        Ok(())
    }
}
