use std::time::Duration;
use anyhow::bail;
use crate::backoff::RetryBackoff;
use crate::seeker::ResyncPolicy;

pub struct GateConfig {
    /// A connected docker without any successful I/O for this long is considered expired. It
    ///  becomes connected again with the next successful receive or send.
    pub idle_timeout: Duration,

    /// The drive loop sleeps this long when a tick did no work. Sleeping is interrupted by
    ///  incoming commands and by termination, so this affects latency only for work that is
    ///  discovered by polling, i.e. inbound data.
    pub foreground_idle_interval: Duration,
    /// Idle sleep while the application is in the background, trading latency for power
    pub background_idle_interval: Duration,

    /// Number of inbound reads that are processed per outbound departure for every docker in a
    ///  single tick. This keeps a busy inbound connection from starving outbound traffic.
    pub max_arrivals_per_departure: usize,

    /// Departures that could not be sent within this time after their creation are dropped and
    ///  reported as expired
    pub departure_expiry: Duration,
    pub retry_backoff: RetryBackoff,

    /// An expired docker gets a heartbeat package (if the wire schema has one) at most this
    ///  often. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,

    /// Whether a protocol desync moves the connection to `Error`. It is always reported to the
    ///  delegate.
    pub error_on_desync: bool,

    /// `None` picks the policy that fits the hub: iterative for streams, single-shot for datagrams
    pub resync_policy: Option<ResyncPolicy>,

    /// upper bound for waiting for the drive loop to finish on termination
    pub terminate_timeout: Duration,
}

impl GateConfig {
    pub fn new() -> GateConfig {
        GateConfig {
            idle_timeout: Duration::from_secs(28),
            foreground_idle_interval: Duration::from_millis(128),
            background_idle_interval: Duration::from_secs(1),
            max_arrivals_per_departure: 4,
            departure_expiry: Duration::from_secs(120),
            retry_backoff: RetryBackoff::new(Duration::from_secs(2), Duration::from_secs(32), 16),
            heartbeat_interval: Some(Duration::from_secs(2)),
            error_on_desync: false,
            resync_policy: None,
            terminate_timeout: Duration::from_secs(5),
        }
    }

    pub fn idle_interval(&self, background: bool) -> Duration {
        if background {
            self.background_idle_interval
        }
        else {
            self.foreground_idle_interval
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_timeout.is_zero() {
            bail!("idle timeout must be positive");
        }
        if self.foreground_idle_interval.is_zero() || self.background_idle_interval.is_zero() {
            bail!("idle intervals must be positive");
        }
        if self.background_idle_interval < self.foreground_idle_interval {
            bail!("background idle interval must not be shorter than the foreground idle interval");
        }
        if self.max_arrivals_per_departure == 0 {
            bail!("at least one arrival per departure must be processed");
        }
        if self.heartbeat_interval.is_some_and(|i| i.is_zero()) {
            bail!("heartbeat interval must be positive");
        }
        self.retry_backoff.validate()?;
        Ok(())
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig::new()
    }
}

pub struct HubConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// number of bytes requested from a stream per read
    pub read_chunk_size: usize,
    pub max_datagram_size: usize,
    /// upper bound for the number of datagrams read from the socket in a single receive call
    pub max_datagrams_per_pump: usize,
}

impl HubConfig {
    pub fn new() -> HubConfig {
        HubConfig {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            read_chunk_size: 16 * 1024,
            max_datagram_size: 65535,
            max_datagrams_per_pump: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_chunk_size == 0 {
            bail!("read chunk size must be positive");
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > 65535 {
            bail!("max datagram size must be between 1 and 65535");
        }
        if self.max_datagrams_per_pump == 0 {
            bail!("at least one datagram must be read per pump");
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig::new()
    }
}
