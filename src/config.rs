use anyhow::bail;
use std::time::Duration;

/// All timing and size constants for one [crate::gate::Gate] instance.
///
/// The defaults are tuned for WAN-ish links with human-scale message rates; deployments
///  inside a data center will typically want a much smaller `departure_expires`.
pub struct GateConfig {
    /// Retry interval for a departure awaiting its response: once this much time has
    ///  passed since the last send attempt, the shipment becomes TIMEOUT and is
    ///  eligible for a re-send.
    pub departure_expires: Duration,

    /// Total number of send attempts (first send included) before a departure is
    ///  reported as FAILED. This ceiling is always enforced - a shipment can never
    ///  cycle between WAITING and TIMEOUT forever.
    pub departure_max_tries: u32,

    /// A partial fragment assembly that has not seen a new fragment for this long is
    ///  considered abandoned and discarded unfinished.
    pub assembly_expires: Duration,

    /// How long a resolved sequence number is remembered so that duplicate or late
    ///  acknowledgments are absorbed silently instead of being treated as unmatched.
    pub finished_retention: Duration,

    /// A connection that has not received anything for this long leaves CONNECTED and
    ///  starts heartbeat probing. Silence for eight times this window is an ERROR.
    pub connection_expires: Duration,

    /// Maximum fragment payload size the codec may produce; payloads larger than this
    ///  are split into pages. The default leaves room for the codec header inside a
    ///  full-Ethernet-frame UDP payload (1472 bytes for IPV4).
    pub max_fragment_size: usize,

    /// Sleep between dispatch loop iterations that did no useful work.
    pub idle_interval: Duration,

    /// Cadence for purging both halls (finished departures, abandoned assemblies,
    ///  stale finished-cache entries).
    pub purge_interval: Duration,

    /// Size of the receive buffer handed to channels. Datagrams larger than this are
    ///  truncated by the OS, so it should be at least the expected maximum unit size.
    pub recv_buffer_size: usize,
}

impl Default for GateConfig {
    fn default() -> GateConfig {
        GateConfig {
            departure_expires: Duration::from_secs(120),
            departure_max_tries: 3,
            assembly_expires: Duration::from_secs(300),
            finished_retention: Duration::from_secs(3600),
            connection_expires: Duration::from_secs(16),
            max_fragment_size: 1472 - crate::codec::HEADER_LEN,
            idle_interval: Duration::from_millis(8),
            purge_interval: Duration::from_secs(1),
            recv_buffer_size: 65536,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.departure_max_tries == 0 {
            bail!("departure_max_tries must be at least 1");
        }
        if self.max_fragment_size < 16 {
            bail!("max_fragment_size is too small");
        }
        if self.recv_buffer_size < self.max_fragment_size + crate::codec::HEADER_LEN {
            bail!("recv_buffer_size is smaller than a full fragment");
        }
        if self.idle_interval.is_zero() {
            bail!("idle_interval must be non-zero to avoid a busy spin");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(GateConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_tries() {
        let config = GateConfig {
            departure_max_tries: 0,
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_fragments() {
        let config = GateConfig {
            max_fragment_size: 4,
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_undersized_recv_buffer() {
        let config = GateConfig {
            recv_buffer_size: 100,
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
