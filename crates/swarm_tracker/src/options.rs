use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Timeouts and limits shared by every swarm of a [`crate::Tracker`].
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerOptions {
    /// A peer that hasn't sent a heartbeat for this long becomes stale.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub heartbeat_timeout: Duration,

    /// A stale peer is considered departed after this much more silence.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub departure_grace: Duration,

    /// How often staleness, deadlines and speeds are swept.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub sweep_interval: Duration,

    /// Deadline for the source to accept a request.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub request_timeout: Duration,

    /// Deadline for the piece to arrive once the request was accepted.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub transfer_timeout: Duration,

    /// Sessions per (downloader, piece) before the piece is reported unobtainable.
    pub max_attempts: u32,

    /// Open sessions a single source may serve at once.
    pub max_fan_out: usize,

    /// Trailing window for upload/download rates.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub rate_window: Duration,

    pub max_peers_in_response: usize,

    /// An empty swarm is dropped after being empty for this long.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub idle_swarm_grace: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(120),
            departure_grace: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_fan_out: 4,
            rate_window: Duration::from_secs(5),
            max_peers_in_response: 50,
            idle_swarm_grace: Duration::from_secs(300),
        }
    }
}

impl TrackerOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.max_fan_out == 0 {
            anyhow::bail!("max_fan_out must be at least 1");
        }
        if self.rate_window.is_zero() {
            anyhow::bail!("rate_window can't be 0");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval can't be 0");
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        let opts: Self = serde_json::from_str(json).context("error parsing tracker options")?;
        opts.validate()?;
        Ok(opts)
    }
}
