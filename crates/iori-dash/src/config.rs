use std::time::Duration;

/// Tunables for manifest loading, segment downloads and buffering.
#[derive(Debug, Clone)]
pub struct DashConfig {
    pub manifest_timeout: Duration,
    pub manifest_retries: u32,
    pub manifest_retry_delay: Duration,
    /// Used when the manifest has no usable `minimumUpdatePeriod`.
    pub manifest_reload_delay: Duration,

    pub segment_timeout: Duration,
    pub segment_attempts: u32,
    pub backoff_unit: Duration,

    /// Fallback when the manifest has no `minBufferTime`.
    pub time_buffer_depth_default: Duration,
    /// Overrides the computed time buffer depth.
    pub time_buffer_depth: Option<Duration>,

    pub seek_timeout: Duration,
    pub adaptive_audio: bool,
    /// Static manifests stop after this many reloads without a matching period.
    pub max_period_misses: u32,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            manifest_timeout: Duration::from_secs(3),
            manifest_retries: 3,
            manifest_retry_delay: Duration::from_secs(1),
            manifest_reload_delay: Duration::from_millis(1500),

            segment_timeout: Duration::from_secs(10),
            segment_attempts: 3,
            backoff_unit: Duration::from_millis(100),

            time_buffer_depth_default: Duration::from_secs(10),
            time_buffer_depth: None,

            seek_timeout: Duration::from_secs(5),
            adaptive_audio: false,
            max_period_misses: 5,
        }
    }
}

impl DashConfig {
    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    pub fn with_manifest_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.manifest_retries = retries.max(1);
        self.manifest_retry_delay = delay;
        self
    }

    pub fn with_manifest_reload_delay(mut self, delay: Duration) -> Self {
        self.manifest_reload_delay = delay;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_segment_attempts(mut self, attempts: u32) -> Self {
        self.segment_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_time_buffer_depth(mut self, depth: Duration) -> Self {
        self.time_buffer_depth = Some(depth);
        self
    }

    pub fn with_seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = timeout;
        self
    }

    pub fn with_adaptive_audio(mut self, enabled: bool) -> Self {
        self.adaptive_audio = enabled;
        self
    }

    pub fn with_max_period_misses(mut self, misses: u32) -> Self {
        self.max_period_misses = misses;
        self
    }
}
