//! Resource quotas and execution limits for sandboxed actions

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-sandbox resource quota, enforced with host resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuota {
    /// CPU time allowed per action, in seconds
    pub cpu_seconds: u64,
    /// Data-segment limit in bytes
    pub memory_bytes: u64,
    /// Disk usage allowed inside the sandbox volume, in MiB
    pub disk_mb: u64,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            cpu_seconds: 15,                     // half a core over the default 30 s timeout
            memory_bytes: 512 * 1024 * 1024,     // 512 MB
            disk_mb: 1024,                       // 1 GB
        }
    }
}

impl ResourceQuota {
    /// Disk quota in bytes.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_mb.saturating_mul(1024 * 1024)
    }
}

/// Wall-clock and output limits for one action run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Wall-clock timeout before the graceful stop signal
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Time between the graceful stop and the forced kill
    #[serde(with = "duration_ms", rename = "grace_ms")]
    pub grace: Duration,
    /// Maximum captured bytes per stream (stdout and stderr separately)
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            grace: Duration::from_secs(2),
            max_output_bytes: 1024 * 1024, // 1 MB per stream
        }
    }
}

impl ExecutionLimits {
    /// Upper bound on how long a run may take before it is reported.
    pub fn hard_deadline(&self) -> Duration {
        self.timeout + self.grace
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Same as [`duration_ms`] for optional durations.
pub(crate) mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Buffer that keeps at most `limit` bytes and remembers whether it dropped any.
///
/// Writes past the limit are accepted and discarded so the producing pipe keeps
/// draining; a runaway process can never grow the buffer beyond the cap.
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    seen: u64,
    truncated: bool,
}

impl LimitedBuffer {
    /// Create an empty buffer capped at `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            seen: 0,
            truncated: false,
        }
    }

    /// Append data, keeping only what fits. Returns `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.seen += data.len() as u64;
        let remaining = self.limit.saturating_sub(self.buffer.len());
        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);
        if to_write < data.len() {
            self.truncated = true;
        }
        data.len()
    }

    /// Captured bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Whether any data was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Total bytes offered to the buffer, kept or not.
    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    /// Captured bytes, borrowed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::io::Write for LimitedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(LimitedBuffer::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
