use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Linear input buffer capacity used when the input format does not carry
/// a max input size.
pub const DEFAULT_LINEAR_BUFFER_SIZE: usize = 1024 * 1024;

/// Policy deciding when a client input buffer is deep-copied into an extra
/// slot so the original slot can be handed back to the client sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraSlotPolicy {
    /// Never copy.
    Disabled,
    /// Copy while fewer extra buffers are held by the component than the
    /// number of extra slots derived from the component's delays.
    Auto,
    /// Copy while fewer than `n` extra buffers are held by the component.
    Fixed(usize),
}

/// Tunables of a buffer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Extra slots added on top of the component's delay budget.
    pub smoothness_factor: usize,
    /// Extra dequeue buffers reserved for the output surface.
    pub rendering_depth: usize,
    /// Idle time after which a keepalive work is queued.
    pub pipeline_paused_timeout_ms: u64,
    /// Queue a drop-frame keepalive work when the pipeline looks paused.
    pub paused_keepalive: bool,
    /// Bounded reallocation attempts per output buffer.
    pub max_realloc_tries: usize,
    pub extra_slot_policy: ExtraSlotPolicy,
    /// Wait before retrying an initial input buffer allocation.
    pub initial_buffer_retry_ms: u64,
    /// (alignment below 1 MiB, granule at and above 1 MiB) for encrypted
    /// info buffer allocations.
    pub encrypted_alloc_granules: (usize, usize),
    /// Attach an encrypted copy of secure input as an info buffer.
    pub send_encrypted_info_buffer: bool,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self {
            smoothness_factor: 4,
            rendering_depth: 3,
            pipeline_paused_timeout_ms: 500,
            paused_keepalive: false,
            max_realloc_tries: 5,
            extra_slot_policy: ExtraSlotPolicy::Auto,
            initial_buffer_retry_ms: 4,
            encrypted_alloc_granules: (64 * 1024, 1024 * 1024),
            send_encrypted_info_buffer: false,
        }
    }

    /// Load a configuration from a JSON file. Missing fields keep their
    /// default value.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading channel config {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("parsing channel config {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let config: ChannelConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let (small, large) = self.encrypted_alloc_granules;
        if small == 0 || large == 0 {
            anyhow::bail!("encrypted_alloc_granules must be non-zero");
        }
        if self.max_realloc_tries == 0 {
            anyhow::bail!("max_realloc_tries must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_paused_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_paused_timeout_ms)
    }

    pub fn initial_buffer_retry(&self) -> Duration {
        Duration::from_millis(self.initial_buffer_retry_ms)
    }

    /// Size of the block backing an encrypted info buffer for `size` bytes.
    pub fn encrypted_alloc_size(&self, size: usize) -> usize {
        let (align, granule) = self.encrypted_alloc_granules;
        if size <= granule {
            size.div_ceil(align) * align
        } else {
            size.div_ceil(granule) * granule
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
