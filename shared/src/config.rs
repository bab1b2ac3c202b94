use crate::SyncError;

/// Media size ceiling shared by image and audio uploads.
pub const MAX_MEDIA_BYTES: usize = 20 * 1024 * 1024;

const MAX_MEDIA_BYTES_LIMIT: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub max_media_bytes: usize,
    /// Text sent alongside an image.
    pub image_caption: String,
    pub audio_caption: String,
    pub location_caption: String,
    /// First delay before resubscribing after the feed ends or refuses a
    /// subscription while the network is still up. Doubles per attempt.
    pub resubscribe_base_ms: u64,
    pub resubscribe_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_media_bytes: MAX_MEDIA_BYTES,
            image_caption: String::new(),
            audio_caption: "Audio message".to_string(),
            location_caption: "My location".to_string(),
            resubscribe_base_ms: 1_000,
            resubscribe_max_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_media_bytes == 0 {
            return Err(SyncError::Config("max_media_bytes must be > 0".into()));
        }
        if self.max_media_bytes > MAX_MEDIA_BYTES_LIMIT {
            return Err(SyncError::Config(format!(
                "max_media_bytes must be at most {MAX_MEDIA_BYTES_LIMIT}"
            )));
        }
        if self.resubscribe_base_ms == 0 {
            return Err(SyncError::Config("resubscribe_base_ms must be > 0".into()));
        }
        if self.resubscribe_max_ms < self.resubscribe_base_ms {
            return Err(SyncError::Config(
                "resubscribe_max_ms must be >= resubscribe_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before resubscribe attempt `attempt` (zero-based), capped.
    #[must_use]
    pub fn resubscribe_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(16);
        self.resubscribe_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.resubscribe_max_ms)
    }
}
