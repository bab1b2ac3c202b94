//! Media Upload Pipeline.
//!
//! Turns captured bytes into a durable remote URL before any message can
//! reference them. Uploads are never queued: an offline or failed upload is
//! reported to the caller, who retries from scratch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{BlobError, BlobKey, BlobStore, Microphone, MicrophoneError};
use crate::coordinator::SyncHandle;
use crate::model::{Confirmation, MediaKind, MediaUrl, Sender, UnixTimeMs};
use crate::SyncError;

const KEY_SUFFIX_LEN: usize = 6;
const KEY_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("cannot upload while offline")]
    Offline,

    #[error("media too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("media payload is empty")]
    EmptyPayload,

    #[error("upload rejected: {0}")]
    Rejected(#[from] BlobError),
}

// --- Format sniffing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Jpeg,
    Png,
    WebP,
    Heic,
    M4a,
    Ogg,
    Wav,
    Mp3,
}

impl MediaFormat {
    #[must_use]
    pub const fn kind(self) -> MediaKind {
        match self {
            Self::Jpeg | Self::Png | Self::WebP | Self::Heic => MediaKind::Image,
            Self::M4a | Self::Ogg | Self::Wav | Self::Mp3 => MediaKind::Audio,
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Heic => "heic",
            Self::M4a => "m4a",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }

    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Heic => "image/heic",
            Self::M4a => "audio/mp4",
            Self::Ogg => "audio/ogg",
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
        }
    }

    #[must_use]
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        if data.starts_with(b"RIFF") {
            match data.get(8..12) {
                Some(b"WEBP") => return Some(Self::WebP),
                Some(b"WAVE") => return Some(Self::Wav),
                _ => {}
            }
        }

        if data.get(4..8) == Some(&b"ftyp"[..]) {
            match data.get(8..12) {
                Some(b"heic" | b"heix" | b"mif1") => return Some(Self::Heic),
                Some(b"M4A " | b"mp42" | b"isom") => return Some(Self::M4a),
                _ => {}
            }
        }

        if data.starts_with(b"OggS") {
            return Some(Self::Ogg);
        }

        if data.starts_with(b"ID3") || matches!(data, [0xFF, 0xFB | 0xF3 | 0xF2, ..]) {
            return Some(Self::Mp3);
        }

        None
    }

    /// Detected format if it agrees with the declared kind.
    #[must_use]
    pub fn sniff(kind: MediaKind, data: &[u8]) -> Option<Self> {
        Self::from_magic_bytes(data).filter(|format| format.kind() == kind)
    }
}

// --- Key generation ---

/// Collision-resistant blob keys: `{prefix}/{timestamp_ms}_{suffix}.{ext}`.
///
/// Timestamps are strictly increasing per generator even if the wall clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last_ms: AtomicU64,
}

impl KeyGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self, kind: MediaKind, extension: &str) -> Result<BlobKey, BlobError> {
        let timestamp = self.next_timestamp();
        let suffix = random_suffix();
        BlobKey::new(format!("{}/{timestamp}_{suffix}.{extension}", kind.prefix()))
    }

    fn next_timestamp(&self) -> u64 {
        let now = UnixTimeMs::now().as_millis();
        let mut prev = self.last_ms.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev.saturating_add(1));
            match self
                .last_ms
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_SUFFIX_LEN)
        .map(|_| char::from(KEY_SUFFIX_ALPHABET[rng.gen_range(0..KEY_SUFFIX_ALPHABET.len())]))
        .collect()
}

// --- Pipeline ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub key: BlobKey,
    pub url: MediaUrl,
    pub kind: MediaKind,
    pub size_bytes: usize,
    pub content_type: &'static str,
}

pub struct MediaPipeline {
    store: Arc<dyn BlobStore>,
    keys: KeyGenerator,
    max_bytes: usize,
}

impl MediaPipeline {
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, max_bytes: usize) -> Self {
        Self {
            store,
            keys: KeyGenerator::new(),
            max_bytes,
        }
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Preconditions checked before any remote call.
    pub fn check(&self, online: bool, size: usize) -> Result<(), UploadError> {
        if !online {
            return Err(UploadError::Offline);
        }
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        if size == 0 {
            return Err(UploadError::EmptyPayload);
        }
        Ok(())
    }

    /// Single atomic put followed by URL resolution. No chunking, no resume.
    #[instrument(skip(self, bytes), fields(kind = %kind, size = bytes.len()))]
    pub async fn upload(&self, online: bool, kind: MediaKind, bytes: Bytes) -> Result<UploadedMedia, UploadError> {
        if let Err(e) = self.check(online, bytes.len()) {
            info!(error = %e, "upload rejected before transfer");
            return Err(e);
        }

        let format = MediaFormat::sniff(kind, &bytes);
        let extension = format.map_or(kind.default_extension(), MediaFormat::extension);
        let content_type = format.map_or(kind.default_content_type(), MediaFormat::content_type);
        let key = self.keys.next_key(kind, extension)?;
        let size_bytes = bytes.len();

        debug!(key = %key, content_type, "putting blob");

        if let Err(e) = self.store.put(&key, bytes, content_type).await {
            warn!(key = %key, code = e.code(), "blob put failed");
            return Err(e.into());
        }

        let url = match self.store.resolve_url(&key).await {
            Ok(url) => url,
            Err(e) => {
                warn!(key = %key, code = e.code(), "blob url resolution failed");
                return Err(e.into());
            }
        };

        info!(key = %key, "media uploaded");

        Ok(UploadedMedia {
            key,
            url,
            kind,
            size_bytes,
            content_type,
        })
    }
}

// --- Audio recording ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    UploadInFlight,
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("previous recording is still uploading")]
    Busy,

    #[error(transparent)]
    Microphone(#[from] MicrophoneError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderOutcome {
    Started,
    Sent(Confirmation),
}

/// Push-to-talk recorder: `Idle -> Recording -> UploadInFlight -> Idle`.
///
/// A second toggle while recording stops and sends. Only one recording is
/// active at a time.
pub struct AudioRecorder {
    microphone: Arc<dyn Microphone>,
    state: Mutex<RecorderState>,
}

impl AudioRecorder {
    #[must_use]
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            state: Mutex::new(RecorderState::Idle),
        }
    }

    pub async fn state(&self) -> RecorderState {
        *self.state.lock().await
    }

    #[instrument(skip(self, handle, sender))]
    pub async fn toggle(&self, handle: &SyncHandle, sender: &Sender) -> Result<RecorderOutcome, RecorderError> {
        let mut state = self.state.lock().await;
        let current = *state;

        match current {
            RecorderState::UploadInFlight => Err(RecorderError::Busy),
            RecorderState::Idle => {
                if !self.microphone.request_permission().await {
                    info!("microphone permission denied");
                    return Err(RecorderError::PermissionDenied);
                }
                self.microphone.start().await?;
                *state = RecorderState::Recording;
                debug!("recording started");
                Ok(RecorderOutcome::Started)
            }
            RecorderState::Recording => {
                let clip = match self.microphone.stop().await {
                    Ok(clip) => clip,
                    Err(e) => {
                        *state = RecorderState::Idle;
                        warn!(error = %e, "failed to finalize recording");
                        return Err(e.into());
                    }
                };
                *state = RecorderState::UploadInFlight;
                drop(state);

                debug!(size = clip.len(), "recording stopped, uploading");
                let result = handle.share_media(sender.clone(), MediaKind::Audio, clip).await;

                *self.state.lock().await = RecorderState::Idle;
                Ok(RecorderOutcome::Sent(result?))
            }
        }
    }

    /// Stop and discard the current recording, if any.
    pub async fn cancel(&self) -> Result<(), RecorderError> {
        let mut state = self.state.lock().await;
        if *state == RecorderState::Recording {
            *state = RecorderState::Idle;
            self.microphone.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBlobStore;
    use std::collections::HashSet;

    #[test]
    fn test_sniff_formats() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(MediaFormat::from_magic_bytes(&jpeg), Some(MediaFormat::Jpeg));

        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(MediaFormat::from_magic_bytes(&png), Some(MediaFormat::Png));

        assert_eq!(MediaFormat::from_magic_bytes(b"RIFF\0\0\0\0WEBPVP8 "), Some(MediaFormat::WebP));
        assert_eq!(MediaFormat::from_magic_bytes(b"RIFF\0\0\0\0WAVEfmt "), Some(MediaFormat::Wav));
        assert_eq!(MediaFormat::from_magic_bytes(b"\0\0\0\x20ftypheic\0\0"), Some(MediaFormat::Heic));
        assert_eq!(MediaFormat::from_magic_bytes(b"\0\0\0\x20ftypM4A \0\0"), Some(MediaFormat::M4a));
        assert_eq!(MediaFormat::from_magic_bytes(b"OggS\0\x02"), Some(MediaFormat::Ogg));
        assert_eq!(MediaFormat::from_magic_bytes(b"ID3\x04\0"), Some(MediaFormat::Mp3));
        assert_eq!(MediaFormat::from_magic_bytes(b"hello"), None);
        assert_eq!(MediaFormat::from_magic_bytes(&[]), None);
    }

    #[test]
    fn test_sniff_ignores_mismatched_kind() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(MediaFormat::sniff(MediaKind::Image, &png), Some(MediaFormat::Png));
        assert_eq!(MediaFormat::sniff(MediaKind::Audio, &png), None);
    }

    #[test]
    fn test_key_shape() {
        let keys = KeyGenerator::new();
        let key = keys.next_key(MediaKind::Image, "jpg").unwrap();
        let key = key.as_str();

        let rest = key.strip_prefix("images/").unwrap();
        let (stamp, tail) = rest.split_once('_').unwrap();
        assert!(stamp.parse::<u64>().is_ok());
        let (suffix, ext) = tail.split_once('.').unwrap();
        assert_eq!(suffix.len(), KEY_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| KEY_SUFFIX_ALPHABET.contains(&b)));
        assert_eq!(ext, "jpg");
    }

    #[test]
    fn test_key_timestamps_strictly_increase() {
        let keys = KeyGenerator::new();
        let stamps: Vec<u64> = (0..1_000)
            .map(|_| {
                let key = keys.next_key(MediaKind::Audio, "m4a").unwrap();
                let rest = key.as_str().strip_prefix("audio/").unwrap().to_string();
                rest.split('_').next().unwrap().parse().unwrap()
            })
            .collect();

        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
        let unique: HashSet<_> = stamps.iter().collect();
        assert_eq!(unique.len(), stamps.len());
    }

    #[test]
    fn test_check_order() {
        let store = Arc::new(InMemoryBlobStore::default());
        let pipeline = MediaPipeline::new(store, 16);

        assert_eq!(pipeline.check(false, 100), Err(UploadError::Offline));
        assert_eq!(
            pipeline.check(true, 17),
            Err(UploadError::TooLarge { size: 17, max: 16 })
        );
        assert_eq!(pipeline.check(true, 0), Err(UploadError::EmptyPayload));
        assert_eq!(pipeline.check(true, 16), Ok(()));
    }

    #[tokio::test]
    async fn test_upload_success_uses_sniffed_type() {
        let store = Arc::new(InMemoryBlobStore::default());
        let pipeline = MediaPipeline::new(store.clone(), 1024);

        let png = Bytes::from_static(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3]);
        let uploaded = pipeline.upload(true, MediaKind::Image, png.clone()).await.unwrap();

        assert!(uploaded.key.as_str().starts_with("images/"));
        assert!(uploaded.key.as_str().ends_with(".png"));
        assert_eq!(uploaded.content_type, "image/png");
        assert_eq!(uploaded.size_bytes, png.len());
        assert!(uploaded.url.as_str().ends_with(uploaded.key.as_str()));
        assert_eq!(store.get(&uploaded.key), Some(png));
    }

    #[tokio::test]
    async fn test_upload_defaults_unknown_audio_to_m4a() {
        let store = Arc::new(InMemoryBlobStore::default());
        let pipeline = MediaPipeline::new(store.clone(), 1024);

        let uploaded = pipeline
            .upload(true, MediaKind::Audio, Bytes::from_static(b"raw pcm"))
            .await
            .unwrap();

        assert!(uploaded.key.as_str().starts_with("audio/"));
        assert!(uploaded.key.as_str().ends_with(".m4a"));
        assert_eq!(uploaded.content_type, "audio/mp4");
    }

    #[tokio::test]
    async fn test_offline_upload_touches_nothing() {
        let store = Arc::new(InMemoryBlobStore::default());
        let pipeline = MediaPipeline::new(store.clone(), 1024);

        let result = pipeline.upload(false, MediaKind::Image, Bytes::from_static(b"x")).await;
        assert_eq!(result, Err(UploadError::Offline));
        assert_eq!(store.object_count(), 0);
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_put_failure_keeps_sub_reason() {
        let store = Arc::new(InMemoryBlobStore::default());
        store.fail_puts_with(Some(BlobError::Unconfigured("no bucket".into())));
        let pipeline = MediaPipeline::new(store.clone(), 1024);

        let result = pipeline.upload(true, MediaKind::Image, Bytes::from_static(b"x")).await;
        match result {
            Err(UploadError::Rejected(e)) => assert_eq!(e.code(), "storage/no-default-bucket"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(store.object_count(), 0);
    }
}
