use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use narration_core::{EmotionalDirective, RawAudio};
use sha2::{Digest, Sha256};

/// LRU of synthesized audio so a repeated segment is not billed twice.
pub struct ResponseCache {
    inner: Mutex<LruCache<String, RawAudio>>,
}

impl ResponseCache {
    /// `None` for a zero capacity.
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|cap| Self {
            inner: Mutex::new(LruCache::new(cap)),
        })
    }

    pub fn key(voice: &str, text: &str, directive: &EmotionalDirective) -> String {
        let mut hasher = Sha256::new();
        hasher.update(voice.as_bytes());
        hasher.update([0]);
        hasher.update(text.as_bytes());
        hasher.update([0]);
        hasher.update(directive.style.as_bytes());
        hasher.update([0]);
        hasher.update(directive.pacing.as_bytes());
        hasher.update([0]);
        hasher.update(directive.breathing.as_bytes());
        hasher.update(directive.arc_position.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<RawAudio> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: String, audio: RawAudio) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, audio);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
