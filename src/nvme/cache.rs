use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use crate::nvme::types::DeviceType;

pub const SUCCESS_TTL: Duration = Duration::from_secs(300);
pub const FAILURE_TTL: Duration = Duration::from_secs(30);

/// How many scrape cycles pass between sweeps of expired entries.
pub const SWEEP_INTERVAL_CYCLES: u64 = 10;

/// A cached detection outcome. Failures are only cached for recoverable
/// errors, under the short TTL, so transient faults do not hammer a device
/// every cycle while non-recoverable faults stay visible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachedDetection {
    Known(DeviceType),
    Failed,
}

struct CacheEntry {
    detection: CachedDetection,
    expires_at: Instant,
}

/// Detection results keyed by `(controller, namespace)`. Reads take the
/// shared guard; writes and expired-entry eviction take the exclusive guard.
pub struct TypeCache {
    entries: RwLock<HashMap<(u32, u32), CacheEntry>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the live entry for the key, treating an expired entry as a
    /// miss and evicting it on the way out.
    pub fn get(&self, controller: u32, namespace: u32) -> Option<CachedDetection> {
        let key = (controller, namespace);
        let now = Instant::now();

        {
            let entries = match self.entries.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match entries.get(&key) {
                Some(entry) if now < entry.expires_at => return Some(entry.detection),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries.get(&key) {
            if now < entry.expires_at {
                return Some(entry.detection);
            }
            entries.remove(&key);
        }
        None
    }

    pub fn set(&self, controller: u32, namespace: u32, detection: CachedDetection, ttl: Duration) {
        let entry = CacheEntry {
            detection,
            expires_at: Instant::now() + ttl,
        };
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert((controller, namespace), entry);
    }

    /// Drops every expired entry. Invoked on a scrape-count modulus so the
    /// map cannot accumulate entries for detached devices between lookups.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, entry| now < entry.expires_at);
    }

    pub fn len(&self) -> usize {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeCache {
    fn default() -> Self {
        Self::new()
    }
}
