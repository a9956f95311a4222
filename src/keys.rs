//! Rotating minute keys for cookie sealing.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::RngCore;
use rand_core::OsRng;

pub const MINUTE_KEY_SIZE: usize = 32;
pub type MinuteKey = [u8; MINUTE_KEY_SIZE];

/// Source of the symmetric keys that seal cookies.
pub trait CookieKeys: Send + Sync {
    /// The key new cookies are sealed under.
    fn current_key(&self) -> MinuteKey;

    /// Keys still accepted when opening a cookie; the head is the current
    /// key, the tail the not-yet-expired predecessors.
    fn recent_keys(&self) -> Vec<MinuteKey>;
}

/// Time-rotated minute keys. The current key plus `depth` predecessors stay
/// valid, so a cookie issued just before a rotation still opens. Rotation is
/// lazy: keys advance on access once the period has elapsed, and tests (or a
/// supervisor) can force it with [`MinuteKeys::rotate`].
pub struct MinuteKeys {
    period: Duration,
    depth: usize,
    state: Mutex<KeyState>,
}

struct KeyState {
    keys: Vec<MinuteKey>,
    rotated_at: Instant,
}

impl MinuteKeys {
    pub fn new(period: Duration) -> Self {
        Self::with_depth(period, 1)
    }

    pub fn with_depth(period: Duration, depth: usize) -> Self {
        Self {
            period,
            depth,
            state: Mutex::new(KeyState {
                keys: vec![gen_key()],
                rotated_at: Instant::now(),
            }),
        }
    }

    /// Retire the current key immediately.
    pub fn rotate(&self) {
        self.state.lock().unwrap().rotate(self.depth);
    }

    fn refreshed(&self) -> MutexGuard<'_, KeyState> {
        let mut state = self.state.lock().unwrap();
        while state.rotated_at.elapsed() >= self.period {
            state.rotated_at += self.period;
            state.rotate(self.depth);
        }
        state
    }
}

impl KeyState {
    fn rotate(&mut self, depth: usize) {
        self.keys.insert(0, gen_key());
        self.keys.truncate(depth + 1);
    }
}

impl CookieKeys for MinuteKeys {
    fn current_key(&self) -> MinuteKey {
        self.refreshed().keys[0]
    }

    fn recent_keys(&self) -> Vec<MinuteKey> {
        self.refreshed().keys.clone()
    }
}

fn gen_key() -> MinuteKey {
    let mut key = [0u8; MINUTE_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_the_previous_key() {
        let keys = MinuteKeys::new(Duration::from_secs(3600));
        let first = keys.current_key();

        keys.rotate();
        let recent = keys.recent_keys();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], keys.current_key());
        assert_eq!(recent[1], first);
        assert_ne!(recent[0], first);
    }

    #[test]
    fn old_keys_fall_off_the_tail() {
        let keys = MinuteKeys::new(Duration::from_secs(3600));
        let first = keys.current_key();

        keys.rotate();
        keys.rotate();
        assert!(!keys.recent_keys().contains(&first));
    }

    #[test]
    fn depth_bounds_the_window() {
        let keys = MinuteKeys::with_depth(Duration::from_secs(3600), 3);
        for _ in 0..10 {
            keys.rotate();
        }
        assert_eq!(keys.recent_keys().len(), 4);
    }
}
