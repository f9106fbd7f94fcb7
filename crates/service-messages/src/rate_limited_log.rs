// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{Level, debug, error, info, trace, warn};

struct Window {
    started_at: Instant,
    suppressed: u64,
}

/// Emits at most one log line per key and window.
///
/// Lines which are suppressed within a window are counted; the count is attached to the next
/// line emitted for the same key.
pub struct RateLimitedLogger {
    window: Duration,
    max_keys: usize,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimitedLogger {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            window,
            max_keys,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn warn(&self, key: &str, message: impl Display) -> bool {
        self.log(Level::WARN, key, message)
    }

    pub fn info(&self, key: &str, message: impl Display) -> bool {
        self.log(Level::INFO, key, message)
    }

    /// Logs `message` unless a line with the same `key` was emitted within the current window.
    /// Returns whether the line was emitted.
    pub fn log(&self, level: Level, key: &str, message: impl Display) -> bool {
        let Some(suppressed) = self.admit(key) else {
            return false;
        };
        log_message(level, key, suppressed, &message);
        true
    }

    /// Number of lines suppressed for `key` since its last emitted line.
    pub fn suppressed(&self, key: &str) -> u64 {
        self.windows
            .lock()
            .get(key)
            .map(|window| window.suppressed)
            .unwrap_or_default()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Returns the number of previously suppressed lines if a line for `key` may be emitted now.
    fn admit(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if let Some(window) = windows.get_mut(key) {
            if now.saturating_duration_since(window.started_at) < self.window {
                window.suppressed += 1;
                return None;
            }
            window.started_at = now;
            return Some(std::mem::take(&mut window.suppressed));
        }

        if windows.len() >= self.max_keys {
            let period = self.window;
            windows.retain(|_, window| now.saturating_duration_since(window.started_at) < period);
        }

        if windows.len() >= self.max_keys {
            // no room to track the key, emit untracked
            return Some(0);
        }

        windows.insert(
            key.to_owned(),
            Window {
                started_at: now,
                suppressed: 0,
            },
        );
        Some(0)
    }
}

fn log_message(level: Level, key: &str, suppressed: u64, message: &dyn Display) {
    match level {
        Level::ERROR => error!(key, suppressed, "{message}"),
        Level::WARN => warn!(key, suppressed, "{message}"),
        Level::INFO => info!(key, suppressed, "{message}"),
        Level::DEBUG => debug!(key, suppressed, "{message}"),
        Level::TRACE => trace!(key, suppressed, "{message}"),
    }
}
