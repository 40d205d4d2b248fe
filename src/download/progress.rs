// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress event throttling.

/// Default minimum percent increase between progress events.
pub const DEFAULT_PERCENT_STEP: u8 = 1;

/// Default byte interval between progress events (1 MiB).
pub const DEFAULT_BYTE_STEP: u64 = 1024 * 1024;

/// Decides when a transfer should publish a progress event.
///
/// An event is due when the percentage rose by at least `percent_step` or at
/// least `byte_step` bytes were written since the last published event.
/// Published percentages never decrease.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    percent_step: u8,
    byte_step: u64,
    last_percent: Option<u8>,
    last_bytes: u64,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PERCENT_STEP, DEFAULT_BYTE_STEP)
    }
}

impl ProgressThrottle {
    pub fn new(percent_step: u8, byte_step: u64) -> Self {
        Self {
            percent_step: percent_step.max(1),
            byte_step: byte_step.max(1),
            last_percent: None,
            last_bytes: 0,
        }
    }

    /// Whether the given position should be published. Records it if so.
    pub fn should_publish(&mut self, percent: u8, bytes: u64) -> bool {
        let last_percent = self.last_percent.unwrap_or(0);
        let percent_due = percent >= last_percent.saturating_add(self.percent_step)
            && percent > last_percent;
        let bytes_due = bytes.saturating_sub(self.last_bytes) >= self.byte_step;

        if percent_due || bytes_due {
            self.last_percent = Some(percent.max(last_percent));
            self.last_bytes = bytes;
            true
        } else {
            false
        }
    }

    /// Last published percentage, if anything was published.
    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }
}
