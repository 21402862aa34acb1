// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The pipeline-provided module host.

use castflow_core::module::{Host, LogLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Repeat {
    last: String,
    count: u64,
}

/// Host backing every module owned by a pipeline: `tracing`-based logging
/// with duplicate suppression, the active flag, and the stop token honored
/// by `exit_sync`.
pub struct ModuleHost {
    name: String,
    active: AtomicBool,
    stop: CancellationToken,
    repeat: Mutex<Repeat>,
}

impl ModuleHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: AtomicBool::new(false),
            stop: CancellationToken::new(),
            repeat: Mutex::new(Repeat { last: String::new(), count: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the module to stop at the next opportunity.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    fn emit(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Error => tracing::error!(module = %self.name, "{msg}"),
            LogLevel::Warning => tracing::warn!(module = %self.name, "{msg}"),
            LogLevel::Info => tracing::info!(module = %self.name, "{msg}"),
            LogLevel::Debug => tracing::debug!(module = %self.name, "{msg}"),
            LogLevel::Quiet => {},
        }
    }
}

impl Host for ModuleHost {
    fn log(&self, level: LogLevel, msg: &str) {
        // identical consecutive messages are counted, not repeated
        let repeated = {
            let mut rep = self.repeat.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if rep.last == msg {
                rep.count += 1;
                Some(rep.count)
            } else {
                let prior = std::mem::take(&mut rep.count);
                rep.last = msg.to_string();
                if prior > 0 {
                    tracing::debug!(module = %self.name, "last message repeated {prior} more times");
                }
                None
            }
        };
        if repeated.is_none() {
            self.emit(level, msg);
        }
    }

    fn activate(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_is_observable() {
        let host = ModuleHost::new("source");
        assert!(!host.stop_requested());
        host.request_stop();
        assert!(host.stop_requested());
    }

    #[test]
    fn duplicate_log_suppression_resets_on_change() {
        let host = ModuleHost::new("m");
        host.log(LogLevel::Info, "same");
        host.log(LogLevel::Info, "same");
        host.log(LogLevel::Info, "same");
        host.log(LogLevel::Info, "different");
        let rep = host.repeat.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(rep.last, "different");
        assert_eq!(rep.count, 0);
    }
}
