//! Debug logging utilities for vmio.
//!
//! Set the `VMIO_DEBUG` environment variable to enable per-descriptor and
//! per-interrupt tracing:
//! - `VMIO_DEBUG=1` - Enable all categories
//! - `VMIO_DEBUG=queue` - Enable only virtqueue traces
//! - `VMIO_DEBUG=irq,transport` - Enable multiple categories
//!
//! The macros forward to `tracing::trace!`, so a subscriber still has to let
//! the `trace` level through.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Queue,
    Irq,
    Transport,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    queue: bool,
    irq: bool,
    transport: bool,
}

impl DebugConfig {
    fn parse(val: &str) -> Self {
        let val = val.to_lowercase();
        if val == "1" || val == "all" {
            return Self {
                queue: true,
                irq: true,
                transport: true,
            };
        }
        let mut config = Self::default();
        for part in val.split(',').map(str::trim) {
            match part {
                "queue" => config.queue = true,
                "irq" => config.irq = true,
                "transport" => config.transport = true,
                _ => {}
            }
        }
        config
    }

    fn from_env() -> Self {
        std::env::var("VMIO_DEBUG")
            .map(|val| Self::parse(&val))
            .unwrap_or_default()
    }

    fn enabled(&self, category: DebugCategory) -> bool {
        match category {
            DebugCategory::All => self.queue || self.irq || self.transport,
            DebugCategory::Queue => self.queue,
            DebugCategory::Irq => self.irq,
            DebugCategory::Transport => self.transport,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().enabled(category)
}

/// Trace macro for virtqueue traffic
#[macro_export]
macro_rules! debug_queue {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Queue) {
            tracing::trace!(target: "vmio::queue", $($arg)*);
        }
    };
}

/// Trace macro for interrupt line transitions
#[macro_export]
macro_rules! debug_irq {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Irq) {
            tracing::trace!(target: "vmio::irq", $($arg)*);
        }
    };
}

/// Trace macro for transport register accesses
#[macro_export]
macro_rules! debug_transport {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Transport) {
            tracing::trace!(target: "vmio::transport", $($arg)*);
        }
    };
}
