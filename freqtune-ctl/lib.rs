//! Runtime discovery and uniform control of CPU/uncore frequency backends
//!
//! The machine decides which access mechanism works: `discover` walks a fixed
//! registry (cpufreq sysfs, the x86_adapt driver, raw MSR devices, an access
//! daemon) and hands back the first backend that initializes. Repeated calls
//! continue the sweep, so a caller can fall through to the next mechanism
//! when a backend turns out unusable at the device level.

pub mod backend;
mod backends;
pub mod discover;
pub mod error;
pub mod session;
pub mod topology;

pub use backend::{Device, DeviceClass, FreqBackend, FreqRange, FreqReader, Setting};
pub use discover::{Discovery, ProbeFailure};
pub use error::{FreqError, Result};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static GLOBAL_DISCOVERY: Lazy<Mutex<Discovery>> = Lazy::new(|| Mutex::new(Discovery::new()));

/// Next usable backend for a device class, from the process-wide engine.
///
/// Applies the `FREQTUNE_CORE_BACKEND`/`FREQTUNE_UNCORE_BACKEND` name filter.
/// Returns `None` once a sweep is exhausted; the following call restarts
/// from the first registry entry. Library users who want their own cursors
/// construct a [`Discovery`] instead.
pub fn discover(class: DeviceClass) -> Option<Box<dyn FreqBackend>> {
    GLOBAL_DISCOVERY.lock().next_from_env(class)
}
