//! # freqtune-raw
//!
//! Low-level primitives for CPU and uncore frequency control on Linux.
//!
//! This crate provides the hardware-facing pieces shared by the higher-level
//! backends in `freqtune`: MSR device access through `/dev/cpu/*/msr` (with
//! `msr-safe` fallback), CPUID vendor/signature decoding, and type-safe
//! layouts for the frequency-control registers.
//!
//! ## Usage
//!
//! ```ignore
//! use freqtune_raw::msr::MsrFile;
//! use freqtune_raw::ratio::{PerfCtl, RegisterLayout, IA32_PERF_CTL};
//!
//! let ctl = PerfCtl::for_target(2_400_000_000, false);
//! ctl.validate()?;
//!
//! let dev = MsrFile::open(0)?;
//! dev.write(IA32_PERF_CTL, ctl.to_msr_value())?;
//! ```

pub mod cpuid;
pub mod msr;
pub mod ratio;

// Re-export for convenience
pub use msr::{MsrError, MsrFile};
pub use ratio::{PerfCtl, RegisterLayout, UncoreRatioLimit, RATIO_UNIT_HZ};
