//! Register layouts for the frequency-control MSRs
//!
//! Core and uncore targets are expressed as P-state ratios in multiples of
//! the 100 MHz bus reference clock.

/// Core frequency target (per logical CPU)
pub const IA32_PERF_CTL: u64 = 0x199;
/// Core frequency status (read side of `IA32_PERF_CTL`)
pub const IA32_PERF_STATUS: u64 = 0x198;
/// Uncore frequency window (per package)
pub const UNCORE_RATIO_LIMIT: u64 = 0x620;

/// One ratio step in Hz (100 MHz reference clock)
pub const RATIO_UNIT_HZ: i64 = 100_000_000;

/// Trait for register layouts that convert to/from raw MSR values
pub trait RegisterLayout: Sized {
    /// Convert this layout to a raw MSR value
    fn to_msr_value(&self) -> u64;

    /// Parse a raw MSR value into this layout
    fn from_msr_value(value: u64) -> Self;

    /// Validate that the field values are encodable
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// `IA32_PERF_CTL` layout
///
/// Bits 15:8 carry the target ratio; bit 32 disengages turbo (IDA) on models
/// that implement it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCtl {
    pub ratio: u8,
    pub turbo_disengage: bool,
}

impl PerfCtl {
    /// Build a target for a frequency in Hz (truncating to the ratio grid).
    ///
    /// Out-of-range targets saturate into values `validate` rejects instead
    /// of wrapping into plausible ratios.
    pub fn for_target(target_hz: i64, turbo_disengage: bool) -> Self {
        Self {
            ratio: (target_hz / RATIO_UNIT_HZ).clamp(0, 0xFF) as u8,
            turbo_disengage,
        }
    }

    pub fn frequency_hz(&self) -> i64 {
        self.ratio as i64 * RATIO_UNIT_HZ
    }
}

impl RegisterLayout for PerfCtl {
    fn to_msr_value(&self) -> u64 {
        ((self.ratio as u64) << 8) | ((self.turbo_disengage as u64) << 32)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            ratio: ((value >> 8) & 0xFF) as u8,
            turbo_disengage: (value >> 32) & 1 != 0,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.ratio == 0 {
            return Err("target ratio is zero");
        }
        if self.ratio > 0x7F {
            return Err("target ratio exceeds 7 bits");
        }
        Ok(())
    }
}

/// `UNCORE_RATIO_LIMIT` layout
///
/// Bits 6:0 carry the maximum ratio, bits 14:8 the minimum ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UncoreRatioLimit {
    pub max_ratio: u8,
    pub min_ratio: u8,
}

impl UncoreRatioLimit {
    /// Pin the uncore window to one frequency in Hz (truncating).
    pub fn pinned(target_hz: i64) -> Self {
        let ratio = (target_hz / RATIO_UNIT_HZ).clamp(0, 0xFF) as u8;
        Self {
            max_ratio: ratio,
            min_ratio: ratio,
        }
    }

    pub fn max_hz(&self) -> i64 {
        self.max_ratio as i64 * RATIO_UNIT_HZ
    }

    pub fn min_hz(&self) -> i64 {
        self.min_ratio as i64 * RATIO_UNIT_HZ
    }
}

impl RegisterLayout for UncoreRatioLimit {
    fn to_msr_value(&self) -> u64 {
        (self.max_ratio as u64) | ((self.min_ratio as u64) << 8)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            max_ratio: (value & 0x7F) as u8,
            min_ratio: ((value >> 8) & 0x7F) as u8,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.max_ratio == 0 {
            return Err("maximum ratio is zero");
        }
        if self.max_ratio > 0x7F || self.min_ratio > 0x7F {
            return Err("ratio exceeds 7 bits");
        }
        if self.min_ratio > self.max_ratio {
            return Err("minimum ratio above maximum");
        }
        Ok(())
    }
}
