//! Direct MSR backend (core + uncore)
//!
//! Writes the frequency-control registers through `/dev/cpu/<n>/msr` (or the
//! `msr-safe` allowlist device). Register encodings are model-specific, so
//! init gates on the CPUID vendor and model whitelist; anything unlisted is
//! Unsupported and discovery moves on. The interface is write-only: the
//! devices are opened for setting frequencies, not auditing them.

use std::path::Path;

use nix::unistd::{access, AccessFlags};

use freqtune_raw::cpuid::{self, CpuVendor};
use freqtune_raw::msr::{msr_path, msr_safe_path, MsrFile};
use freqtune_raw::ratio::{
    PerfCtl, RegisterLayout, UncoreRatioLimit, IA32_PERF_CTL, UNCORE_RATIO_LIMIT,
};

use crate::backend::{Device, DeviceRepr, FreqBackend, Setting, SettingRepr};
use crate::error::{FreqError, Result};
use crate::topology;

/// Intel family-6 models with the classic `IA32_PERF_CTL` ratio encoding
/// (Sandy Bridge through Skylake client).
const INTEL_CORE_MODELS: &[u32] = &[
    0x2A, 0x2D, // Sandy Bridge
    0x3A, 0x3E, // Ivy Bridge
    0x3C, 0x45, 0x46, 0x3F, // Haswell
    0x3D, 0x47, 0x56, 0x4F, // Broadwell
    0x4E, 0x5E, // Skylake
];

/// Intel family-6 models with the 0x620 uncore ratio window.
const INTEL_UNCORE_MODELS: &[u32] = &[
    0x3C, 0x45, 0x46, 0x3F, // Haswell
    0x3D, 0x47, 0x56, 0x4F, // Broadwell
    0x4E, 0x5E, // Skylake
];

pub(crate) fn init_core() -> Result<Box<dyn FreqBackend>> {
    let count = accessible_cpu_count()?;
    let ida_disengage = core_support()?;
    tracing::debug!(
        "msr backend: {count} CPUs accessible, turbo-disengage {}",
        if ida_disengage { "usable" } else { "absent" }
    );
    Ok(Box::new(MsrCoreBackend {
        count,
        ida_disengage,
    }))
}

pub(crate) fn init_uncore() -> Result<Box<dyn FreqBackend>> {
    accessible_cpu_count()?;
    uncore_support()?;
    let count = topology::node_count()?;
    Ok(Box::new(MsrUncoreBackend { count }))
}

/// Whether this model takes the PERF_CTL encoding, and if so whether the
/// turbo-disengage bit is implemented (Intel yes, AMD family 15h no).
fn core_support() -> Result<bool> {
    let sig = cpuid::signature();
    match cpuid::vendor() {
        CpuVendor::Intel => {
            if sig.family == 0x6 && INTEL_CORE_MODELS.contains(&sig.model) {
                Ok(true)
            } else {
                Err(FreqError::Unsupported(format!(
                    "no PERF_CTL recipe for Intel {sig}"
                )))
            }
        }
        CpuVendor::Amd => {
            if sig.family == 0x15 {
                Ok(false)
            } else {
                Err(FreqError::Unsupported(format!(
                    "no PERF_CTL recipe for AMD {sig}"
                )))
            }
        }
        CpuVendor::Unknown => Err(FreqError::Unsupported("unknown CPU vendor".into())),
    }
}

fn uncore_support() -> Result<()> {
    let sig = cpuid::signature();
    if cpuid::vendor() == CpuVendor::Intel
        && sig.family == 0x6
        && INTEL_UNCORE_MODELS.contains(&sig.model)
    {
        Ok(())
    } else {
        Err(FreqError::Unsupported(format!(
            "no uncore ratio window for {sig}"
        )))
    }
}

/// Count CPUs whose MSR device (stock or msr-safe) is writable.
///
/// None writable means the module is missing or we lack privileges; the
/// distinction comes from the per-device open later, so a plain permission
/// error is reported here.
fn accessible_cpu_count() -> Result<u32> {
    let dir = Path::new("/dev/cpu");
    let entries =
        std::fs::read_dir(dir).map_err(|e| FreqError::from_io(dir.display().to_string(), e))?;

    let mut max: Option<u32> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(cpu) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let writable = access(msr_path(cpu).as_str(), AccessFlags::W_OK).is_ok()
            || access(msr_safe_path(cpu).as_str(), AccessFlags::W_OK).is_ok();
        if writable {
            max = Some(max.map_or(cpu, |m| m.max(cpu)));
        }
    }

    match max {
        Some(max) => Ok(max + 1),
        None => Err(FreqError::PermissionDenied {
            path: "/dev/cpu/*/msr".into(),
        }),
    }
}

struct MsrCoreBackend {
    count: u32,
    /// Model implements the PERF_CTL turbo-disengage bit.
    ida_disengage: bool,
}

impl FreqBackend for MsrCoreBackend {
    fn name(&self) -> &'static str {
        "msr"
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.count)
    }

    fn open_device(&self, index: u32) -> Result<Device> {
        if index >= self.count {
            return Err(FreqError::OutOfRange {
                index,
                count: self.count,
            });
        }
        let msr = MsrFile::open(index)?;
        Ok(Device::new(index, DeviceRepr::Msr(msr)))
    }

    fn prepare_setting(&self, target_hz: i64, turbo: bool) -> Result<Setting> {
        let ctl = PerfCtl::for_target(target_hz, !turbo && self.ida_disengage);
        ctl.validate()
            .map_err(|reason| FreqError::InvalidArgument(format!("{target_hz} Hz: {reason}")))?;
        Ok(Setting::new(target_hz, SettingRepr::PerfCtl(ctl.to_msr_value())))
    }

    fn set_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let SettingRepr::PerfCtl(value) = setting.repr else {
            return Err(FreqError::InvalidArgument(
                "setting was prepared by a different backend".into(),
            ));
        };
        let DeviceRepr::Msr(msr) = &dev.repr else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };
        msr.write(IA32_PERF_CTL, value)?;
        Ok(())
    }
}

struct MsrUncoreBackend {
    count: u32,
}

impl FreqBackend for MsrUncoreBackend {
    fn name(&self) -> &'static str {
        "msr"
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.count)
    }

    /// Uncore registers are per package; reach them through the node's first
    /// CPU.
    fn open_device(&self, index: u32) -> Result<Device> {
        if index >= self.count {
            return Err(FreqError::OutOfRange {
                index,
                count: self.count,
            });
        }
        let cpu = topology::node_first_cpu(index)?;
        let msr = MsrFile::open(cpu)?;
        Ok(Device::new(index, DeviceRepr::Msr(msr)))
    }

    fn prepare_setting(&self, target_hz: i64, _turbo: bool) -> Result<Setting> {
        let limit = UncoreRatioLimit::pinned(target_hz);
        limit
            .validate()
            .map_err(|reason| FreqError::InvalidArgument(format!("{target_hz} Hz: {reason}")))?;
        Ok(Setting::new(
            target_hz,
            SettingRepr::UncoreRatio(limit.to_msr_value()),
        ))
    }

    fn set_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let SettingRepr::UncoreRatio(value) = setting.repr else {
            return Err(FreqError::InvalidArgument(
                "setting was prepared by a different backend".into(),
            ));
        };
        let DeviceRepr::Msr(msr) = &dev.repr else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };
        msr.write(UNCORE_RATIO_LIMIT, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_backend() -> MsrCoreBackend {
        MsrCoreBackend {
            count: 8,
            ida_disengage: true,
        }
    }

    #[test]
    fn test_core_prepare_packs_ratio() {
        let s = core_backend().prepare_setting(2_400_000_000, true).unwrap();
        assert_eq!(s.repr, SettingRepr::PerfCtl(24 << 8));
    }

    #[test]
    fn test_core_prepare_disengages_turbo_when_asked_off() {
        let s = core_backend().prepare_setting(2_400_000_000, false).unwrap();
        assert_eq!(s.repr, SettingRepr::PerfCtl((24 << 8) | (1 << 32)));
    }

    #[test]
    fn test_core_prepare_without_ida_ignores_turbo_hint() {
        let b = MsrCoreBackend {
            count: 8,
            ida_disengage: false,
        };
        let s = b.prepare_setting(2_400_000_000, false).unwrap();
        assert_eq!(s.repr, SettingRepr::PerfCtl(24 << 8));
    }

    #[test]
    fn test_core_prepare_rejects_sub_ratio_target() {
        // below one 100 MHz step: ratio would be zero
        let err = core_backend().prepare_setting(99_999_999, true).unwrap_err();
        assert!(matches!(err, FreqError::InvalidArgument(_)));
    }

    #[test]
    fn test_uncore_prepare_pins_both_bounds() {
        let b = MsrUncoreBackend { count: 2 };
        let s = b.prepare_setting(2_200_000_000, false).unwrap();
        assert_eq!(s.repr, SettingRepr::UncoreRatio(22 | (22 << 8)));
    }

    #[test]
    fn test_no_optional_capabilities() {
        // write-only backend: absence is expressed in the type, not by
        // operations that always fail
        let core = core_backend();
        assert!(core.reader().is_none());
        assert!(core.range().is_none());

        let uncore = MsrUncoreBackend { count: 2 };
        assert!(uncore.reader().is_none());
        assert!(uncore.range().is_none());
    }

    #[test]
    fn test_open_rejects_out_of_range_index() {
        let err = core_backend().open_device(64).unwrap_err();
        assert!(matches!(err, FreqError::OutOfRange { index: 64, count: 8 }));
    }

    #[test]
    fn test_prepare_release_cycles() {
        let b = core_backend();
        for _ in 0..1000 {
            let s = b.prepare_setting(3_000_000_000, true).unwrap();
            b.release_setting(s);
        }
    }
}
