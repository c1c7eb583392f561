//! cpufreq sysfs backend (core frequency only)
//!
//! Drives `scaling_setspeed`, which the kernel only honors under the
//! userspace governor; opening a device checks the governor first so the
//! caller gets a readiness error instead of silently ineffective writes.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::backend::{Device, DeviceRepr, FreqBackend, FreqRange, FreqReader, Setting, SettingRepr};
use crate::error::{FreqError, Result};
use crate::topology;

pub(crate) fn init_core() -> Result<Box<dyn FreqBackend>> {
    let root = topology::sysfs_root()?;
    let cpu_root = root.join("devices/system/cpu");

    // cpufreq subsystem present at all?
    let cpufreq = cpu_root.join("cpufreq");
    std::fs::read_dir(&cpufreq)
        .map_err(|e| FreqError::from_io(cpufreq.display().to_string(), e))?;

    tracing::debug!("cpufreq sysfs found under {}", cpu_root.display());
    Ok(Box::new(SysfsBackend {
        cpu_root,
        count: OnceCell::new(),
    }))
}

struct SysfsBackend {
    cpu_root: PathBuf,
    count: OnceCell<u32>,
}

impl SysfsBackend {
    fn cpufreq_dir(&self, cpu: u32) -> PathBuf {
        self.cpu_root.join(format!("cpu{cpu}/cpufreq"))
    }

    /// cpufreq files hold decimal kHz.
    fn read_khz_file(path: &Path) -> Result<i64> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FreqError::from_io(path.display().to_string(), e))?;
        let khz: i64 = text.trim().parse().map_err(|_| {
            FreqError::InvalidArgument(format!(
                "malformed frequency {:?} in {}",
                text.trim(),
                path.display()
            ))
        })?;
        Ok(khz * 1000)
    }

    fn khz_string(setting: &Setting) -> Result<&str> {
        match &setting.repr {
            SettingRepr::Khz(s) => Ok(s),
            _ => Err(FreqError::InvalidArgument(
                "setting was prepared by a different backend".into(),
            )),
        }
    }
}

impl FreqBackend for SysfsBackend {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn device_count(&self) -> Result<u32> {
        self.count
            .get_or_try_init(|| topology::cpu_count())
            .copied()
    }

    fn open_device(&self, index: u32) -> Result<Device> {
        let dir = self.cpufreq_dir(index);

        let governor_path = dir.join("scaling_governor");
        let governor = std::fs::read_to_string(&governor_path)
            .map_err(|e| FreqError::from_io(governor_path.display().to_string(), e))?;
        if governor.trim() != "userspace" {
            return Err(FreqError::NotReady(format!(
                "cpu{index}: scaling governor is {:?}, need \"userspace\"",
                governor.trim()
            )));
        }

        let setspeed_path = dir.join("scaling_setspeed");
        let setspeed = OpenOptions::new()
            .write(true)
            .open(&setspeed_path)
            .map_err(|e| FreqError::from_io(setspeed_path.display().to_string(), e))?;

        Ok(Device::new(
            index,
            DeviceRepr::Sysfs {
                setspeed,
                cpufreq_dir: dir,
            },
        ))
    }

    fn prepare_setting(&self, target_hz: i64, _turbo: bool) -> Result<Setting> {
        if target_hz < 1000 {
            return Err(FreqError::InvalidArgument(format!(
                "target {target_hz} Hz is below the kHz granularity"
            )));
        }
        // truncates toward zero, like the kernel's own kHz representation
        let khz = target_hz / 1000;
        Ok(Setting::new(target_hz, SettingRepr::Khz(khz.to_string())))
    }

    fn set_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let khz = Self::khz_string(setting)?;
        let DeviceRepr::Sysfs {
            setspeed,
            cpufreq_dir,
        } = &dev.repr
        else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };

        setspeed.write_all_at(khz.as_bytes(), 0).map_err(|e| {
            FreqError::from_io(
                cpufreq_dir.join("scaling_setspeed").display().to_string(),
                e,
            )
        })?;
        tracing::debug!("cpu{}: setspeed {} kHz", dev.index(), khz);
        Ok(())
    }

    fn reader(&self) -> Option<&dyn FreqReader> {
        Some(self)
    }

    fn range(&self) -> Option<&dyn FreqRange> {
        Some(self)
    }
}

impl FreqReader for SysfsBackend {
    fn get_frequency(&self, dev: &mut Device) -> Result<i64> {
        let DeviceRepr::Sysfs { cpufreq_dir, .. } = &dev.repr else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };
        Self::read_khz_file(&cpufreq_dir.join("scaling_cur_freq"))
    }
}

impl FreqRange for SysfsBackend {
    fn get_min_frequency(&self, dev: &mut Device) -> Result<i64> {
        let DeviceRepr::Sysfs { cpufreq_dir, .. } = &dev.repr else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };
        Self::read_khz_file(&cpufreq_dir.join("scaling_min_freq"))
    }

    fn set_min_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let khz = Self::khz_string(setting)?;
        let DeviceRepr::Sysfs { cpufreq_dir, .. } = &dev.repr else {
            return Err(FreqError::InvalidArgument(
                "device was opened by a different backend".into(),
            ));
        };
        let path = cpufreq_dir.join("scaling_min_freq");
        std::fs::write(&path, khz.as_bytes())
            .map_err(|e| FreqError::from_io(path.display().to_string(), e))
    }
}
