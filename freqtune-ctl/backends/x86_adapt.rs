//! x86_adapt kernel driver backend (core + uncore)
//!
//! The driver exposes one character device per CPU and per node under
//! `/dev/x86_adapt`, plus a `definitions` listing per kind naming the
//! configuration items it understands on this machine. Items are addressed
//! by index; reads and writes are 8-byte values at `index * 8`.
//!
//! Both device classes share the one driver handle: the client lives in a
//! `FacetSession` and is dropped when the last facet releases.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use freqtune_raw::ratio::RATIO_UNIT_HZ;

use crate::backend::{Device, DeviceClass, DeviceRepr, FreqBackend, FreqRange, FreqReader, Setting, SettingRepr};
use crate::error::{FreqError, Result};
use crate::session::FacetSession;

const DEVICE_ROOT: &str = "/dev/x86_adapt";

static SESSION: FacetSession<X86AdaptClient> = FacetSession::new();

#[derive(Debug, Clone, Copy)]
enum ItemKind {
    Cpu,
    Node,
}

impl ItemKind {
    fn dir(self) -> &'static str {
        match self {
            ItemKind::Cpu => "cpu",
            ItemKind::Node => "node",
        }
    }
}

struct X86AdaptClient {
    root: PathBuf,
}

impl X86AdaptClient {
    fn connect() -> Result<Self> {
        let root = PathBuf::from(DEVICE_ROOT);
        std::fs::metadata(&root).map_err(|e| FreqError::from_io(DEVICE_ROOT, e))?;
        tracing::debug!("x86_adapt driver present at {DEVICE_ROOT}");
        Ok(Self { root })
    }

    /// Index of a named configuration item, from the kind's `definitions`
    /// listing.
    fn lookup_item(&self, kind: ItemKind, name: &str) -> Result<u64> {
        let path = self.root.join(kind.dir()).join("definitions");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| FreqError::from_io(path.display().to_string(), e))?;

        find_item(&text, name).ok_or_else(|| {
            FreqError::Unsupported(format!(
                "x86_adapt item {name} not offered by this machine"
            ))
        })
    }

    fn device_count(&self, kind: ItemKind) -> Result<u32> {
        let dir = self.root.join(kind.dir());
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| FreqError::from_io(dir.display().to_string(), e))?;

        let mut max: Option<u32> = None;
        for entry in entries.flatten() {
            if let Some(index) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                max = Some(max.map_or(index, |m: u32| m.max(index)));
            }
        }
        max.map(|m| m + 1).ok_or_else(|| FreqError::NotFound {
            path: dir.join("0").display().to_string(),
        })
    }

    fn open_device(&self, kind: ItemKind, index: u32) -> Result<File> {
        let path = self.root.join(kind.dir()).join(index.to_string());
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FreqError::from_io(path.display().to_string(), e))
    }

    fn get(&self, file: &File, item: u64) -> Result<u64> {
        let mut buffer = [0u8; 8];
        file.read_exact_at(&mut buffer, item * 8)
            .map_err(|e| FreqError::from_io(format!("{DEVICE_ROOT} item {item}"), e))?;
        Ok(u64::from_le_bytes(buffer))
    }

    fn set(&self, file: &File, item: u64, value: u64) -> Result<()> {
        file.write_all_at(&value.to_le_bytes(), item * 8)
            .map_err(|e| FreqError::from_io(format!("{DEVICE_ROOT} item {item}"), e))
    }
}

/// `definitions` lines are `<index> <name> <description...>`; malformed
/// lines are skipped.
fn find_item(definitions: &str, name: &str) -> Option<u64> {
    definitions.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let index: u64 = fields.next()?.parse().ok()?;
        (fields.next() == Some(name)).then_some(index)
    })
}

pub(crate) fn init_core() -> Result<Box<dyn FreqBackend>> {
    SESSION.acquire(DeviceClass::Core, X86AdaptClient::connect)?;

    let looked_up = SESSION.with(|client| -> Result<_> {
        let set_item = client.lookup_item(ItemKind::Cpu, "Intel_Target_PState")?;
        let get_item = client.lookup_item(ItemKind::Cpu, "Intel_Current_PState")?;
        let count = client.device_count(ItemKind::Cpu)?;
        Ok((set_item, get_item, count))
    })?;

    match looked_up {
        Ok((set_item, get_item, count)) => Ok(Box::new(X86AdaptCore {
            set_item,
            get_item,
            count,
        })),
        Err(e) => {
            // the other facet may still hold the driver
            SESSION.release(DeviceClass::Core);
            Err(e)
        }
    }
}

pub(crate) fn init_uncore() -> Result<Box<dyn FreqBackend>> {
    SESSION.acquire(DeviceClass::Uncore, X86AdaptClient::connect)?;

    let looked_up = SESSION.with(|client| -> Result<_> {
        let low_item = client.lookup_item(ItemKind::Node, "Intel_UNCORE_MIN_RATIO")?;
        let high_item = client.lookup_item(ItemKind::Node, "Intel_UNCORE_MAX_RATIO")?;
        let count = client.device_count(ItemKind::Node)?;
        Ok((low_item, high_item, count))
    })?;

    match looked_up {
        Ok((low_item, high_item, count)) => Ok(Box::new(X86AdaptUncore {
            low_item,
            high_item,
            count,
        })),
        Err(e) => {
            SESSION.release(DeviceClass::Uncore);
            Err(e)
        }
    }
}

fn ratio_setting(target_hz: i64) -> Result<Setting> {
    let ratio = target_hz / RATIO_UNIT_HZ;
    if ratio < 1 || ratio > 0x7F {
        return Err(FreqError::InvalidArgument(format!(
            "{target_hz} Hz is outside the encodable ratio range"
        )));
    }
    Ok(Setting::new(target_hz, SettingRepr::Ratio(ratio as u64)))
}

fn ratio_of(setting: &Setting) -> Result<u64> {
    match setting.repr {
        SettingRepr::Ratio(ratio) => Ok(ratio),
        _ => Err(FreqError::InvalidArgument(
            "setting was prepared by a different backend".into(),
        )),
    }
}

fn device_file(dev: &Device) -> Result<&File> {
    match &dev.repr {
        DeviceRepr::X86Adapt { file } => Ok(file),
        _ => Err(FreqError::InvalidArgument(
            "device was opened by a different backend".into(),
        )),
    }
}

struct X86AdaptCore {
    set_item: u64,
    get_item: u64,
    count: u32,
}

impl FreqBackend for X86AdaptCore {
    fn name(&self) -> &'static str {
        "x86_adapt"
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
        let file = SESSION.with(|client| client.open_device(ItemKind::Cpu, index))??;
        Ok(Device::new(index, DeviceRepr::X86Adapt { file }))
    }

    fn prepare_setting(&self, target_hz: i64, _turbo: bool) -> Result<Setting> {
        ratio_setting(target_hz)
    }

    fn set_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let ratio = ratio_of(setting)?;
        let file = device_file(dev)?;
        SESSION.with(|client| client.set(file, self.set_item, ratio))?
    }

    fn reader(&self) -> Option<&dyn FreqReader> {
        Some(self)
    }
}

impl FreqReader for X86AdaptCore {
    fn get_frequency(&self, dev: &mut Device) -> Result<i64> {
        let file = device_file(dev)?;
        let value = SESSION.with(|client| client.get(file, self.get_item))??;
        // current P-state lives in bits 15:8
        Ok(((value >> 8) & 0xFF) as i64 * RATIO_UNIT_HZ)
    }
}

impl Drop for X86AdaptCore {
    fn drop(&mut self) {
        SESSION.release(DeviceClass::Core);
    }
}

struct X86AdaptUncore {
    low_item: u64,
    high_item: u64,
    count: u32,
}

impl FreqBackend for X86AdaptUncore {
    fn name(&self) -> &'static str {
        "x86_adapt"
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
        let file = SESSION.with(|client| client.open_device(ItemKind::Node, index))??;
        Ok(Device::new(index, DeviceRepr::X86Adapt { file }))
    }

    fn prepare_setting(&self, target_hz: i64, _turbo: bool) -> Result<Setting> {
        ratio_setting(target_hz)
    }

    /// Pin the window: both bounds to the same ratio.
    fn set_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let ratio = ratio_of(setting)?;
        let file = device_file(dev)?;
        SESSION.with(|client| {
            client.set(file, self.low_item, ratio)?;
            client.set(file, self.high_item, ratio)
        })?
    }

    fn reader(&self) -> Option<&dyn FreqReader> {
        Some(self)
    }

    fn range(&self) -> Option<&dyn FreqRange> {
        Some(self)
    }
}

impl FreqReader for X86AdaptUncore {
    fn get_frequency(&self, dev: &mut Device) -> Result<i64> {
        let file = device_file(dev)?;
        let value = SESSION.with(|client| client.get(file, self.high_item))??;
        Ok(value as i64 * RATIO_UNIT_HZ)
    }
}

impl FreqRange for X86AdaptUncore {
    fn get_min_frequency(&self, dev: &mut Device) -> Result<i64> {
        let file = device_file(dev)?;
        let value = SESSION.with(|client| client.get(file, self.low_item))??;
        Ok(value as i64 * RATIO_UNIT_HZ)
    }

    fn set_min_frequency(&self, dev: &mut Device, setting: &Setting) -> Result<()> {
        let ratio = ratio_of(setting)?;
        let file = device_file(dev)?;
        SESSION.with(|client| client.set(file, self.low_item, ratio))?
    }
}

impl Drop for X86AdaptUncore {
    fn drop(&mut self) {
        SESSION.release(DeviceClass::Uncore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS: &str = "\
0 Intel_Target_PState writable target performance state
1 Intel_Current_PState current performance state
2 Intel_UNCORE_MIN_RATIO lower uncore ratio bound
3 Intel_UNCORE_MAX_RATIO upper uncore ratio bound
";

    #[test]
    fn test_find_item() {
        assert_eq!(find_item(DEFINITIONS, "Intel_Target_PState"), Some(0));
        assert_eq!(find_item(DEFINITIONS, "Intel_UNCORE_MAX_RATIO"), Some(3));
        assert_eq!(find_item(DEFINITIONS, "Intel_Turbo_Limit"), None);
    }

    #[test]
    fn test_find_item_skips_malformed_lines() {
        let text = "garbage\n5 Intel_Target_PState\n";
        assert_eq!(find_item(text, "Intel_Target_PState"), Some(5));
        assert_eq!(find_item("", "Intel_Target_PState"), None);
    }

    #[test]
    fn test_ratio_setting_truncates() {
        let s = ratio_setting(2_250_000_000).unwrap();
        assert_eq!(s.repr, SettingRepr::Ratio(22));
    }

    #[test]
    fn test_ratio_setting_bounds() {
        assert!(ratio_setting(50_000_000).is_err());
        assert!(ratio_setting(13_000_000_000).is_err());
        assert!(ratio_setting(1_200_000_000).is_ok());
    }

    #[test]
    fn test_foreign_setting_rejected() {
        let foreign = Setting::new(1_000_000_000, SettingRepr::Khz("1000000".into()));
        assert!(matches!(
            ratio_of(&foreign),
            Err(FreqError::InvalidArgument(_))
        ));
    }
}
