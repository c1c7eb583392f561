//! MSR (Model-Specific Register) device access
//!
//! Opens `/dev/cpu/<n>/msr`, falling back to the `msr-safe` allowlist device
//! when the stock device is not accessible. Values are 8-byte reads/writes at
//! the register address offset.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};

pub type Result<T> = std::result::Result<T, MsrError>;

/// Errors that can occur during MSR device operations
#[derive(Debug, thiserror::Error)]
pub enum MsrError {
    #[error("failed to open MSR device for CPU {cpu}: {source}")]
    OpenFailed { cpu: u32, source: std::io::Error },

    #[error("failed to read MSR 0x{msr:X} on CPU {cpu}: {source}")]
    ReadFailed {
        cpu: u32,
        msr: u64,
        source: std::io::Error,
    },

    #[error("failed to write MSR 0x{msr:X} on CPU {cpu}: {source}")]
    WriteFailed {
        cpu: u32,
        msr: u64,
        source: std::io::Error,
    },
}

pub fn msr_path(cpu: u32) -> String {
    format!("/dev/cpu/{cpu}/msr")
}

pub fn msr_safe_path(cpu: u32) -> String {
    format!("/dev/cpu/{cpu}/msr-safe")
}

/// An open per-CPU MSR device handle
///
/// The handle owns the file descriptor; dropping it closes the device.
#[derive(Debug)]
pub struct MsrFile {
    file: File,
    cpu: u32,
}

impl MsrFile {
    /// Open the MSR device of one CPU for reading and writing.
    ///
    /// Tries `/dev/cpu/<n>/msr` first, then `/dev/cpu/<n>/msr-safe`. Writes
    /// are synchronous so a frequency change is applied before the call
    /// returns.
    pub fn open(cpu: u32) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).custom_flags(libc::O_SYNC);

        let file = match options.open(msr_path(cpu)) {
            Ok(file) => file,
            Err(first) => options
                .open(msr_safe_path(cpu))
                .map_err(|_| MsrError::OpenFailed { cpu, source: first })?,
        };

        Ok(Self { file, cpu })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Read a 64-bit value from a register.
    pub fn read(&self, msr: u64) -> Result<u64> {
        let mut buffer = [0u8; 8];
        self.file
            .read_exact_at(&mut buffer, msr)
            .map_err(|e| MsrError::ReadFailed {
                cpu: self.cpu,
                msr,
                source: e,
            })?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Write a 64-bit value to a register.
    ///
    /// Writing incorrect values can destabilize the machine; callers validate
    /// register layouts before writing.
    pub fn write(&self, msr: u64, value: u64) -> Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), msr)
            .map_err(|e| MsrError::WriteFailed {
                cpu: self.cpu,
                msr,
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msr_error_display() {
        let err = MsrError::OpenFailed {
            cpu: 0,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("failed to open MSR device"));
    }

    #[test]
    fn test_paths() {
        assert_eq!(msr_path(3), "/dev/cpu/3/msr");
        assert_eq!(msr_safe_path(3), "/dev/cpu/3/msr-safe");
    }

}
