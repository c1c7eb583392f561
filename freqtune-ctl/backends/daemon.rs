//! Access daemon backend (core + uncore)
//!
//! For setups where the process itself has no MSR privileges, a privileged
//! daemon applies register writes on our behalf. The wire protocol is a
//! magic/version handshake followed by fixed-size little-endian frames; the
//! daemon answers every request with an errno and a value.
//!
//! One connection serves both device classes; it lives in a `FacetSession`
//! and is closed when the last facet releases.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use freqtune_raw::ratio::{
    PerfCtl, RegisterLayout, UncoreRatioLimit, IA32_PERF_CTL, UNCORE_RATIO_LIMIT,
};

use crate::backend::{Device, DeviceClass, DeviceRepr, FreqBackend, Setting, SettingRepr};
use crate::error::{FreqError, Result};
use crate::session::FacetSession;
use crate::topology;

/// Environment variable overriding the daemon socket path
pub const ENV_SOCKET: &str = "FREQTUNE_DAEMON_SOCKET";
const DEFAULT_SOCKET: &str = "/var/run/freqd.sock";

const PROTOCOL_MAGIC: u32 = 0x4651_4431; // "FQD1"
const PROTOCOL_VERSION: u32 = 1;

#[allow(dead_code)] // reserved for read-back support
const OP_READ: u32 = 0;
const OP_WRITE: u32 = 1;
const OP_GOODBYE: u32 = 2;

static SESSION: FacetSession<DaemonConnection> = FacetSession::new();

/// One request frame: 20 bytes, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Request {
    op: u32,
    cpu: u32,
    register: u32,
    value: u64,
}

impl Request {
    fn encode(&self) -> [u8; 20] {
        let mut frame = [0u8; 20];
        frame[0..4].copy_from_slice(&self.op.to_le_bytes());
        frame[4..8].copy_from_slice(&self.cpu.to_le_bytes());
        frame[8..12].copy_from_slice(&self.register.to_le_bytes());
        frame[12..20].copy_from_slice(&self.value.to_le_bytes());
        frame
    }

    #[cfg(test)]
    fn decode(frame: &[u8; 20]) -> Self {
        Self {
            op: u32::from_le_bytes(frame[0..4].try_into().unwrap()),
            cpu: u32::from_le_bytes(frame[4..8].try_into().unwrap()),
            register: u32::from_le_bytes(frame[8..12].try_into().unwrap()),
            value: u64::from_le_bytes(frame[12..20].try_into().unwrap()),
        }
    }
}

/// One response frame: 12 bytes, little-endian
struct Response {
    errno: i32,
    value: u64,
}

impl Response {
    fn decode(frame: &[u8; 12]) -> Self {
        Self {
            errno: i32::from_le_bytes(frame[0..4].try_into().unwrap()),
            value: u64::from_le_bytes(frame[4..12].try_into().unwrap()),
        }
    }
}

fn socket_path() -> String {
    std::env::var(ENV_SOCKET).unwrap_or_else(|_| DEFAULT_SOCKET.into())
}

/// Map a daemon-side errno into the error taxonomy.
fn errno_error(errno: i32, register: u32) -> FreqError {
    match errno {
        libc::EACCES | libc::EPERM => FreqError::PermissionDenied {
            path: format!("daemon register 0x{register:X}"),
        },
        libc::ENOENT | libc::ENODEV => {
            FreqError::Unsupported(format!("daemon has no register 0x{register:X}"))
        }
        _ => FreqError::Daemon(format!("errno {errno} for register 0x{register:X}")),
    }
}

struct DaemonConnection {
    stream: UnixStream,
    path: String,
}

impl DaemonConnection {
    fn connect() -> Result<Self> {
        let path = socket_path();
        let mut stream =
            UnixStream::connect(&path).map_err(|e| FreqError::from_io(path.clone(), e))?;

        let mut hello = [0u8; 8];
        hello[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        hello[4..8].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        stream
            .write_all(&hello)
            .map_err(|e| FreqError::from_io(path.clone(), e))?;

        let mut ack = [0u8; 4];
        stream
            .read_exact(&mut ack)
            .map_err(|e| FreqError::from_io(path.clone(), e))?;
        if u32::from_le_bytes(ack) != PROTOCOL_MAGIC {
            return Err(FreqError::Daemon(format!(
                "unexpected handshake reply from {path}"
            )));
        }

        tracing::debug!("connected to access daemon at {path}");
        Ok(Self { stream, path })
    }

    fn transact(&mut self, request: Request) -> Result<u64> {
        self.stream
            .write_all(&request.encode())
            .map_err(|e| FreqError::from_io(self.path.clone(), e))?;

        let mut frame = [0u8; 12];
        self.stream
            .read_exact(&mut frame)
            .map_err(|e| FreqError::from_io(self.path.clone(), e))?;

        let response = Response::decode(&frame);
        if response.errno != 0 {
            return Err(errno_error(response.errno, request.register));
        }
        Ok(response.value)
    }

    fn write_msr(&mut self, cpu: u32, register: u64, value: u64) -> Result<()> {
        self.transact(Request {
            op: OP_WRITE,
            cpu,
            register: register as u32,
            value,
        })
        .map(|_| ())
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        // best effort; the daemon also handles abrupt disconnects
        let _ = self.stream.write_all(
            &Request {
                op: OP_GOODBYE,
                cpu: 0,
                register: 0,
                value: 0,
            }
            .encode(),
        );
    }
}

pub(crate) fn init_core() -> Result<Box<dyn FreqBackend>> {
    SESSION.acquire(DeviceClass::Core, DaemonConnection::connect)?;
    match topology::cpu_count() {
        Ok(count) => Ok(Box::new(DaemonCore { count })),
        Err(e) => {
            SESSION.release(DeviceClass::Core);
            Err(e)
        }
    }
}

pub(crate) fn init_uncore() -> Result<Box<dyn FreqBackend>> {
    SESSION.acquire(DeviceClass::Uncore, DaemonConnection::connect)?;
    match topology::node_count() {
        Ok(count) => Ok(Box::new(DaemonUncore { count })),
        Err(e) => {
            SESSION.release(DeviceClass::Uncore);
            Err(e)
        }
    }
}

fn device_cpu(dev: &Device) -> Result<u32> {
    match dev.repr {
        DeviceRepr::Daemon { cpu } => Ok(cpu),
        _ => Err(FreqError::InvalidArgument(
            "device was opened by a different backend".into(),
        )),
    }
}

struct DaemonCore {
    count: u32,
}

impl FreqBackend for DaemonCore {
    fn name(&self) -> &'static str {
        "daemon"
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
        // the daemon addresses devices by CPU number; nothing to open here
        Ok(Device::new(index, DeviceRepr::Daemon { cpu: index }))
    }

    fn prepare_setting(&self, target_hz: i64, _turbo: bool) -> Result<Setting> {
        let ctl = PerfCtl::for_target(target_hz, false);
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
        let cpu = device_cpu(dev)?;
        SESSION.with(|conn| conn.write_msr(cpu, IA32_PERF_CTL, value))?
    }
}

impl Drop for DaemonCore {
    fn drop(&mut self) {
        SESSION.release(DeviceClass::Core);
    }
}

struct DaemonUncore {
    count: u32,
}

impl FreqBackend for DaemonUncore {
    fn name(&self) -> &'static str {
        "daemon"
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
        let cpu = topology::node_first_cpu(index)?;
        Ok(Device::new(index, DeviceRepr::Daemon { cpu }))
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
        let cpu = device_cpu(dev)?;
        SESSION.with(|conn| conn.write_msr(cpu, UNCORE_RATIO_LIMIT, value))?
    }
}

impl Drop for DaemonUncore {
    fn drop(&mut self) {
        SESSION.release(DeviceClass::Uncore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_roundtrip() {
        let request = Request {
            op: OP_WRITE,
            cpu: 12,
            register: IA32_PERF_CTL as u32,
            value: 0x1800,
        };
        assert_eq!(Request::decode(&request.encode()), request);
    }

    #[test]
    fn test_response_decode() {
        let mut frame = [0u8; 12];
        frame[0..4].copy_from_slice(&0i32.to_le_bytes());
        frame[4..12].copy_from_slice(&0xDEADu64.to_le_bytes());
        let response = Response::decode(&frame);
        assert_eq!(response.errno, 0);
        assert_eq!(response.value, 0xDEAD);
    }

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            errno_error(libc::EPERM, 0x199),
            FreqError::PermissionDenied { .. }
        ));
        assert!(matches!(
            errno_error(libc::ENODEV, 0x620),
            FreqError::Unsupported(_)
        ));
        assert!(matches!(errno_error(libc::EIO, 0x199), FreqError::Daemon(_)));
    }

    #[test]
    fn test_socket_path_default() {
        std::env::remove_var(ENV_SOCKET);
        assert_eq!(socket_path(), DEFAULT_SOCKET);
    }
}
