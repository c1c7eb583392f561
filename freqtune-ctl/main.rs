use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use freqtune::discover::env_filter;
use freqtune::{topology, DeviceClass, Discovery, FreqBackend, FreqError};

#[derive(Parser, Debug)]
#[command(name = "freqtune")]
#[command(about = "Discover and drive CPU/uncore frequency control backends")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging (shows backend probing and register writes)"
    )]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every backend usable on this machine
    List {
        #[arg(long, help = "Probe uncore backends instead of core")]
        uncore: bool,
    },
    /// Read the current frequency of each device
    Show {
        #[arg(long, help = "Uncore devices instead of core")]
        uncore: bool,

        #[arg(
            long,
            help = "Device indices (ranges and lists: 0-3,5); default all"
        )]
        devices: Option<String>,
    },
    /// Apply a frequency to devices
    Set {
        #[arg(help = "Target frequency: 2.4GHz, 2400MHz, 2400000kHz or plain Hz")]
        frequency: String,

        #[arg(long, help = "Uncore devices instead of core")]
        uncore: bool,

        #[arg(long, help = "Drive only the lower bound (range backends only)")]
        min: bool,

        #[arg(long, help = "Ask the backend to disengage turbo")]
        no_turbo: bool,

        #[arg(
            long,
            help = "Device indices (ranges and lists: 0-3,5); default all"
        )]
        devices: Option<String>,
    },
}

/// Parse "2.4GHz" / "2400MHz" / "2400000kHz" / raw Hz into Hz.
fn parse_frequency(input: &str) -> Option<i64> {
    let s = input.trim();
    let unit_at = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(unit_at);
    let value: f64 = number.trim().parse().ok()?;

    let scale = match unit.to_ascii_lowercase().as_str() {
        "" | "hz" => 1.0,
        "khz" => 1e3,
        "mhz" => 1e6,
        "ghz" => 1e9,
        _ => return None,
    };

    let hz = value * scale;
    (hz.is_finite() && hz >= 1.0).then_some(hz as i64)
}

fn display_ghz(hz: i64) -> String {
    format!("{:.3} GHz", hz as f64 / 1e9)
}

fn class_of(uncore: bool) -> DeviceClass {
    if uncore {
        DeviceClass::Uncore
    } else {
        DeviceClass::Core
    }
}

/// Expand an index spec against the backend's device count; default is all.
fn select_devices(spec: Option<&str>, count: u32) -> freqtune::Result<Vec<u32>> {
    match spec {
        Some(spec) => {
            let list = topology::parse_cpu_list(spec).ok_or_else(|| {
                FreqError::InvalidArgument(format!("malformed device list {spec:?}"))
            })?;
            for &index in &list {
                if index >= count {
                    return Err(FreqError::OutOfRange { index, count });
                }
            }
            Ok(list)
        }
        None => Ok((0..count).collect()),
    }
}

fn cmd_list(class: DeviceClass) -> anyhow::Result<()> {
    let mut disc = Discovery::new();
    let mut unusable: Vec<String> = Vec::new();
    let mut found = 0;

    loop {
        let backend = disc.next_matching(class, None);
        for failure in disc.probe_failures() {
            unusable.push(format!("{}: {}", failure.backend, failure.error));
        }
        let Some(backend) = backend else { break };

        found += 1;
        let devices = match backend.device_count() {
            Ok(count) => count.to_string(),
            Err(e) => format!("? ({e})"),
        };
        let mut caps = Vec::new();
        if backend.reader().is_some() {
            caps.push("read");
        }
        if backend.range().is_some() {
            caps.push("min");
        }
        let caps = if caps.is_empty() {
            "set-only".to_string()
        } else {
            caps.join(",")
        };
        println!("{:<12} {:>4} {} devices  [{caps}]", backend.name(), devices, class.name());
        backend.finalize();
    }

    if found == 0 {
        println!("no usable {} backend", class.name());
    }
    for line in unusable {
        println!("  unusable  {line}");
    }
    Ok(())
}

fn cmd_show(class: DeviceClass, devices: Option<&str>) -> anyhow::Result<()> {
    let mut disc = Discovery::new();
    let filter = env_filter(class);
    let Some(backend) = disc.next_matching(class, filter.as_deref()) else {
        report_failures(&disc);
        bail!("no usable {} backend", class.name());
    };

    let Some(reader) = backend.reader() else {
        bail!(
            "backend {} cannot read frequencies back",
            backend.name()
        );
    };

    let count = backend
        .device_count()
        .with_context(|| format!("counting {} devices", class.name()))?;
    let indices = select_devices(devices, count)?;

    for index in indices {
        let mut dev = backend.open_device(index)?;
        let current = reader.get_frequency(&mut dev)?;
        match backend.range() {
            Some(range) => {
                let min = range.get_min_frequency(&mut dev)?;
                println!(
                    "{}{index}: {} (min {})",
                    class.name(),
                    display_ghz(current),
                    display_ghz(min)
                );
            }
            None => println!("{}{index}: {}", class.name(), display_ghz(current)),
        }
        backend.close_device(dev);
    }
    Ok(())
}

fn cmd_set(
    class: DeviceClass,
    frequency: &str,
    min: bool,
    no_turbo: bool,
    devices: Option<&str>,
) -> anyhow::Result<()> {
    let target_hz =
        parse_frequency(frequency).with_context(|| format!("malformed frequency {frequency:?}"))?;

    let mut disc = Discovery::new();
    let filter = env_filter(class);

    // a backend can initialize and still fail at the device level; fall
    // through to the next candidate when it does
    loop {
        let Some(backend) = disc.next_matching(class, filter.as_deref()) else {
            report_failures(&disc);
            bail!("no usable {} backend", class.name());
        };

        match apply(&*backend, target_hz, !no_turbo, min, devices) {
            Ok(applied) => {
                println!(
                    "{}: set {} on {applied} {} device(s)",
                    backend.name(),
                    display_ghz(target_hz),
                    class.name()
                );
                backend.finalize();
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("backend {} failed: {e}, trying next", backend.name());
                backend.finalize();
            }
        }
    }
}

fn apply(
    backend: &dyn FreqBackend,
    target_hz: i64,
    turbo: bool,
    min: bool,
    devices: Option<&str>,
) -> freqtune::Result<u32> {
    let count = backend.device_count()?;
    let indices = select_devices(devices, count)?;
    let setting = backend.prepare_setting(target_hz, turbo)?;

    let mut applied = 0;
    let mut outcome = Ok(());
    for &index in &indices {
        let mut dev = match backend.open_device(index) {
            Ok(dev) => dev,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        let result = if min {
            match backend.range() {
                Some(range) => range.set_min_frequency(&mut dev, &setting),
                None => Err(FreqError::Unsupported(format!(
                    "backend {} cannot drive the lower bound alone",
                    backend.name()
                ))),
            }
        } else {
            backend.set_frequency(&mut dev, &setting)
        };
        backend.close_device(dev);
        if let Err(e) = result {
            outcome = Err(e);
            break;
        }
        applied += 1;
    }

    backend.release_setting(setting);
    outcome.map(|()| applied)
}

fn report_failures(disc: &Discovery) {
    for failure in disc.probe_failures() {
        eprintln!("  unusable  {}: {}", failure.backend, failure.error);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    match args.command {
        Command::List { uncore } => cmd_list(class_of(uncore)),
        Command::Show { uncore, devices } => cmd_show(class_of(uncore), devices.as_deref()),
        Command::Set {
            frequency,
            uncore,
            min,
            no_turbo,
            devices,
        } => cmd_set(
            class_of(uncore),
            &frequency,
            min,
            no_turbo,
            devices.as_deref(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frequency_units() {
        assert_eq!(parse_frequency("2.4GHz"), Some(2_400_000_000));
        assert_eq!(parse_frequency("2400MHz"), Some(2_400_000_000));
        assert_eq!(parse_frequency("2400000kHz"), Some(2_400_000_000));
        assert_eq!(parse_frequency("2400000000"), Some(2_400_000_000));
        assert_eq!(parse_frequency("1800 mhz"), Some(1_800_000_000));
    }

    #[test]
    fn test_parse_frequency_rejects_garbage() {
        assert_eq!(parse_frequency("fast"), None);
        assert_eq!(parse_frequency("2.4THz"), None);
        assert_eq!(parse_frequency("-1GHz"), None);
        assert_eq!(parse_frequency(""), None);
    }

    #[test]
    fn test_select_devices_defaults_to_all() {
        assert_eq!(select_devices(None, 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_select_devices_checks_range() {
        assert_eq!(select_devices(Some("1,3"), 4).unwrap(), vec![1, 3]);
        assert!(matches!(
            select_devices(Some("5"), 4),
            Err(FreqError::OutOfRange { index: 5, count: 4 })
        ));
        assert!(matches!(
            select_devices(Some("one"), 4),
            Err(FreqError::InvalidArgument(_))
        ));
    }
}
