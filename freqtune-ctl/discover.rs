//! Backend discovery and restartable iteration
//!
//! Availability of a backend is a runtime property: the registry is probed in
//! order and the first backend whose init succeeds wins. The engine remembers
//! its position per device class, so a caller that finds a backend unusable at
//! the device level can release it and ask for the next candidate without
//! re-probing the ones already rejected. A sweep that reaches the end of the
//! registry resets, and the following call starts over from the front.

use crate::backend::registry::{BackendDescriptor, REGISTRY};
use crate::backend::{DeviceClass, FreqBackend};
use crate::error::FreqError;

/// Environment variable pinning the core-class backend by exact name
pub const ENV_CORE_BACKEND: &str = "FREQTUNE_CORE_BACKEND";
/// Environment variable pinning the uncore-class backend by exact name
pub const ENV_UNCORE_BACKEND: &str = "FREQTUNE_UNCORE_BACKEND";

/// One backend-init failure observed during a sweep
///
/// Init failures never abort a sweep; they are recorded here and the scan
/// moves on to the next candidate.
#[derive(Debug)]
pub struct ProbeFailure {
    pub backend: &'static str,
    pub class: DeviceClass,
    pub error: FreqError,
}

/// The discovery engine: two cursors over the backend registry
///
/// Single-threaded by design; wrap in a mutex for cross-thread use.
pub struct Discovery {
    registry: &'static [BackendDescriptor],
    cursor: [Option<usize>; DeviceClass::COUNT],
    failures: Vec<ProbeFailure>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self::with_registry(REGISTRY)
    }

    /// Engine over an arbitrary registry; the protocol is independent of the
    /// compiled-in backend table.
    pub(crate) fn with_registry(registry: &'static [BackendDescriptor]) -> Self {
        Self {
            registry,
            cursor: [None; DeviceClass::COUNT],
            failures: Vec::new(),
        }
    }

    /// Next usable backend for a device class, continuing the current sweep.
    pub fn next_backend(&mut self, class: DeviceClass) -> Option<Box<dyn FreqBackend>> {
        self.next_matching(class, None)
    }

    /// Next usable backend whose registry name matches `filter` exactly.
    ///
    /// Candidates without an init entry for the class are skipped without
    /// counting as failures. The first successful init wins; its index
    /// becomes the cursor. Exhaustion resets the cursor so the next call
    /// restarts from the beginning.
    pub fn next_matching(
        &mut self,
        class: DeviceClass,
        filter: Option<&str>,
    ) -> Option<Box<dyn FreqBackend>> {
        self.failures.clear();

        let registry = self.registry;
        let start = self.cursor[class.index()].map_or(0, |i| i + 1);
        for (index, descriptor) in registry.iter().enumerate().skip(start) {
            let init = match class {
                DeviceClass::Core => descriptor.init_core,
                DeviceClass::Uncore => descriptor.init_uncore,
            };
            let Some(init) = init else { continue };

            if let Some(wanted) = filter {
                if wanted != descriptor.name {
                    continue;
                }
            }

            match init() {
                Ok(backend) => {
                    tracing::debug!(
                        "selected backend {} for {} devices",
                        descriptor.name,
                        class.name()
                    );
                    self.cursor[class.index()] = Some(index);
                    return Some(backend);
                }
                Err(error) => {
                    tracing::debug!(
                        "backend {} unusable for {}: {}",
                        descriptor.name,
                        class.name(),
                        error
                    );
                    self.failures.push(ProbeFailure {
                        backend: descriptor.name,
                        class,
                        error,
                    });
                }
            }
        }

        tracing::debug!("no {} backend usable, sweep restarts", class.name());
        self.cursor[class.index()] = None;
        None
    }

    /// Next usable backend with the environment filter for `class` applied.
    pub fn next_from_env(&mut self, class: DeviceClass) -> Option<Box<dyn FreqBackend>> {
        let filter = env_filter(class);
        self.next_matching(class, filter.as_deref())
    }

    /// Init failures recorded by the most recent call.
    pub fn probe_failures(&self) -> &[ProbeFailure] {
        &self.failures
    }

    /// Restart one class's sweep from the beginning.
    pub fn rewind(&mut self, class: DeviceClass) {
        self.cursor[class.index()] = None;
    }
}

/// Backend-name filter from the process environment; absent or empty means
/// no filtering.
pub fn env_filter(class: DeviceClass) -> Option<String> {
    let var = match class {
        DeviceClass::Core => ENV_CORE_BACKEND,
        DeviceClass::Uncore => ENV_UNCORE_BACKEND,
    };
    std::env::var(var).ok().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Device, Setting};
    use crate::error::Result;

    struct MockBackend {
        name: &'static str,
    }

    impl FreqBackend for MockBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn device_count(&self) -> Result<u32> {
            Ok(1)
        }

        fn open_device(&self, index: u32) -> Result<Device> {
            Err(FreqError::OutOfRange { index, count: 0 })
        }

        fn prepare_setting(&self, _target_hz: i64, _turbo: bool) -> Result<Setting> {
            Err(FreqError::Unsupported("mock".into()))
        }

        fn set_frequency(&self, _dev: &mut Device, _setting: &Setting) -> Result<()> {
            Err(FreqError::Unsupported("mock".into()))
        }
    }

    fn ok_alpha() -> Result<Box<dyn FreqBackend>> {
        Ok(Box::new(MockBackend { name: "alpha" }))
    }

    fn ok_beta() -> Result<Box<dyn FreqBackend>> {
        Ok(Box::new(MockBackend { name: "beta" }))
    }

    fn fail_permission() -> Result<Box<dyn FreqBackend>> {
        Err(FreqError::PermissionDenied {
            path: "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor".into(),
        })
    }

    static TWO_GOOD: &[BackendDescriptor] = &[
        BackendDescriptor {
            name: "alpha",
            init_core: Some(ok_alpha),
            init_uncore: None,
        },
        BackendDescriptor {
            name: "beta",
            init_core: Some(ok_beta),
            init_uncore: Some(ok_beta),
        },
    ];

    static BROKEN_THEN_GOOD: &[BackendDescriptor] = &[
        BackendDescriptor {
            name: "broken",
            init_core: Some(fail_permission),
            init_uncore: None,
        },
        BackendDescriptor {
            name: "beta",
            init_core: Some(ok_beta),
            init_uncore: None,
        },
    ];

    static ONLY_BROKEN: &[BackendDescriptor] = &[BackendDescriptor {
        name: "broken",
        init_core: Some(fail_permission),
        init_uncore: None,
    }];

    #[test]
    fn test_sweep_walks_then_restarts() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        // first: alpha, second: beta, third: exhausted, fourth: alpha again
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "alpha");
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "beta");
        assert!(disc.next_backend(DeviceClass::Core).is_none());
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "alpha");
    }

    #[test]
    fn test_restart_matches_first_sweep() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        let first = disc.next_backend(DeviceClass::Core).unwrap().name();
        while disc.next_backend(DeviceClass::Core).is_some() {}
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), first);
    }

    #[test]
    fn test_classes_have_independent_cursors() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "alpha");
        // alpha has no uncore init; the uncore sweep starts at beta
        assert_eq!(disc.next_backend(DeviceClass::Uncore).unwrap().name(), "beta");
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "beta");
    }

    #[test]
    fn test_filter_returns_named_backend_or_nothing() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        assert_eq!(
            disc.next_matching(DeviceClass::Core, Some("beta"))
                .unwrap()
                .name(),
            "beta"
        );
        // sweep continues past beta: exhausted
        assert!(disc.next_matching(DeviceClass::Core, Some("beta")).is_none());
        // restarted: beta again, never alpha
        assert_eq!(
            disc.next_matching(DeviceClass::Core, Some("beta"))
                .unwrap()
                .name(),
            "beta"
        );
    }

    #[test]
    fn test_filter_unknown_name_matches_nothing() {
        let mut disc = Discovery::with_registry(TWO_GOOD);
        assert!(disc.next_matching(DeviceClass::Core, Some("gamma")).is_none());
        assert!(disc.probe_failures().is_empty());
    }

    #[test]
    fn test_failing_backend_does_not_block_later_ones() {
        let mut disc = Discovery::with_registry(BROKEN_THEN_GOOD);

        let found = disc.next_backend(DeviceClass::Core).unwrap();
        assert_eq!(found.name(), "beta");

        let failures = disc.probe_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].backend, "broken");
    }

    #[test]
    fn test_probe_failure_keeps_permission_context() {
        let mut disc = Discovery::with_registry(ONLY_BROKEN);

        assert!(disc.next_backend(DeviceClass::Core).is_none());
        let failures = disc.probe_failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            FreqError::PermissionDenied { .. }
        ));
        assert!(failures[0].error.to_string().contains("scaling_governor"));
    }

    #[test]
    fn test_class_without_init_is_skipped_silently() {
        let mut disc = Discovery::with_registry(BROKEN_THEN_GOOD);
        // neither entry serves uncore
        assert!(disc.next_backend(DeviceClass::Uncore).is_none());
        assert!(disc.probe_failures().is_empty());
    }

    #[test]
    fn test_rewind_restarts_mid_sweep() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "alpha");
        disc.rewind(DeviceClass::Core);
        assert_eq!(disc.next_backend(DeviceClass::Core).unwrap().name(), "alpha");
    }

    #[test]
    fn test_env_filter_pins_backend() {
        let mut disc = Discovery::with_registry(TWO_GOOD);

        std::env::set_var(ENV_CORE_BACKEND, "beta");
        let found = disc.next_from_env(DeviceClass::Core);
        std::env::remove_var(ENV_CORE_BACKEND);

        assert_eq!(found.unwrap().name(), "beta");
    }

    #[test]
    fn test_env_filter_empty_means_unfiltered() {
        std::env::remove_var(ENV_UNCORE_BACKEND);
        assert!(env_filter(DeviceClass::Uncore).is_none());
    }
}
