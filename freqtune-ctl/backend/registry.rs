//! The fixed, ordered backend registry
//!
//! Order defines discovery precedence and never changes at runtime. A `None`
//! init slot means the backend does not serve that device class at all.

use super::FreqBackend;
use crate::backends::{daemon, msr, sysfs, x86_adapt};
use crate::error::Result;

pub type InitFn = fn() -> Result<Box<dyn FreqBackend>>;

pub struct BackendDescriptor {
    pub name: &'static str,
    pub init_core: Option<InitFn>,
    pub init_uncore: Option<InitFn>,
}

pub static REGISTRY: &[BackendDescriptor] = &[
    BackendDescriptor {
        name: "sysfs",
        init_core: Some(sysfs::init_core),
        init_uncore: None,
    },
    BackendDescriptor {
        name: "x86_adapt",
        init_core: Some(x86_adapt::init_core),
        init_uncore: Some(x86_adapt::init_uncore),
    },
    BackendDescriptor {
        name: "msr",
        init_core: Some(msr::init_core),
        init_uncore: Some(msr::init_uncore),
    },
    BackendDescriptor {
        name: "daemon",
        init_core: Some(daemon::init_core),
        init_uncore: Some(daemon::init_uncore),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order() {
        let names: Vec<_> = REGISTRY.iter().map(|d| d.name).collect();
        assert_eq!(names, ["sysfs", "x86_adapt", "msr", "daemon"]);
    }

    #[test]
    fn test_registry_names_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_every_backend_serves_a_class() {
        for desc in REGISTRY {
            assert!(desc.init_core.is_some() || desc.init_uncore.is_some());
        }
    }
}
