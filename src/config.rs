use std::str::FromStr;

use crate::memory::MemType;

/// Size of the process-wide accelerator runtime, see
/// [crate::memory::device::init].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub num_devices: usize,
    /// Capacity of every device, in bytes
    pub device_memory: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_devices: 1,
            device_memory: 1 << 30,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override("TGRAPH_NUM_DEVICES", &mut cfg.num_devices);
        env_override("TGRAPH_DEVICE_MEMORY", &mut cfg.device_memory);
        cfg
    }
}

/// Graph level defaults, picked up by [crate::graph::Graph] when a leaf is
/// created without an explicit residency.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub mem_type: MemType,
    pub device_id: usize,
    /// Skip the stream synchronize after accelerator kernels
    pub async_exec: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_type: MemType::Host,
            device_id: 0,
            async_exec: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override("TGRAPH_MEM_TYPE", &mut cfg.mem_type);
        env_override("TGRAPH_DEVICE_ID", &mut cfg.device_id);
        env_override("TGRAPH_ASYNC", &mut cfg.async_exec);
        cfg
    }

    pub fn with_mem_type(mut self, mem_type: MemType) -> Self {
        self.mem_type = mem_type;
        self
    }

    pub fn with_async(mut self, async_exec: bool) -> Self {
        self.async_exec = async_exec;
        self
    }
}

fn env_override<V: FromStr>(key: &str, dst: &mut V) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *dst = v,
        Err(_) => log::warn!("ignoring {key}={raw:?}: unparseable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_synchronous_host() {
        let cfg = Config::default();
        assert_eq!(cfg.mem_type, MemType::Host);
        assert_eq!(cfg.device_id, 0);
        assert!(!cfg.async_exec);
        assert_eq!(RuntimeConfig::default().num_devices, 1);
    }

    #[test]
    fn builders() {
        let cfg = Config::default().with_mem_type(MemType::Managed).with_async(true);
        assert_eq!(cfg.mem_type, MemType::Managed);
        assert!(cfg.async_exec);
    }
}
