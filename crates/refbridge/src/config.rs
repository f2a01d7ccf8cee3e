//! Configuration for sandbox module instances.

use serde::{Deserialize, Serialize};

/// Configuration for one module instance.
///
/// `stack_size` and `heap_size` are fixed at instantiation and snapshotted
/// on the instance; they cannot change for the life of the module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Maximum wasm call stack in bytes
    pub stack_size: usize,

    /// Maximum linear memory in bytes
    pub heap_size: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Initial externref table capacity (slots)
    pub ref_table_capacity: u32,

    /// Maximum externref table capacity (None = unbounded)
    pub ref_table_max: Option<u32>,

    /// Cranelift optimization level (0 = none, 1+ = speed)
    pub optimization_level: u8,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            stack_size: 512 * 1024,       // 512 KiB
            heap_size: 16 * 1024 * 1024,  // 16 MiB
            fuel_limit: None,
            ref_table_capacity: 16,
            ref_table_max: None,
            optimization_level: 2,
        }
    }
}

impl InstanceConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            heap_size: 1024 * 1024,          // 1 MiB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ref_table_capacity: 4,
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Builder: set the wasm stack budget
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Builder: set the linear memory limit
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Builder: set the fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: set the initial externref table capacity
    pub fn ref_table_capacity(mut self, slots: u32) -> Self {
        self.ref_table_capacity = slots;
        self
    }

    /// Builder: cap the externref table
    pub fn ref_table_max(mut self, slots: u32) -> Self {
        self.ref_table_max = Some(slots);
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = InstanceConfig::default();
        assert_eq!(config.stack_size, 512 * 1024);
        assert_eq!(config.heap_size, 16 * 1024 * 1024);
        assert!(config.fuel_limit.is_none());
        assert_eq!(config.ref_table_capacity, 16);
    }

    #[test]
    fn test_config_minimal() {
        let config = InstanceConfig::minimal();
        assert_eq!(config.heap_size, 1024 * 1024);
        assert!(config.fuel_limit.is_some());
        assert_eq!(config.ref_table_capacity, 4);
    }

    #[test]
    fn test_config_builder_chain() {
        let config = InstanceConfig::default()
            .stack_size(64 * 1024)
            .heap_size(2 * 1024 * 1024)
            .fuel_limit(500_000)
            .ref_table_capacity(8)
            .ref_table_max(64)
            .optimize(9);

        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.heap_size, 2 * 1024 * 1024);
        assert_eq!(config.fuel_limit, Some(500_000));
        assert_eq!(config.ref_table_capacity, 8);
        assert_eq!(config.ref_table_max, Some(64));
        assert_eq!(config.optimization_level, 3); // clamped
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = InstanceConfig::minimal().stack_size(128 * 1024);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: InstanceConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.stack_size, 128 * 1024);
        assert_eq!(back.heap_size, config.heap_size);
        assert_eq!(back.fuel_limit, config.fuel_limit);
    }
}
