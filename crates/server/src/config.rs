//! Server configuration.
//!
//! Defaults match the reference deployment: one cache server per host on
//! port 6378, fronting a 500 GiB mapping named `SUFFIX_CACHE`. CLI flags
//! override individual fields (see `main.rs`).

use serde::{Deserialize, Serialize};

use specache_core::arena::{DEFAULT_ARENA_NAME, DEFAULT_ARENA_SIZE, DEFAULT_REGISTRY_CAPACITY};
use specache_core::ArenaConfig;

pub const DEFAULT_LISTEN_ADDR: &str = "[::]:6378";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gRPC server binds to.
    pub listen_addr: String,
    /// Name of the shared-memory region.
    pub arena_name: String,
    /// Size of the shared-memory mapping in bytes.
    pub arena_size: usize,
    /// Number of prompt families the registry can hold.
    pub registry_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            arena_name: DEFAULT_ARENA_NAME.to_string(),
            arena_size: DEFAULT_ARENA_SIZE,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            name: self.arena_name.clone(),
            size: self.arena_size,
            registry_capacity: self.registry_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "[::]:6378");
        assert_eq!(config.arena_name, "SUFFIX_CACHE");
        assert_eq!(config.arena_size, 500 * 1024 * 1024 * 1024);
        assert_eq!(config.registry_capacity, 65_536);
    }

    #[test]
    fn arena_config_carries_all_fields() {
        let mut config = ServerConfig::default();
        config.arena_name = "TEST_REGION".into();
        config.arena_size = 1024;
        config.registry_capacity = 8;
        let arena = config.arena_config();
        assert_eq!(arena.name, "TEST_REGION");
        assert_eq!(arena.size, 1024);
        assert_eq!(arena.registry_capacity, 8);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listen_addr, config.listen_addr);
        assert_eq!(back.arena_size, config.arena_size);
    }
}
