pub mod config;

/// Network every managed container joins unless configured otherwise.
pub const DEFAULT_NETWORK_NAME: &str = "pgdock_services";
