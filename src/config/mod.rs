pub mod app_config;
pub mod loader;
pub mod probe_config;

pub use loader::{ConfigError, ConfigLoader, DEFAULT_MODULE, FileConfigLoader, resolve_module};
pub use probe_config::{BasicAuth, Config, DnsProbe, HttpProbe, IcmpProbe, Module, TcpProbe};
