//! Ambient realization of spec.md §3's Configuration and §6's
//! "Configuration keys consumed", plus the hot-reload watcher grounded on
//! `examples/GrandMax-telemt-pannel/src/config/hot_reload.rs`.

pub mod hot_reload;
pub mod load;

pub use hot_reload::{spawn_config_watcher, HotFields};
pub use load::{
    AuthSection, GeneralSection, LogLevel, NetworkSection, ProxyConfig, RegistrationSection,
    ServerSection,
};
