//! CoreDNS-style DNS server whose `kubepods` plugin answers for pods by name or address.

pub mod config;
pub mod dns_server;
pub mod plugin;
pub mod types;
pub mod wire;
pub mod zones;
