//! I/O adapters: filesystem, sockets, processes, config and templates.

pub mod channel;
pub mod config;
pub mod control;
pub mod cycle_log;
pub mod init;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod state_store;
pub mod worker;
