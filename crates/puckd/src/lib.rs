//! The puck daemon: a framed request/response dispatcher on a Unix socket,
//! wired to the lifecycle manager and the HTTP router. The client half is
//! free-standing and is what the CLI links against.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use config::Config;
pub use server::Daemon;
