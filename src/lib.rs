pub mod agent;
pub mod auth;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod journal;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod transport;
