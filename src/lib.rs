#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
mod log;
pub mod supervisor;

pub use config::Config;
pub use engine::{ConnectTarget, Engine, EngineHandle, Payload, Transport};
pub use error::Error;
pub use heartbeat::HeartbeatConfig;
pub use log::{LogAdapter, init};
pub use supervisor::{ConnectionState, Supervisor};

pub type Result<T> = std::result::Result<T, Error>;
