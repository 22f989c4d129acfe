//! # xiaomi-gateway
//!
//! Asynchronous implementation of the Xiaomi (Aqara) gateway local UDP
//! protocol: multicast discovery, device enumeration, telemetry decoding and
//! authorised write commands.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xiaomi_gateway::{Engine, EngineConfig, MemoryItemRegistry};
//!
//! # async fn run() -> xiaomi_gateway::Result<()> {
//! let items = Arc::new(MemoryItemRegistry::new());
//! items.bind("LivingRoomTemp", "158d0001a2b3c4.temperature");
//!
//! let engine = Engine::new(EngineConfig::default().with_developer_key("DEVELOPER_KEY"), items);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod binding;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod item;
pub mod mapper;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod session;

pub use binding::{BoundEvent, CubeGesture, EventKind, ItemBinding};
pub use config::EngineConfig;
pub use crypto::{AesKeyEncryptor, KeyEncryptor};
pub use engine::Engine;
pub use error::{GatewayError, Result};
pub use gateway::{EngineEvent, Gateway, Outbound};
pub use item::{Command, ItemLookup, ItemRegistry, MemoryItemRegistry, State};
pub use protocol::{CommandType, GatewayMessage};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
