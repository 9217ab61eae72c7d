#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod config;
mod engine;
mod error;
mod events;
mod frame;
mod handler;
mod heartbeat;
mod origin;
mod pending;
mod transport;
mod validation;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use frame::*;
pub use handler::*;
pub use origin::*;
pub use pending::*;
pub use transport::*;
pub use validation::*;
