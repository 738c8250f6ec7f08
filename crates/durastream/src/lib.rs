#![doc = include_str!("../README.md")]

mod chunk;
mod coordinator;
mod error;
mod producer;
mod store;
mod transport;

pub use crate::chunk::*;
pub use crate::coordinator::*;
pub use crate::error::*;
pub use crate::producer::*;
pub use crate::store::*;
pub use crate::transport::*;
