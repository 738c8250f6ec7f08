//! HTTP service: routes, error mapping and the concrete store/producer
//! wiring.
//!
//! ## Structure
//!
//! - [`config`] - storage backend and coordinator type.
//! - [`handler`] - axum routes (`AppState`, `router`).
//! - [`error`] - `ApiError`, library errors as HTTP responses.

pub mod config;
pub mod error;
pub mod handler;
#[cfg(test)]
mod tests;
