pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod rest;

pub use client::Client;
pub use error::{ApiError, CodecError, GatewayError, RestError};
