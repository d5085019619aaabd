//! Exchange order API: the `ExchangeApi` seam, the live CLOB client, and the
//! shared rate limiter.

pub mod client;
pub mod rate_limit;

pub use client::{ClobClient, ClobCredentials, ExchangeApi, ExchangeError, OrderAck};
pub use rate_limit::TokenBucket;
