pub mod aggregate;
pub mod candle;
pub mod config;
pub mod export;
pub mod ingest;
pub mod query;
pub mod store;
