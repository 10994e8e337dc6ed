pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod live;
pub mod metrics;
pub mod server;
pub mod token;
pub mod upstream;
