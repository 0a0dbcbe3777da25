#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod manifest;
pub mod storage;
pub mod utils;
