#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod resolver;
pub mod utils;
