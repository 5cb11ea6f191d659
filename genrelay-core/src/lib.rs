pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod framer;
pub mod http_client;
pub mod model;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod relay;
pub mod router;
pub mod stream;
pub mod telemetry;
pub mod validate;
#[cfg(test)]
pub mod test_util;
