pub mod errors;
pub mod fleet;
pub mod hub_config;
pub mod logging;
