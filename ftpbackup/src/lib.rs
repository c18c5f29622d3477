pub mod backup;
pub mod config;
pub mod logging;
