pub mod constants;
pub mod error;
pub mod key_utils;
pub mod schemas;
pub mod telemetry;
pub mod time_utils;
