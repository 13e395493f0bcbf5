pub mod constants;
pub mod refresh;
pub mod telemetry;
