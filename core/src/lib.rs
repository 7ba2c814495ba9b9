pub mod data;
pub mod network;
pub mod shutdown;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod utils;
