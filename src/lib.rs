#[cfg(all(feature = "af_packet", target_os = "linux"))]
pub mod af_packet;
pub mod api;
pub mod diag;
pub mod errors;
pub mod forward;
pub mod lcore;
pub mod mempool;
pub mod port;
pub mod sim;
pub mod startup;
pub mod telemetry;
