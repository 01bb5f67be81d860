// Laiska Engine - Core module structure
pub mod api;
pub mod cli;
pub mod config;
pub mod device;
pub mod updater;

pub use config::NodeConfig;
pub use updater::OtaContext;
