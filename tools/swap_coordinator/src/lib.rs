pub mod config;
pub mod contract;
pub mod daemon;
pub mod events;
pub mod harness;
pub mod machine;
pub mod message;
pub mod metrics;
pub mod params;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod state;
pub mod timeout;
