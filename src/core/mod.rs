pub mod config;
pub mod discovery;
pub mod download;
pub mod events;
pub mod extract;
pub mod pipeline;
pub mod process;
pub mod self_update;
pub mod version;
