pub mod stats_service {
    tonic::include_proto!("xray.app.stats.command");
}

pub mod config;
pub mod coordinator;
pub mod db;
pub mod node_sync;
pub mod ports;
pub mod utils;
pub mod version;
pub mod writer;
pub mod xray;
