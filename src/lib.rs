pub mod api;
pub mod autopilot;
pub mod config;
pub mod error;
pub mod grpc;
pub mod membership;
pub mod model;
pub mod node;
pub mod raft;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("cluster");
}
