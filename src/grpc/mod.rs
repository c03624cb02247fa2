pub mod consensus_service;
pub mod forward;
pub mod internal_service;
pub mod server;

pub use forward::Proposer;
pub use server::GrpcServer;
