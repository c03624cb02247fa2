pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use log::{LogEntry, ReplicatedLog};
pub use node::{CommittedBatch, RaftMessage, RaftNode};
pub use state::{RaftRole, RaftState, Snapshot};
pub use storage::RaftStorage;
