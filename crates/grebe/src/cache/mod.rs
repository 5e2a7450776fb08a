pub mod allocation;
pub mod application;
pub mod cluster;
pub mod node;
pub mod partition;
pub mod queue;

pub use allocation::AllocationInfo;
pub use application::ApplicationInfo;
pub use cluster::ClusterInfo;
pub use node::NodeInfo;
pub use partition::{AdmissionMode, PartitionInfo};
pub use queue::QueueInfo;
