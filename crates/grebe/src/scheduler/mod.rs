pub mod application;
pub mod queue;

pub use application::SchedulingApplication;
pub use queue::{QueueHandle, QueueTree, SortPolicy};
