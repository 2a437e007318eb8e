mod agents;
mod bus;
mod tasks;

pub use agents::AgentStore;
pub use bus::{HaltReason, Subscription, SubscriptionBus, TaskEvent};
pub use tasks::{TaskError, TaskStore};
