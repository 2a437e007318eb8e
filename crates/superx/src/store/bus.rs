use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::task::Task;

/// Update broadcast to local subscribers of one task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
	/// The task was written; carries the full stored value.
	Task(Arc<Task>),
	/// A status update was applied; carries the merged task.
	Status(Arc<Task>),
	/// An artifact update was applied; carries the merged task.
	Artifact(Arc<Task>),
	/// Subscribers must stop; the task was deleted or the gateway is closing.
	Halt(HaltReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
	Deleted,
	Shutdown,
}

struct Entry {
	id: u64,
	tx: mpsc::UnboundedSender<TaskEvent>,
}

/// Per-task subscriber registry. Subscribers hold a `Subscription` whose drop
/// unregisters them; senders whose receiver is gone are swept on broadcast.
#[derive(Default)]
pub struct SubscriptionBus {
	subs: Mutex<HashMap<String, Vec<Entry>>>,
	next_id: AtomicU64,
}

impl SubscriptionBus {
	pub fn new() -> Arc<SubscriptionBus> {
		Arc::new(SubscriptionBus::default())
	}

	pub fn subscribe(self: &Arc<Self>, task_id: &str) -> Subscription {
		let (tx, rx) = mpsc::unbounded_channel();
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self
			.subs
			.lock()
			.entry(task_id.to_string())
			.or_default()
			.push(Entry { id, tx });
		Subscription {
			bus: self.clone(),
			task_id: task_id.to_string(),
			id,
			rx,
		}
	}

	/// Send an event to every live subscriber of the task, FIFO per subscriber.
	pub fn broadcast(&self, task_id: &str, event: TaskEvent) {
		let mut subs = self.subs.lock();
		let Some(entries) = subs.get_mut(task_id) else {
			return;
		};
		entries.retain(|e| e.tx.send(event.clone()).is_ok());
		if entries.is_empty() {
			subs.remove(task_id);
		}
	}

	pub fn subscriber_count(&self, task_id: &str) -> usize {
		self.subs.lock().get(task_id).map_or(0, Vec::len)
	}

	fn unsubscribe(&self, task_id: &str, id: u64) {
		let mut subs = self.subs.lock();
		if let Some(entries) = subs.get_mut(task_id) {
			entries.retain(|e| e.id != id);
			if entries.is_empty() {
				subs.remove(task_id);
			}
		}
	}
}

impl std::fmt::Debug for SubscriptionBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionBus").finish()
	}
}

/// A live registration on the bus. Dropping it removes the registration.
pub struct Subscription {
	bus: Arc<SubscriptionBus>,
	task_id: String,
	id: u64,
	rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Subscription {
	pub async fn recv(&mut self) -> Option<TaskEvent> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<TaskEvent> {
		self.rx.try_recv().ok()
	}

	pub fn task_id(&self) -> &str {
		&self.task_id
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.bus.unsubscribe(&self.task_id, self.id);
	}
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
