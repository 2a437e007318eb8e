use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::client::Client;
use crate::jsonrpc;
use crate::protocol::{ProtocolAdapter, StreamEventBody};
use crate::store::TaskStore;
use crate::types::task::Task;

/// Everything the consumer needs to drive one upstream stream.
pub struct StreamRequest {
	pub url: String,
	pub bearer: Option<String>,
	pub request: jsonrpc::Request,
	pub rpc_id: Value,
	pub reply_to: mpsc::Sender<StreamEvent>,
}

/// Messages sent back to the originating request handler.
#[derive(Debug, Clone)]
pub enum StreamEvent {
	/// First parsed event of the stream, sent exactly once.
	Init { rpc_id: Value, body: Value },
	/// The stream failed; no further events follow.
	Error { rpc_id: Value, failure: StreamFailure },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamFailure {
	#[error("upstream status {0}")]
	Status(u16),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("remote error")]
	Remote(Value),
}

/// Final outcome reported to the worker for failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
	Ok,
	/// Upstream rejected with a 4xx; reported but not counted by the breaker.
	ClientError,
	Failure,
}

/// Handle owned by the worker; sending on it stops the consumer.
pub struct StreamHandle {
	shutdown: oneshot::Sender<()>,
}

impl StreamHandle {
	pub fn shutdown(self) {
		let _ = self.shutdown.send(());
	}

	/// True once the consumer has halted, whatever the reason.
	pub fn is_finished(&self) -> bool {
		self.shutdown.is_closed()
	}
}

/// Spawn the consumer task. Returns immediately; the first parsed event goes
/// to `reply_to`, every event body is merged into the task store, and the
/// final outcome is delivered on `done`.
pub fn spawn(
	client: Client,
	adapter: Arc<dyn ProtocolAdapter>,
	store: Arc<TaskStore>,
	req: StreamRequest,
	done: oneshot::Sender<StreamOutcome>,
) -> StreamHandle {
	let (shutdown_tx, shutdown_rx) = oneshot::channel();
	tokio::spawn(async move {
		let outcome = consume(client, adapter, store, req, shutdown_rx).await;
		let _ = done.send(outcome);
	});
	StreamHandle {
		shutdown: shutdown_tx,
	}
}

async fn consume(
	client: Client,
	adapter: Arc<dyn ProtocolAdapter>,
	store: Arc<TaskStore>,
	req: StreamRequest,
	mut shutdown: oneshot::Receiver<()>,
) -> StreamOutcome {
	let StreamRequest {
		url,
		bearer,
		request,
		rpc_id,
		reply_to,
	} = req;

	let resp = match client.post_stream(&url, bearer.as_deref(), &request).await {
		Ok(resp) => resp,
		Err(e) => {
			let _ = reply_to
				.send(StreamEvent::Error {
					rpc_id,
					failure: StreamFailure::Transport(e.to_string()),
				})
				.await;
			return StreamOutcome::Failure;
		},
	};

	let status = resp.status();
	if !status.is_success() {
		let _ = reply_to
			.send(StreamEvent::Error {
				rpc_id,
				failure: StreamFailure::Status(status.as_u16()),
			})
			.await;
		return if status.is_client_error() {
			StreamOutcome::ClientError
		} else {
			StreamOutcome::Failure
		};
	}

	let mut body = resp.bytes_stream();
	let mut buf = BytesMut::new();
	let mut init_sent = false;

	loop {
		tokio::select! {
			_ = &mut shutdown => {
				debug!(url = %url, "stream shut down by owner");
				return StreamOutcome::Ok;
			},
			chunk = body.next() => match chunk {
				None => return StreamOutcome::Ok,
				Some(Err(e)) => {
					if !init_sent {
						let _ = reply_to
							.send(StreamEvent::Error {
								rpc_id,
								failure: StreamFailure::Transport(e.to_string()),
							})
							.await;
					}
					return StreamOutcome::Failure;
				},
				Some(Ok(chunk)) => {
					buf.extend_from_slice(&chunk);
					while let Some(frame) = next_frame(&mut buf) {
						if frame.is_empty() || frame.starts_with(':') {
							continue;
						}
						match adapter.decode_stream_event(&frame) {
							Ok(StreamEventBody::Ok(event)) => {
								if !init_sent {
									init_sent = true;
									let _ = reply_to
										.send(StreamEvent::Init {
											rpc_id: rpc_id.clone(),
											body: event.clone(),
										})
										.await;
								}
								dispatch(&store, event);
							},
							Ok(StreamEventBody::Err(error)) => {
								let _ = reply_to
									.send(StreamEvent::Error {
										rpc_id,
										failure: StreamFailure::Remote(error),
									})
									.await;
								return StreamOutcome::Failure;
							},
							// Malformed events are logged and skipped, never fatal.
							Err(_) => warn!(url = %url, frame = %frame, "skipping undecodable stream event"),
						}
					}
				},
			},
		}
	}
}

/// Pop one `\n\n`-terminated event off the buffer. The trailing incomplete
/// fragment stays buffered across chunks.
fn next_frame(buf: &mut BytesMut) -> Option<String> {
	let pos = buf.windows(2).position(|w| w == b"\n\n")?;
	let frame = buf.split_to(pos + 2);
	let frame = &frame[..pos];
	Some(String::from_utf8_lossy(frame).trim().to_string())
}

/// Merge one event body into the task store.
fn dispatch(store: &Arc<TaskStore>, event: Value) {
	let applied = if let Some(update) = event.get("statusUpdate") {
		store.apply_status_update(update.clone()).map(|_| ())
	} else if let Some(update) = event.get("artifactUpdate") {
		store.apply_artifact_update(update.clone()).map(|_| ())
	} else if let Some(task) = event.get("task") {
		store.put(task.clone()).map(|_| ())
	} else if let Some(message) = event.get("message") {
		store
			.put(Task::from_message(message.clone()).into_value())
			.map(|_| ())
	} else {
		// Unknown event shapes are passed over silently.
		return;
	};
	if let Err(e) = applied {
		debug!("stream event not applied: {e}");
	}
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
