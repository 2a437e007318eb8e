use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::mpsc;

use super::App;
use super::rpc::{call_error, error_response};
use crate::jsonrpc::{self, RpcError, code};
use crate::store::{Subscription, TaskEvent};
use crate::stream::{StreamEvent, StreamFailure};
use crate::types::envelope::Envelope;
use crate::types::task::TaskState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `message.stream`: admit through the worker, wait for the first upstream
/// event, then serve an SSE stream fed by the task store's bus until the task
/// goes terminal.
pub async fn stream_message(app: App, agent_id: String, env: Envelope) -> Response {
	let rpc_id = env.rpc_id.clone();
	let webhook = env.webhook.clone();
	let (tx, mut rx) = mpsc::channel(16);
	if let Err(e) = app.gateway.workers.stream(&agent_id, env, tx).await {
		return error_response(rpc_id, call_error(e));
	}

	// The consumer guarantees exactly one init (or an error) per stream.
	let wait = app.gateway.config.worker.call_timeout;
	let body = match tokio::time::timeout(wait, rx.recv()).await {
		Err(_) => {
			return error_response(
				rpc_id,
				RpcError::new(code::TIMEOUT, "upstream stream produced no events"),
			);
		},
		Ok(None) => {
			return error_response(
				rpc_id,
				RpcError::new(code::REMOTE_ERROR, "upstream stream ended before any event"),
			);
		},
		Ok(Some(StreamEvent::Error { failure, .. })) => {
			return error_response(rpc_id, stream_failure(failure));
		},
		Ok(Some(StreamEvent::Init { body, .. })) => body,
	};

	let task_id = stream_task_id(&body);
	if let (Some(task_id), Some(webhook)) = (&task_id, &webhook) {
		app.gateway.tasks.register_webhook(task_id, webhook);
	}
	// Subscribe before reading the current state: events that raced ahead of
	// us are covered by the replay, everything after arrives on the bus.
	let sub = task_id.as_ref().map(|id| app.gateway.tasks.bus().subscribe(id));
	let current = task_id.as_ref().and_then(|id| app.gateway.tasks.get(id));

	let stream = async_stream::stream! {
		yield Ok::<_, Infallible>(frame(&rpc_id, &body));
		if body_terminal(&body) {
			return;
		}
		let Some(mut sub) = sub else {
			// No task id to follow; nothing further can be correlated.
			return;
		};
		// The consumer may have applied more events before we subscribed;
		// replay the latest state when it moved past the init event.
		if let Some(task) = current {
			let embedded = body.get("task").unwrap_or(&body);
			if task.as_value() != embedded {
				let terminal = task.is_terminal();
				yield Ok(frame(&rpc_id, task.as_value()));
				if terminal {
					return;
				}
			}
		}
		loop {
			tokio::select! {
				event = sub.recv() => match event {
					None | Some(TaskEvent::Halt(_)) => break,
					// Only the accepted-write event is forwarded, so one update
					// is one frame; the targeted variants serve other consumers.
					Some(TaskEvent::Task(task)) => {
						let terminal = task.is_terminal();
						yield Ok(frame(&rpc_id, task.as_value()));
						if terminal {
							break;
						}
					},
					Some(TaskEvent::Status(_)) | Some(TaskEvent::Artifact(_)) => {},
				},
				event = rx.recv() => if let Some(StreamEvent::Error { failure, .. }) = event {
					// Error after init closes the stream with a final error frame.
					yield Ok(error_frame(&rpc_id, stream_failure(failure)));
					break;
				},
			}
		}
	};
	sse_response(stream)
}

/// `tasks.subscribe`: replay the current state, then follow the bus.
pub async fn subscribe_task(app: App, env: Envelope) -> Response {
	let rpc_id = env.rpc_id.clone();
	let Some(task_id) = env.task_id else {
		return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "taskId is required"));
	};
	let (sub, current) = app.gateway.tasks.subscribe(&task_id);
	let Some(current) = current else {
		return error_response(rpc_id, RpcError::new(code::TASK_NOT_FOUND, "task not found"));
	};

	let stream = subscription_stream(rpc_id, sub, current.as_value().clone());
	sse_response(stream)
}

fn subscription_stream(
	rpc_id: Value,
	mut sub: Subscription,
	current: Value,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
	async_stream::stream! {
		let terminal = body_terminal(&current);
		yield Ok(frame(&rpc_id, &current));
		if terminal {
			return;
		}
		while let Some(event) = sub.recv().await {
			match event {
				TaskEvent::Halt(_) => break,
				TaskEvent::Task(task) => {
					let terminal = task.is_terminal();
					yield Ok(frame(&rpc_id, task.as_value()));
					if terminal {
						break;
					}
				},
				TaskEvent::Status(_) | TaskEvent::Artifact(_) => {},
			}
		}
	}
}

fn sse_response(
	stream: impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static,
) -> Response {
	let mut resp = Sse::new(stream)
		.keep_alive(
			KeepAlive::new()
				.interval(KEEP_ALIVE_INTERVAL)
				.text("keep-alive"),
		)
		.into_response();
	resp.headers_mut().insert(
		axum::http::header::CACHE_CONTROL,
		axum::http::HeaderValue::from_static("no-cache"),
	);
	resp
}

fn frame(rpc_id: &Value, result: &Value) -> Event {
	let body = jsonrpc::Response::ok(rpc_id.clone(), result.clone());
	Event::default().data(serde_json::to_string(&body).expect("response serializes"))
}

fn error_frame(rpc_id: &Value, error: RpcError) -> Event {
	let body = jsonrpc::Response::error(rpc_id.clone(), error);
	Event::default().data(serde_json::to_string(&body).expect("response serializes"))
}

fn stream_failure(failure: StreamFailure) -> RpcError {
	match failure {
		StreamFailure::Status(s) => RpcError::new(code::REMOTE_ERROR, format!("upstream status {s}")),
		StreamFailure::Transport(e) => RpcError::new(code::REMOTE_ERROR, e),
		StreamFailure::Remote(e) => RpcError::from_value(e),
	}
}

/// Figure out which task a stream event belongs to, across the event shapes
/// upstreams emit.
fn stream_task_id(body: &Value) -> Option<String> {
	let candidates = [
		body.get("task").and_then(|t| t.get("id")),
		body.get("statusUpdate").and_then(|u| u.get("taskId")),
		body.get("artifactUpdate").and_then(|u| u.get("taskId")),
		body.get("id"),
		body.get("message").and_then(|m| m.get("messageId")),
		body.get("message").and_then(|m| m.get("id")),
	];
	candidates
		.into_iter()
		.flatten()
		.find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

fn body_terminal(body: &Value) -> bool {
	let state = body
		.get("status")
		.or_else(|| body.get("task").and_then(|t| t.get("status")))
		.or_else(|| body.get("statusUpdate").and_then(|u| u.get("status")))
		.and_then(|s| s.get("state"))
		.and_then(Value::as_str);
	state
		.and_then(TaskState::parse)
		.is_some_and(|s| s.is_terminal())
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
