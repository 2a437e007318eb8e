use serde_json::json;

use super::*;
use crate::protocol::StreamEventBody;
use crate::protocol::StreamDecodeError;

fn adapter() -> A2aAdapter {
	A2aAdapter::V0_3_0
}

#[test]
fn normalizes_both_wire_styles() {
	let a = adapter();
	assert_eq!(a.normalize_method("message/send"), Some(Method::SendMessage));
	assert_eq!(a.normalize_method("SendMessage"), Some(Method::SendMessage));
	assert_eq!(a.normalize_method("message/stream"), Some(Method::StreamMessage));
	assert_eq!(a.normalize_method("tasks/get"), Some(Method::GetTask));
	assert_eq!(
		a.normalize_method("tasks/pushNotificationConfig/set"),
		Some(Method::SetPushConfig)
	);
	assert_eq!(a.normalize_method("tasks/frobnicate"), None);
}

#[test]
fn emits_slash_form() {
	let a = adapter();
	assert_eq!(a.wire_method(Method::SendMessage), Some("message/send"));
	assert_eq!(
		a.wire_method(Method::DeletePushConfig),
		Some("tasks/pushNotificationConfig/delete")
	);
	// MCP methods have no A2A wire form.
	assert_eq!(a.wire_method(Method::CallTool), None);
}

#[test]
fn encode_places_params() {
	let a = adapter();
	let mut env = Envelope::new(Protocol::A2a, VERSION, Method::SendMessage, json!("1"));
	env.message = Some(json!({"role": "user", "parts": [{"text": "hi"}]}));
	env.task_id = Some("t9".to_string());
	env.context_id = Some("c1".to_string());
	env.metadata = Some(json!({"k": "v"}));
	let req = a.encode(&env).unwrap();
	assert_eq!(req.jsonrpc, "2.0");
	assert_eq!(req.method, "message/send");
	assert_eq!(req.id, Some(json!("1")));
	let params = req.params.unwrap();
	assert_eq!(params["message"]["role"], "user");
	// Task ids go out under both historical keys.
	assert_eq!(params["id"], "t9");
	assert_eq!(params["taskId"], "t9");
	assert_eq!(params["contextId"], "c1");
	assert_eq!(params["metadata"]["k"], "v");
}

#[test]
fn decode_encode_roundtrip() {
	let a = adapter();
	let req = jsonrpc::Request::new(
		json!(7),
		"message/send",
		Some(json!({
			"agentId": "a1",
			"message": {"role": "user"},
			"taskId": "t1",
			"contextId": "c1",
			"metadata": {"webhook": "http://hook"},
		})),
	);
	let env = a.decode(req).unwrap();
	assert_eq!(env.method, Method::SendMessage);
	assert_eq!(env.agent_id.as_deref(), Some("a1"));
	assert_eq!(env.task_id.as_deref(), Some("t1"));
	assert_eq!(env.context_id.as_deref(), Some("c1"));
	assert_eq!(env.webhook.as_deref(), Some("http://hook"));
	assert!(!env.streaming());

	let back = a.encode(&env).unwrap();
	assert_eq!(back.method, "message/send");
	let params = back.params.clone().unwrap();
	assert_eq!(params["message"]["role"], "user");
	assert_eq!(params["taskId"], "t1");
	assert_eq!(params["contextId"], "c1");

	// And the other direction: an encoded envelope decodes to itself.
	let again = a.decode(back).unwrap();
	assert_eq!(again.method, env.method);
	assert_eq!(again.task_id, env.task_id);
	assert_eq!(again.context_id, env.context_id);
	assert_eq!(again.message, env.message);
	assert_eq!(again.webhook, env.webhook);
	assert_eq!(again.rpc_id, env.rpc_id);
}

#[test]
fn decode_takes_id_when_task_id_absent() {
	let a = adapter();
	let req = jsonrpc::Request::new(json!(1), "tasks/get", Some(json!({"id": "t2"})));
	let env = a.decode(req).unwrap();
	assert_eq!(env.task_id.as_deref(), Some("t2"));
}

#[test]
fn streaming_flag_derived_from_method() {
	let a = adapter();
	let req = jsonrpc::Request::new(json!(1), "message/stream", Some(json!({"agentId": "a1"})));
	assert!(a.decode(req).unwrap().streaming());
	let req = jsonrpc::Request::new(json!(1), "tasks/subscribe", Some(json!({"taskId": "t1"})));
	assert!(a.decode(req).unwrap().streaming());
}

#[test]
fn stream_event_decode() {
	let a = adapter();
	assert_eq!(
		a.decode_stream_event("data: {\"jsonrpc\":\"2.0\",\"result\":{\"x\":1}}"),
		Ok(StreamEventBody::Ok(json!({"x": 1})))
	);
	assert_eq!(
		a.decode_stream_event("{\"error\":{\"code\":-32000,\"message\":\"boom\"}}"),
		Ok(StreamEventBody::Err(json!({"code": -32000, "message": "boom"})))
	);
	assert_eq!(a.decode_stream_event("data: not-json"), Err(StreamDecodeError));
	assert_eq!(a.decode_stream_event("data: {\"other\": 1}"), Err(StreamDecodeError));
}

#[test]
fn card_normalization_fills_defaults() {
	let a = adapter();
	let card = a.normalize_agent_card(json!({
		"name": "calc",
		"description": null,
		"skills": [{"id": "add", "name": "add"}],
	}));
	assert_eq!(card["version"], "1.0.0");
	assert_eq!(card["protocolVersion"], "0.3.0");
	assert_eq!(card["defaultInputModes"], json!(["text/plain"]));
	assert_eq!(card["defaultOutputModes"], json!(["text/plain"]));
	assert_eq!(card["skills"][0]["tags"], json!([]));
	assert_eq!(card["skills"][0]["examples"], json!([]));
	// Null top-level fields are dropped.
	assert!(card.get("description").is_none());
}

#[test]
fn card_validity_requires_name() {
	let a = adapter();
	assert!(a.valid_card(&json!({"name": "calc"})));
	assert!(!a.valid_card(&json!({"name": ""})));
	assert!(!a.valid_card(&json!({"url": "http://x"})));
}

#[test]
fn card_url_resolution() {
	let a = adapter();
	let agent = Agent {
		id: "a1".to_string(),
		url: "http://srv:9000/".to_string(),
		bearer: None,
		protocol: Protocol::A2a,
		protocol_version: None,
		metadata: json!(null),
	};
	assert_eq!(
		a.resolve_card_url(&agent).as_deref(),
		Some("http://srv:9000/.well-known/agent-card.json")
	);

	let pinned = Agent {
		metadata: json!({"agentCard": {"url": "http://other/card.json"}}),
		..agent
	};
	assert_eq!(
		a.resolve_card_url(&pinned).as_deref(),
		Some("http://other/card.json")
	);
}
