//! I/O loop for a single engine process.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tandem_proto::{AnyNotification, AnyRequest, AnyResponse, RequestId};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use super::Outbound;
use crate::transport::{TransportEvent, TransportStatus};
use crate::{EngineId, Error, Result};

type PendingMap = HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>>;

/// Runs the I/O loop for one engine incarnation.
///
/// Drives outbound writes and inbound reads concurrently; routes replies to
/// their pending requests and forwards notifications as transport events.
/// Exactly one terminal status event is emitted: `Stopped` on EOF, `Crashed`
/// on a broken stream.
pub(super) async fn run_engine_io(
	id: EngineId,
	mut stdin: tokio::process::ChildStdin,
	stdout: tokio::process::ChildStdout,
	mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
	event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
	let mut reader = BufReader::new(stdout);
	let mut pending: PendingMap = HashMap::new();
	let mut read_buf = String::new();

	loop {
		tokio::select! {
			// Handle all outbound messages sequentially for total ordering.
			Some(out) = outbound_rx.recv() => {
				if write_outbound(id, &mut stdin, out, &mut pending).await {
					let _ = event_tx.send(TransportEvent::Status {
						engine: id,
						status: TransportStatus::Crashed,
					});
					break;
				}
			}

			// Handle inbound messages from the engine.
			result = read_frame(&mut reader, &mut read_buf) => {
				match result {
					Ok(Some(msg)) => {
						handle_inbound(id, msg, &mut pending, &event_tx);
					}
					Ok(None) => {
						tracing::info!(engine = %id, "Engine closed its connection");
						let _ = event_tx.send(TransportEvent::Status {
							engine: id,
							status: TransportStatus::Stopped,
						});
						break;
					}
					Err(err) => {
						tracing::error!(engine = %id, error = %err, "Error reading from engine");
						let _ = event_tx.send(TransportEvent::Status {
							engine: id,
							status: TransportStatus::Crashed,
						});
						break;
					}
				}
			}
		}
	}

	// Fail requests that never got a reply.
	for (_, tx) in pending {
		let _ = tx.send(Err(Error::ChannelClosed));
	}

	// Fail senders still parked in the outbound queue.
	while let Ok(out) = outbound_rx.try_recv() {
		match out {
			Outbound::Notify {
				written: Some(tx), ..
			} => {
				let _ = tx.send(Err(Error::ChannelClosed));
			}
			Outbound::Request { response_tx, .. } => {
				let _ = response_tx.send(Err(Error::ChannelClosed));
			}
			Outbound::Notify { written: None, .. } => {}
		}
	}
}

/// Serializes and writes one outbound message. Returns true when the channel
/// is unusable and the loop must terminate.
async fn write_outbound<W>(
	id: EngineId,
	stdin: &mut W,
	out: Outbound,
	pending: &mut PendingMap,
) -> bool
where
	W: AsyncWrite + Unpin,
{
	match out {
		Outbound::Notify { notif, written } => {
			let payload = match notification_payload(&notif) {
				Ok(payload) => payload,
				Err(err) => {
					tracing::warn!(engine = %id, method = %notif.method, error = %err, "Dropping unserializable notification");
					if let Some(tx) = written {
						let _ = tx.send(Err(err));
					}
					return false;
				}
			};
			match write_frame(stdin, &payload).await {
				Ok(()) => {
					if let Some(tx) = written {
						let _ = tx.send(Ok(()));
					}
					false
				}
				Err(err) => {
					tracing::error!(engine = %id, error = %err, "Engine write failed; closing channel");
					if let Some(tx) = written {
						let _ = tx.send(Err(Error::ChannelClosed));
					}
					true
				}
			}
		}
		Outbound::Request {
			request,
			response_tx,
		} => {
			let payload = match request_payload(&request) {
				Ok(payload) => payload,
				Err(err) => {
					let _ = response_tx.send(Err(err));
					return false;
				}
			};
			match write_frame(stdin, &payload).await {
				Ok(()) => {
					pending.insert(request.id, response_tx);
					false
				}
				Err(err) => {
					tracing::error!(engine = %id, error = %err, "Engine write failed; closing channel");
					let _ = response_tx.send(Err(Error::ChannelClosed));
					true
				}
			}
		}
	}
}

fn request_payload(req: &AnyRequest) -> Result<String> {
	serde_json::to_string(&serde_json::json!({
		"jsonrpc": "2.0",
		"id": req.id,
		"method": req.method,
		"params": req.params,
	}))
	.map_err(Into::into)
}

fn notification_payload(notif: &AnyNotification) -> Result<String> {
	serde_json::to_string(&serde_json::json!({
		"jsonrpc": "2.0",
		"method": notif.method,
		"params": notif.params,
	}))
	.map_err(Into::into)
}

/// Writes one framed message.
async fn write_frame<W>(writer: &mut W, payload: &str) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let msg = format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload);
	writer.write_all(msg.as_bytes()).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one framed message. `Ok(None)` signals a clean EOF.
async fn read_frame<R>(reader: &mut R, buf: &mut String) -> Result<Option<JsonValue>>
where
	R: AsyncBufRead + Unpin,
{
	// Read headers.
	let mut content_length: Option<usize> = None;
	loop {
		buf.clear();
		let bytes_read = reader.read_line(buf).await?;
		if bytes_read == 0 {
			return Ok(None);
		}

		let line = buf.trim();
		if line.is_empty() {
			break;
		}

		if let Some(len_str) = line.strip_prefix("Content-Length: ") {
			content_length = len_str.parse().ok();
		}
	}

	let length = content_length.ok_or_else(|| Error::Protocol("missing Content-Length".into()))?;

	// Read body.
	let mut body = vec![0u8; length];
	reader.read_exact(&mut body).await?;

	let json: JsonValue = serde_json::from_slice(&body)?;
	Ok(Some(json))
}

/// Routes one inbound message.
fn handle_inbound(
	id: EngineId,
	msg: JsonValue,
	pending: &mut PendingMap,
	event_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
	let has_id = msg.get("id").is_some();
	let has_method = msg.get("method").is_some();

	// A response: has "id" but no "method".
	if has_id && !has_method {
		let resp: AnyResponse = match serde_json::from_value(msg) {
			Ok(resp) => resp,
			Err(err) => {
				tracing::warn!(engine = %id, error = %err, "Failed to parse engine response");
				return;
			}
		};

		if let Some(tx) = pending.remove(&resp.id) {
			let _ = tx.send(Ok(resp));
		} else {
			tracing::debug!(engine = %id, id = %resp.id, "Response for unknown request");
		}
		return;
	}

	// A notification: has "method" but no "id".
	if has_method && !has_id {
		let method = msg
			.get("method")
			.and_then(|m| m.as_str())
			.unwrap_or_default()
			.to_string();
		let params = msg.get("params").cloned().unwrap_or(JsonValue::Null);
		let _ = event_tx.send(TransportEvent::Notification {
			engine: id,
			notif: AnyNotification { method, params },
		});
		return;
	}

	// The engine never initiates requests; anything with both fields is a
	// protocol violation.
	tracing::warn!(engine = %id, "Unexpected engine-initiated request; dropping");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frames_round_trip() {
		let (mut client, server) = tokio::io::duplex(1024);
		let payload = r#"{"jsonrpc":"2.0","method":"engine/reportStatus","params":{"message":"Indexing"}}"#;
		write_frame(&mut client, payload).await.unwrap();

		let mut reader = BufReader::new(server);
		let mut buf = String::new();
		let msg = read_frame(&mut reader, &mut buf).await.unwrap().unwrap();
		assert_eq!(msg["method"], "engine/reportStatus");
		assert_eq!(msg["params"]["message"], "Indexing");
	}

	#[tokio::test]
	async fn read_frame_reports_clean_eof() {
		let (client, server) = tokio::io::duplex(64);
		drop(client);

		let mut reader = BufReader::new(server);
		let mut buf = String::new();
		assert!(read_frame(&mut reader, &mut buf).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn read_frame_rejects_missing_content_length() {
		let (mut client, server) = tokio::io::duplex(64);
		client.write_all(b"Content-Type: json\r\n\r\n").await.unwrap();
		drop(client);

		let mut reader = BufReader::new(server);
		let mut buf = String::new();
		assert!(matches!(
			read_frame(&mut reader, &mut buf).await,
			Err(Error::Protocol(_))
		));
	}

	#[tokio::test]
	async fn request_payload_carries_the_assigned_id() {
		let req = AnyRequest {
			id: RequestId::Number(41),
			method: "initialize".into(),
			params: serde_json::json!({"processId": 7}),
		};
		let payload: JsonValue = serde_json::from_str(&request_payload(&req).unwrap()).unwrap();
		assert_eq!(payload["id"], 41);
		assert_eq!(payload["jsonrpc"], "2.0");
	}
}
