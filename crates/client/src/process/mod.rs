//! Child-process transport.
//!
//! Spawns the engine binary and speaks the framed JSON-RPC protocol over its
//! stdin/stdout. One I/O task runs per incarnation; all outbound messages
//! funnel through a single queue for total write ordering.

mod io;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tandem_proto::{AnyNotification, AnyRequest, AnyResponse, RequestId};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::transport::{SpawnConfig, StartedEngine, Transport, TransportEvent, TransportStatus};
use crate::{EngineId, Error, Result};

/// Outbound message envelope for total ordering and barrier support.
pub(super) enum Outbound {
	Notify {
		notif: AnyNotification,
		written: Option<oneshot::Sender<Result<()>>>,
	},
	Request {
		request: AnyRequest,
		response_tx: oneshot::Sender<Result<AnyResponse>>,
	},
}

/// State for a running engine process.
struct EngineProcess {
	/// The child process handle.
	child: Child,
	/// Channel feeding the incarnation's I/O task.
	outbound_tx: mpsc::UnboundedSender<Outbound>,
}

/// Transport that runs engines as child processes.
pub struct ProcessTransport {
	/// Active engine processes.
	engines: RwLock<HashMap<EngineId, EngineProcess>>,
	/// Channel for emitting transport events to the router.
	event_tx: mpsc::UnboundedSender<TransportEvent>,
	/// Receiver handed out once via [`Transport::subscribe_events`].
	event_rx: RwLock<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
	/// Request id allocator, shared across incarnations.
	next_request_id: AtomicI64,
}

impl ProcessTransport {
	/// Create a new process transport.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn next_request_id(&self) -> RequestId {
		RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst))
	}

	/// Spawn the engine process and wire up its I/O task.
	fn spawn_engine(&self, cfg: &SpawnConfig) -> Result<EngineProcess> {
		let mut cmd = Command::new(&cfg.command);
		cmd.args(&cfg.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true);

		for (key, value) in &cfg.env {
			cmd.env(key, value);
		}
		cmd.current_dir(&cfg.root_path);

		let mut child = cmd.spawn().map_err(|e| Error::Spawn {
			engine: cfg.command.display().to_string(),
			reason: e.to_string(),
		})?;

		let stdin = child.stdin.take().ok_or_else(|| Error::Spawn {
			engine: cfg.command.display().to_string(),
			reason: "failed to capture stdin".into(),
		})?;
		let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
			engine: cfg.command.display().to_string(),
			reason: "failed to capture stdout".into(),
		})?;

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
		let event_tx = self.event_tx.clone();

		tokio::spawn(io::run_engine_io(cfg.id, stdin, stdout, outbound_rx, event_tx));

		Ok(EngineProcess { child, outbound_tx })
	}
}

impl Default for ProcessTransport {
	fn default() -> Self {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		Self {
			engines: RwLock::new(HashMap::new()),
			event_tx,
			event_rx: RwLock::new(Some(event_rx)),
			next_request_id: AtomicI64::new(1),
		}
	}
}

#[async_trait]
impl Transport for ProcessTransport {
	fn subscribe_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
		self.event_rx
			.write()
			.take()
			.ok_or_else(|| Error::Protocol("transport events already subscribed".into()))
	}

	async fn start(&self, cfg: SpawnConfig) -> Result<StartedEngine> {
		let id = cfg.id;

		tracing::info!(
			engine = %id,
			command = %cfg.command.display(),
			root = %cfg.root_path.display(),
			"Starting engine process"
		);

		let _ = self.event_tx.send(TransportEvent::Status {
			engine: id,
			status: TransportStatus::Starting,
		});

		let process = self.spawn_engine(&cfg)?;
		self.engines.write().insert(id, process);

		let _ = self.event_tx.send(TransportEvent::Status {
			engine: id,
			status: TransportStatus::Running,
		});

		Ok(StartedEngine { id })
	}

	async fn request(
		&self,
		engine: EngineId,
		req: AnyRequest,
		timeout: Option<Duration>,
	) -> Result<AnyResponse> {
		let request = AnyRequest {
			id: self.next_request_id(),
			..req
		};
		let method = request.method.clone();
		let (response_tx, response_rx) = oneshot::channel();

		{
			let engines = self.engines.read();
			let process = engines.get(&engine).ok_or(Error::ChannelClosed)?;
			process
				.outbound_tx
				.send(Outbound::Request {
					request,
					response_tx,
				})
				.map_err(|_| Error::ChannelClosed)?;
		}

		let timeout_duration = timeout.unwrap_or(Duration::from_secs(30));
		match tokio::time::timeout(timeout_duration, response_rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::ChannelClosed),
			Err(_) => Err(Error::RequestTimeout(method)),
		}
	}

	async fn notify(&self, engine: EngineId, notif: AnyNotification) -> Result<()> {
		let engines = self.engines.read();
		let Some(process) = engines.get(&engine) else {
			tracing::debug!(
				engine = %engine,
				method = %notif.method,
				"Notification dropped; engine not running"
			);
			return Ok(());
		};
		if process
			.outbound_tx
			.send(Outbound::Notify {
				notif,
				written: None,
			})
			.is_err()
		{
			tracing::debug!(engine = %engine, "Notification dropped; channel closed");
		}
		Ok(())
	}

	async fn notify_with_barrier(
		&self,
		engine: EngineId,
		notif: AnyNotification,
	) -> Result<oneshot::Receiver<Result<()>>> {
		let (tx, rx) = oneshot::channel();
		let engines = self.engines.read();
		let process = engines.get(&engine).ok_or(Error::ChannelClosed)?;
		process
			.outbound_tx
			.send(Outbound::Notify {
				notif,
				written: Some(tx),
			})
			.map_err(|_| Error::ChannelClosed)?;
		Ok(rx)
	}

	async fn stop(&self, engine: EngineId) -> Result<()> {
		let process = {
			let mut engines = self.engines.write();
			engines.remove(&engine)
		};

		let Some(mut process) = process else {
			return Ok(()); // idempotent
		};

		// Best-effort kill, then wait a bit.
		let _ = process.child.start_kill();
		let _ = tokio::time::timeout(Duration::from_secs(2), process.child.wait()).await;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	#[tokio::test]
	async fn start_fails_for_missing_binary() {
		let transport = ProcessTransport::new();
		let cfg = SpawnConfig {
			id: EngineId::new(1, 1),
			command: PathBuf::from("tandem-engine-does-not-exist"),
			args: Vec::new(),
			env: HashMap::new(),
			root_path: std::env::temp_dir(),
		};
		assert!(matches!(
			transport.start(cfg).await,
			Err(Error::Spawn { .. })
		));
	}

	#[tokio::test]
	async fn request_against_unknown_engine_reports_channel_closed() {
		let transport = ProcessTransport::new();
		let req = AnyRequest {
			id: RequestId::Number(0),
			method: "initialize".into(),
			params: serde_json::Value::Null,
		};
		assert!(matches!(
			transport.request(EngineId::new(9, 1), req, None).await,
			Err(Error::ChannelClosed)
		));
	}

	#[tokio::test]
	async fn notify_against_unknown_engine_is_best_effort() {
		let transport = ProcessTransport::new();
		let notif = AnyNotification {
			method: "engine/resetDatabase".into(),
			params: serde_json::Value::Null,
		};
		assert!(transport.notify(EngineId::new(9, 1), notif).await.is_ok());
	}

	#[tokio::test]
	async fn events_can_only_be_subscribed_once() {
		let transport = ProcessTransport::new();
		assert!(transport.subscribe_events().is_ok());
		assert!(transport.subscribe_events().is_err());
	}
}
