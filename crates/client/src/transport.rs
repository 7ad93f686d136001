//! Transport abstraction over one engine connection.
//!
//! A [`Transport`] owns the physical connections to engine processes and
//! exposes them as typed operations plus a lifecycle event stream. The
//! production implementation is [`crate::process::ProcessTransport`]; tests
//! substitute stubs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tandem_proto::{AnyNotification, AnyRequest, AnyResponse};
use tokio::sync::{mpsc, oneshot};

use crate::Result;

/// Stable identity of a client's engine slot, independent of restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineSlotId(pub u32);

/// Identity of one engine incarnation.
///
/// The slot survives restarts; the generation is bumped every time a new
/// process is spawned for it, so events from a dead incarnation are
/// detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
	/// The client's slot.
	pub slot: EngineSlotId,
	/// Incarnation counter, starting at 1.
	pub generation: u32,
}

impl EngineId {
	/// Build an id from raw slot and generation numbers.
	pub fn new(slot: u32, generation: u32) -> Self {
		Self {
			slot: EngineSlotId(slot),
			generation,
		}
	}
}

impl std::fmt::Display for EngineId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "engine#{}.{}", self.slot.0, self.generation)
	}
}

/// Connection lifecycle, as observed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
	/// Process spawn in progress.
	Starting,
	/// Process spawned, channel open.
	Running,
	/// Channel reached EOF; the process exited.
	Stopped,
	/// Channel broke mid-stream.
	Crashed,
}

/// Events emitted by a transport. `Status` with [`TransportStatus::Stopped`]
/// or [`TransportStatus::Crashed`] fires at most once per connection
/// instance.
#[derive(Debug)]
pub enum TransportEvent {
	/// Lifecycle change for one engine incarnation.
	Status {
		/// The incarnation the event belongs to.
		engine: EngineId,
		/// New status.
		status: TransportStatus,
	},
	/// Notification pushed by the engine.
	Notification {
		/// The incarnation the message came from.
		engine: EngineId,
		/// The message.
		notif: AnyNotification,
	},
	/// The transport itself is shutting down; no further events follow.
	Disconnected,
}

/// Result of a successful [`Transport::start`].
#[derive(Debug, Clone, Copy)]
pub struct StartedEngine {
	/// Identity of the new incarnation.
	pub id: EngineId,
}

/// Everything needed to spawn one engine incarnation.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
	/// Identity the incarnation will report events under.
	pub id: EngineId,
	/// Engine binary.
	pub command: PathBuf,
	/// Arguments.
	pub args: Vec<String>,
	/// Environment variables.
	pub env: HashMap<String, String>,
	/// Working directory (the workspace folder root).
	pub root_path: PathBuf,
}

/// One bidirectional, message-oriented connection per engine incarnation.
///
/// The transport performs no business logic: it serializes, frames, routes
/// replies to callers, and reports lifecycle changes. Request/notification
/// ordering within one incarnation follows the order calls are accepted.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Take the transport's event stream. Can be taken once.
	fn subscribe_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

	/// Spawn an engine incarnation.
	async fn start(&self, cfg: SpawnConfig) -> Result<StartedEngine>;

	/// Send a request and await its reply.
	///
	/// Fails with [`crate::Error::ChannelClosed`] when the incarnation's
	/// channel is gone and has not been replaced.
	async fn request(
		&self,
		engine: EngineId,
		req: AnyRequest,
		timeout: Option<Duration>,
	) -> Result<AnyResponse>;

	/// Send a notification. Best-effort: a closed channel is logged, not an
	/// error.
	async fn notify(&self, engine: EngineId, notif: AnyNotification) -> Result<()>;

	/// Send a notification and receive an ack once it has been written to
	/// the wire.
	async fn notify_with_barrier(
		&self,
		engine: EngineId,
		notif: AnyNotification,
	) -> Result<oneshot::Receiver<Result<()>>>;

	/// Kill an engine incarnation. Idempotent.
	async fn stop(&self, engine: EngineId) -> Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn engine_id_display_includes_generation() {
		assert_eq!(EngineId::new(3, 2).to_string(), "engine#3.2");
	}

	#[test]
	fn engine_ids_differ_across_generations() {
		assert_ne!(EngineId::new(1, 1), EngineId::new(1, 2));
		assert_eq!(EngineId::new(1, 2).slot, EngineId::new(1, 1).slot);
	}
}
