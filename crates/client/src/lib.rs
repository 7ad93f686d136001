//! Editor-side client for the Tandem native code-intelligence engine.
//!
//! The engine runs as a child process and speaks a JSON-RPC shaped protocol
//! over stdio ([`tandem_proto`]). This crate owns everything between the
//! editor and that process:
//!
//! - the [`transport::Transport`] abstraction and its child-process
//!   implementation ([`process::ProcessTransport`]),
//! - the [`gate::ReadinessGate`] that holds every operation back until the
//!   initialization handshake completes,
//! - the [`queue::TaskQueue`] that drains deferred operations strictly in
//!   submission order once the gate opens,
//! - the [`crash::CrashSupervisor`] that decides between transparent restart
//!   and giving up after repeated crashes,
//! - the [`references::ReferencesCoordinator`] driving the long-running,
//!   cancelable find-references / rename exchange.
//!
//! ```text
//! ┌────────┐   events    ┌────────────────┐   requests    ┌────────────┐
//! │ Editor │────────────▶│ ClientRegistry │──────────────▶│   Engine   │
//! │  (UI)  │◀────────────│  Client (gate, │◀──────────────│ (process)  │
//! └────────┘ handler sink│  queue, refs)  │ notifications └────────────┘
//!                        └────────────────┘
//! ```
#![warn(missing_docs)]

use std::path::Path;

use lsp_types::Uri;
use tandem_proto::ResponseError;

pub mod client;
pub mod config;
pub mod crash;
pub mod gate;
pub mod handler;
pub mod process;
pub mod queue;
pub mod references;
pub mod registry;
pub mod transport;

pub use client::{ActiveClient, Client};
pub use config::{CrashPolicy, EngineConfig, engine_binary, locate_engine};
pub use crash::{CrashHistory, CrashSupervisor, CrashVerdict, SupervisorState};
pub use gate::{GateFailure, GateState, ReadinessGate};
pub use handler::{ClientEventHandler, NoOpEventHandler, SharedEventHandler};
pub use process::ProcessTransport;
pub use queue::{TaskHandle, TaskQueue};
pub use references::{
	ReferencesCoordinator, ReferencesOutcome, ReferencesProgressReport, ReferencesTicket,
	ReferencesWire, ResultMode,
};
pub use registry::ClientRegistry;
pub use transport::{
	EngineId, EngineSlotId, SpawnConfig, StartedEngine, Transport, TransportEvent, TransportStatus,
};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The client's dispatch machinery was torn down.
	#[error("service stopped")]
	ServiceStopped,
	/// The engine connection closed and has not been replaced yet.
	#[error("engine channel closed")]
	ChannelClosed,
	/// The client is permanently unusable on this host (missing or broken
	/// engine binary, failed handshake). Never retried.
	#[error("code intelligence is unsupported for this client")]
	Unsupported,
	/// The engine crashed repeatedly and restarts are disabled.
	#[error("engine crashed too often; code intelligence disabled")]
	CrashLoop,
	/// A bounded-deadline operation did not complete in time.
	#[error("request timed out: {0}")]
	RequestTimeout(String),
	/// The engine process could not be spawned.
	#[error("failed to spawn engine `{engine}`: {reason}")]
	Spawn {
		/// Binary that was launched.
		engine: String,
		/// What went wrong.
		reason: String,
	},
	/// The engine replied with an error payload.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// The peer sent undecodable or invalid payloads.
	#[error("deserialization failed: {0}")]
	Deserialize(#[from] serde_json::Error),
	/// The peer violated the wire protocol.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// Input/output errors from the underlying channels.
	#[error("{0}")]
	Io(#[from] std::io::Error),
}

/// Build a `file://` URI from a filesystem path.
pub fn uri_from_path(path: &Path) -> Option<Uri> {
	let path = path.to_str()?;
	let raw = if path.starts_with('/') {
		format!("file://{path}")
	} else {
		format!("file:///{}", path.replace('\\', "/"))
	};
	raw.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uri_from_path_roundtrips_unix_paths() {
		let uri = uri_from_path(Path::new("/work/src/main.cpp")).unwrap();
		assert_eq!(uri.as_str(), "file:///work/src/main.cpp");
	}
}
