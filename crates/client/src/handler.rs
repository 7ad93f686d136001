//! Editor-facing event sink.
//!
//! The client pushes structured results into this trait; the editor
//! integration renders them (diagnostics, status bar text, progress
//! reporting). Implementations must be cheap and non-blocking — they are
//! called from the event router task.

use std::sync::Arc;

use lsp_types::{Diagnostic, Uri};

use crate::references::ReferencesProgressReport;

/// Sink for engine events destined for the editor UI.
pub trait ClientEventHandler: Send + Sync {
	/// New diagnostics for a document.
	fn on_diagnostics(&self, uri: Uri, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
		let _ = (uri, diagnostics, version);
	}

	/// Status-bar text pushed by the engine.
	fn on_status(&self, message: String) {
		let _ = message;
	}

	/// Throttled progress of the references/rename exchange.
	fn on_references_progress(&self, report: ReferencesProgressReport) {
		let _ = report;
	}

	/// The engine was restarted after a crash; `generation` identifies the
	/// new incarnation.
	fn on_engine_restarted(&self, generation: u32) {
		let _ = generation;
	}

	/// The crash supervisor gave up. Reported at most once per client.
	fn on_crash_loop(&self, message: String) {
		let _ = message;
	}
}

/// Shared handle to an event handler.
pub type SharedEventHandler = Arc<dyn ClientEventHandler>;

/// Handler that ignores every event.
pub struct NoOpEventHandler;

impl ClientEventHandler for NoOpEventHandler {}
