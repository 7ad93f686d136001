//! Wire protocol spoken between the Tandem editor client and the native
//! code-intelligence engine.
//!
//! The exchange is JSON-RPC shaped: framed request/response pairs plus
//! fire-and-forget notifications in both directions. This crate defines the
//! untyped envelopes the transport moves around ([`AnyRequest`],
//! [`AnyResponse`], [`AnyNotification`]) and the typed message set layered on
//! top of them via the [`Request`] and [`Notification`] marker traits.
//!
//! Positions, ranges and diagnostics reuse the [`lsp_types`] shapes; the
//! engine speaks the same geometry as the editor.
#![warn(missing_docs)]

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Re-export of the [`lsp_types`] dependency of this crate.
pub use lsp_types;

mod messages;
mod references;
mod types;

pub use messages::{
	DidChangeSettings, DidChangeSettingsParams, EngineDefaults, Exit, Initialize, InitializeParams,
	InitializeResult, PauseParsing, PublishDiagnostics, QueryDefaults, ReportStatus,
	ReportStatusParams, ResetDatabase, ResumeParsing, Shutdown,
};
pub use references::{
	CancelReferences, FindReferences, FindReferencesParams, ReferenceCategory, ReferenceItem,
	ReferencesKind, ReferencesPhase, ReferencesProgress, ReferencesProgressParams,
	ReferencesResult, ReferencesResultParams, RefreshReferences, TargetPhase, TargetProgress,
};
pub use types::{AnyNotification, AnyRequest, AnyResponse, RequestId, ResponseError};

/// A message sent to the engine that expects exactly one reply.
pub trait Request {
	/// Wire method name.
	const METHOD: &'static str;
	/// Parameter payload.
	type Params: Serialize + DeserializeOwned + Send;
	/// Reply payload.
	type Result: Serialize + DeserializeOwned + Send;
}

/// A fire-and-forget message, in either direction.
pub trait Notification {
	/// Wire method name.
	const METHOD: &'static str;
	/// Parameter payload.
	type Params: Serialize + DeserializeOwned + Send;
}
