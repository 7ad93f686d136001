//! Engine protocol messages outside the references exchange.
//!
//! The handshake and lifecycle messages reuse the standard JSON-RPC method
//! names; engine-specific operations live under the `engine/` prefix.

use lsp_types::Uri;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Notification, Request};

/// Initialization handshake. Sent once per engine incarnation; the client is
/// not ready until the reply arrives.
#[derive(Debug)]
pub enum Initialize {}

/// Parameters of the [`Initialize`] handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
	/// Process id of the host editor, for orphan detection in the engine.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub process_id: Option<u32>,
	/// Root of the workspace folder this client serves.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub root_uri: Option<Uri>,
	/// Initial settings snapshot.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub settings: Option<JsonValue>,
}

/// Reply to the [`Initialize`] handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
	/// Engine build identifier.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub engine_version: Option<String>,
}

impl Request for Initialize {
	const METHOD: &'static str = "initialize";
	type Params = InitializeParams;
	type Result = InitializeResult;
}

/// Graceful shutdown request, sent before [`Exit`].
#[derive(Debug)]
pub enum Shutdown {}

impl Request for Shutdown {
	const METHOD: &'static str = "shutdown";
	type Params = ();
	type Result = ();
}

/// Final notification before the engine process is expected to exit.
#[derive(Debug)]
pub enum Exit {}

impl Notification for Exit {
	const METHOD: &'static str = "exit";
	type Params = ();
}

/// Ask the engine for the configuration it would use in the absence of any
/// user-provided one (detected compiler, system include paths, standard).
#[derive(Debug)]
pub enum QueryDefaults {}

/// Engine-detected default configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDefaults {
	/// Detected compiler, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub compiler_path: Option<String>,
	/// System include search path.
	#[serde(default)]
	pub include_path: Vec<String>,
	/// Language standard the compiler defaults to.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub standard: Option<String>,
}

impl Request for QueryDefaults {
	const METHOD: &'static str = "engine/queryDefaults";
	type Params = ();
	type Result = EngineDefaults;
}

/// Settings snapshot push.
#[derive(Debug)]
pub enum DidChangeSettings {}

/// Parameters of [`DidChangeSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidChangeSettingsParams {
	/// Opaque settings blob; the engine owns its interpretation.
	pub settings: JsonValue,
}

impl Notification for DidChangeSettings {
	const METHOD: &'static str = "engine/didChangeSettings";
	type Params = DidChangeSettingsParams;
}

/// Discard the engine's symbol database and re-index from scratch.
#[derive(Debug)]
pub enum ResetDatabase {}

impl Notification for ResetDatabase {
	const METHOD: &'static str = "engine/resetDatabase";
	type Params = ();
}

/// Suspend background parsing.
#[derive(Debug)]
pub enum PauseParsing {}

impl Notification for PauseParsing {
	const METHOD: &'static str = "engine/pauseParsing";
	type Params = ();
}

/// Resume background parsing after [`PauseParsing`].
#[derive(Debug)]
pub enum ResumeParsing {}

impl Notification for ResumeParsing {
	const METHOD: &'static str = "engine/resumeParsing";
	type Params = ();
}

/// Diagnostics push from the engine.
#[derive(Debug)]
pub enum PublishDiagnostics {}

impl Notification for PublishDiagnostics {
	const METHOD: &'static str = "textDocument/publishDiagnostics";
	type Params = lsp_types::PublishDiagnosticsParams;
}

/// Status-bar text push from the engine.
#[derive(Debug)]
pub enum ReportStatus {}

/// Parameters of [`ReportStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStatusParams {
	/// Short human-readable status line.
	pub message: String,
}

impl Notification for ReportStatus {
	const METHOD: &'static str = "engine/reportStatus";
	type Params = ReportStatusParams;
}
