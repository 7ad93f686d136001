//! The references/rename exchange.
//!
//! Finding references is the one long-running engine operation: the client
//! kicks it off with a notification, the engine streams progress while it
//! confirms candidate locations file by file, and a single final result (or a
//! canceled partial result) closes the exchange. At most one exchange is
//! active per client at a time; the client side is responsible for
//! supersession and cancellation bookkeeping.

use lsp_types::{Location, Position, Uri};
use serde::{Deserialize, Serialize};

use crate::Notification;

/// What the caller intends to do with the reference set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferencesKind {
	/// Populate a reference listing.
	FindAll,
	/// Compute the edit set for a symbol rename.
	Rename,
}

/// Kick off a references/rename exchange.
#[derive(Debug)]
pub enum FindReferences {}

/// Parameters of [`FindReferences`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindReferencesParams {
	/// Document the symbol lives in.
	pub uri: Uri,
	/// Position of the symbol.
	pub position: Position,
	/// Find-all or rename.
	pub kind: ReferencesKind,
	/// Replacement name; only meaningful for [`ReferencesKind::Rename`].
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub new_name: Option<String>,
}

impl Notification for FindReferences {
	const METHOD: &'static str = "references/find";
	type Params = FindReferencesParams;
}

/// Ask the engine to abandon the exchange in flight. Advisory: the engine
/// answers with a final result flagged as canceled.
#[derive(Debug)]
pub enum CancelReferences {}

impl Notification for CancelReferences {
	const METHOD: &'static str = "references/cancel";
	type Params = ();
}

/// Ask the engine to re-deliver results for the query it already has,
/// without restarting the search.
#[derive(Debug)]
pub enum RefreshReferences {}

impl Notification for RefreshReferences {
	const METHOD: &'static str = "references/refresh";
	type Params = ();
}

/// Coarse phase of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferencesPhase {
	/// Exchange accepted by the engine.
	Started,
	/// Resolving the symbol at the request position.
	ProcessingSource,
	/// Confirming candidate locations across target files.
	ProcessingTargets,
	/// Final result is on its way.
	Finished,
}

/// Per-target-file sub-phase during [`ReferencesPhase::ProcessingTargets`].
///
/// A target moves through the sequence in order; the two waiting states are
/// distinct because lexing and parsing are scheduled separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetPhase {
	/// Queued for lexing.
	WaitingToLex,
	/// Lexing the target file.
	Lexing,
	/// Lexed, queued for parsing.
	WaitingToParse,
	/// Parsing the target file.
	Parsing,
	/// Confirming candidate hits against the parse.
	Confirming,
	/// Target fully processed.
	Finished,
}

/// Progress of one target file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProgress {
	/// Target file.
	pub uri: Uri,
	/// Where this target is in the pipeline.
	pub phase: TargetPhase,
}

/// Streamed progress notification from the engine.
#[derive(Debug)]
pub enum ReferencesProgress {}

/// Parameters of [`ReferencesProgress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencesProgressParams {
	/// Coarse phase.
	pub phase: ReferencesPhase,
	/// Per-target progress; populated during
	/// [`ReferencesPhase::ProcessingTargets`].
	#[serde(default)]
	pub targets: Vec<TargetProgress>,
}

impl Notification for ReferencesProgress {
	const METHOD: &'static str = "references/progress";
	type Params = ReferencesProgressParams;
}

/// How confident the engine is that a hit really refers to the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceCategory {
	/// Confirmed against a full parse.
	Confirmed,
	/// Text match inside a comment.
	Comment,
	/// Text match inside a string literal.
	InString,
	/// Text match in an inactive preprocessor region.
	Inactive,
	/// Candidate the engine could not confirm either way.
	CannotConfirm,
}

/// One entry of the final reference set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceItem {
	/// Where the hit is.
	pub location: Location,
	/// The line of source text containing the hit.
	pub text: String,
	/// Confirmation category.
	pub category: ReferenceCategory,
}

/// Final result notification closing the exchange.
#[derive(Debug)]
pub enum ReferencesResult {}

/// Parameters of [`ReferencesResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencesResultParams {
	/// True when the exchange was abandoned on request; `items` then holds
	/// whatever was confirmed before the cancellation took effect.
	#[serde(default)]
	pub canceled: bool,
	/// The reference set.
	#[serde(default)]
	pub items: Vec<ReferenceItem>,
}

impl Notification for ReferencesResult {
	const METHOD: &'static str = "references/result";
	type Params = ReferencesResultParams;
}
