//! Per-folder engine client.
//!
//! One [`Client`] serves one open workspace folder. The active variant owns
//! the engine slot, the readiness gate, the deferred-operation queue, the
//! crash supervisor and the references coordinator; the null variant stands
//! in when the host cannot run the engine at all, so callers always hold a
//! client and dispatch is a match instead of a maze of optional callbacks.
//!
//! # Lifecycle
//!
//! ```ignore
//! let registry = ClientRegistry::new(transport, handler);
//! registry.spawn_router()?;
//! let client = registry.open_folder(folder, config).await;
//!
//! // Operations enqueue until the handshake completes, then drain in order.
//! let defaults = client.query_defaults().await?;
//! ```
//!
//! An unexpected channel close is routed to the crash supervisor: within
//! policy the engine is respawned under a bumped generation and the gate is
//! reset for the fresh handshake; outside policy the client goes dead and
//! reports a crash loop once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::future::BoxFuture;
use lsp_types::{Position, Uri};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tandem_proto::{
	AnyNotification, AnyRequest, CancelReferences, DidChangeSettings, DidChangeSettingsParams,
	EngineDefaults, Exit, FindReferences, Initialize, InitializeParams, InitializeResult,
	Notification, PauseParsing, PublishDiagnostics, QueryDefaults, ReferencesKind,
	ReferencesProgress, ReferencesResult, RefreshReferences, ReportStatus, Request, RequestId,
	ResetDatabase, ResumeParsing, Shutdown,
};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::crash::{CrashSupervisor, CrashVerdict};
use crate::gate::{GateFailure, GateState, ReadinessGate};
use crate::handler::SharedEventHandler;
use crate::queue::TaskQueue;
use crate::references::{
	ReferencesCoordinator, ReferencesOutcome, ReferencesWire, ResultMode,
};
use crate::transport::{EngineId, SpawnConfig, Transport, TransportEvent, TransportStatus};
use crate::{Error, Result, uri_from_path};

/// A client for one workspace folder.
#[derive(Clone)]
pub enum Client {
	/// Fully functional client backed by an engine process.
	Active(Arc<ActiveClient>),
	/// Stand-in for hosts where the engine cannot run.
	Null,
}

impl Client {
	/// True for the active variant.
	pub fn is_active(&self) -> bool {
		matches!(self, Client::Active(_))
	}

	/// True once the engine handshake has completed.
	pub fn is_ready(&self) -> bool {
		match self {
			Client::Active(client) => client.is_ready(),
			Client::Null => false,
		}
	}

	/// Query the engine's detected default configuration.
	pub async fn query_defaults(&self) -> Result<EngineDefaults> {
		match self {
			Client::Active(client) => client.query_defaults().await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Push a settings snapshot to the engine.
	pub async fn did_change_settings(&self, settings: Value) -> Result<()> {
		match self {
			Client::Active(client) => client.did_change_settings(settings).await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Discard the engine's symbol database and re-index.
	pub async fn reset_database(&self) -> Result<()> {
		match self {
			Client::Active(client) => client.reset_database().await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Suspend background parsing.
	pub async fn pause_parsing(&self) -> Result<()> {
		match self {
			Client::Active(client) => client.pause_parsing().await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Resume background parsing.
	pub async fn resume_parsing(&self) -> Result<()> {
		match self {
			Client::Active(client) => client.resume_parsing().await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Find all references to the symbol at `position`.
	pub async fn find_all_references(
		&self,
		mode: ResultMode,
		uri: Uri,
		position: Position,
	) -> Result<ReferencesOutcome> {
		match self {
			Client::Active(client) => client.find_all_references(mode, uri, position).await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Rename the symbol at `position`.
	pub async fn rename(
		&self,
		uri: Uri,
		position: Position,
		new_name: String,
	) -> Result<ReferencesOutcome> {
		match self {
			Client::Active(client) => client.rename(uri, position, new_name).await,
			Client::Null => Err(Error::Unsupported),
		}
	}

	/// Cancel the outstanding references/rename exchange, if any. Resolves
	/// once the engine confirms.
	pub async fn cancel_references(&self) -> Result<()> {
		match self {
			Client::Active(client) => client.cancel_references().await,
			Client::Null => Ok(()),
		}
	}

	/// A tracked document changed.
	pub fn on_document_edited(&self) {
		match self {
			Client::Active(client) => client.on_document_edited(),
			Client::Null => {}
		}
	}

	/// Tear the client down: graceful engine shutdown, then kill.
	pub async fn dispose(&self) {
		match self {
			Client::Active(client) => client.dispose().await,
			Client::Null => {}
		}
	}
}

/// The working client variant.
pub struct ActiveClient {
	folder: PathBuf,
	config: EngineConfig,
	command: PathBuf,
	transport: Arc<dyn Transport>,
	/// Current engine incarnation. Bumped on restart; events carrying any
	/// other id are stale.
	engine: Arc<RwLock<EngineId>>,
	gate: Arc<ReadinessGate>,
	queue: TaskQueue,
	supervisor: Mutex<CrashSupervisor>,
	references: ReferencesCoordinator,
	handler: SharedEventHandler,
	last_defaults: Mutex<Option<EngineDefaults>>,
	disposing: AtomicBool,
	crash_reported: AtomicBool,
}

impl ActiveClient {
	/// Spawn the first engine incarnation for a folder and kick off its
	/// handshake in the background. Operations enqueue until it completes.
	pub(crate) async fn launch(
		slot: u32,
		folder: &Path,
		command: PathBuf,
		config: EngineConfig,
		transport: Arc<dyn Transport>,
		handler: SharedEventHandler,
	) -> Result<Arc<Self>> {
		let id = EngineId::new(slot, 1);
		let engine = Arc::new(RwLock::new(id));
		let gate = Arc::new(ReadinessGate::new());

		let wire = EngineWire::spawn(transport.clone(), engine.clone());
		let references =
			ReferencesCoordinator::new(Arc::new(wire), handler.clone(), config.progress_interval());

		let client = Arc::new(Self {
			folder: folder.to_path_buf(),
			command,
			transport: transport.clone(),
			engine,
			gate: gate.clone(),
			queue: TaskQueue::new(gate),
			supervisor: Mutex::new(CrashSupervisor::new(config.crash)),
			references,
			handler,
			last_defaults: Mutex::new(None),
			disposing: AtomicBool::new(false),
			crash_reported: AtomicBool::new(false),
			config,
		});

		transport.start(client.spawn_config(id)).await?;

		let this = client.clone();
		tokio::spawn(async move {
			if let Err(err) = this.handshake().await {
				this.handshake_failed(err);
			}
		});

		Ok(client)
	}

	/// The workspace folder this client serves.
	pub fn folder(&self) -> &Path {
		&self.folder
	}

	/// The current engine incarnation.
	pub fn engine_id(&self) -> EngineId {
		*self.engine.read()
	}

	/// True once the handshake has completed and no restart is in progress.
	pub fn is_ready(&self) -> bool {
		self.gate.is_ready()
	}

	/// Current supervisor state.
	pub fn supervisor_state(&self) -> crate::crash::SupervisorState {
		self.supervisor.lock().state()
	}

	fn spawn_config(&self, id: EngineId) -> SpawnConfig {
		SpawnConfig {
			id,
			command: self.command.clone(),
			args: self.config.args.clone(),
			env: self.config.env.clone(),
			root_path: self.folder.clone(),
		}
	}

	/// Run the initialization handshake against the current incarnation and
	/// open the gate.
	async fn handshake(&self) -> Result<InitializeResult> {
		let params = InitializeParams {
			process_id: Some(std::process::id()),
			root_uri: uri_from_path(&self.folder),
			settings: self.config.settings.clone(),
		};
		let result = self.request_now::<Initialize>(params).await?;

		tracing::info!(
			engine = %self.engine_id(),
			version = result.engine_version.as_deref().unwrap_or("unknown"),
			"Engine handshake complete"
		);

		self.supervisor.lock().on_handshake_complete();
		self.gate.set();
		Ok(result)
	}

	/// A handshake ended in an error. A channel close is left to the crash
	/// path, which owns the restart decision; anything else marks the client
	/// unsupported.
	fn handshake_failed(&self, err: Error) {
		if matches!(err, Error::ChannelClosed) {
			tracing::warn!(
				folder = %self.folder.display(),
				"Handshake interrupted by channel close"
			);
			return;
		}
		tracing::warn!(
			folder = %self.folder.display(),
			error = %err,
			"Engine handshake failed; client is unsupported"
		);
		self.gate.fail(GateFailure::Unsupported);
	}

	/// Send a request against the current incarnation without waiting for
	/// the gate. Only the handshake and teardown paths use this.
	async fn request_now<R: Request>(&self, params: R::Params) -> Result<R::Result> {
		let req = AnyRequest {
			id: RequestId::Number(0),
			method: R::METHOD.into(),
			params: serde_json::to_value(params)?,
		};
		let engine = self.engine_id();
		let resp = self
			.transport
			.request(engine, req, Some(self.config.request_timeout()))
			.await?;
		match resp.error {
			Some(err) => Err(Error::Response(err)),
			None => Ok(serde_json::from_value(resp.result.unwrap_or_default())?),
		}
	}

	/// Enqueue a request to run once the gate opens. Provider adapters route
	/// through here so editor callouts never touch the channel early.
	pub async fn request_when_ready<R: Request + 'static>(
		self: &Arc<Self>,
		params: R::Params,
	) -> Result<R::Result>
	where
		R::Params: 'static,
		R::Result: 'static,
	{
		self.fail_fast()?;
		let this = self.clone();
		self.queue
			.enqueue(move || async move { this.request_now::<R>(params).await })
			.await
	}

	/// Enqueue a notification to run once the gate opens, preserving
	/// submission order against other queued operations.
	pub async fn notify_when_ready<N: Notification + 'static>(
		self: &Arc<Self>,
		params: N::Params,
	) -> Result<()>
	where
		N::Params: 'static,
	{
		self.fail_fast()?;
		self.queue.enqueue(self.notify_thunk::<N>(params)).await
	}

	/// Like [`notify_when_ready`](Self::notify_when_ready), but nothing
	/// enqueued afterwards starts until this notification has been written.
	async fn notify_blocking<N: Notification + 'static>(
		self: &Arc<Self>,
		params: N::Params,
	) -> Result<()>
	where
		N::Params: 'static,
	{
		self.fail_fast()?;
		self.queue
			.enqueue_blocking(self.notify_thunk::<N>(params))
			.await
	}

	fn notify_thunk<N: Notification + 'static>(
		self: &Arc<Self>,
		params: N::Params,
	) -> impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static
	where
		N::Params: 'static,
	{
		let this = self.clone();
		move || -> BoxFuture<'static, Result<()>> {
			Box::pin(async move {
				let notif = AnyNotification {
					method: N::METHOD.into(),
					params: serde_json::to_value(params)?,
				};
				this.transport.notify(this.engine_id(), notif).await
			})
		}
	}

	/// Entry points short-circuit once the client is terminally failed,
	/// before ever awaiting the gate.
	fn fail_fast(&self) -> Result<()> {
		match self.gate.state() {
			GateState::Failed(failure) => Err(failure.into()),
			GateState::Unset | GateState::Ready => Ok(()),
		}
	}

	/// Query the engine's detected default configuration.
	///
	/// Bounded by the provider deadline: on expiry the last known defaults
	/// are returned instead of blocking the editor, and only a client that
	/// never obtained any defaults sees [`Error::RequestTimeout`].
	pub async fn query_defaults(self: &Arc<Self>) -> Result<EngineDefaults> {
		let deadline = self.config.provider_timeout();
		match tokio::time::timeout(deadline, self.request_when_ready::<QueryDefaults>(())).await {
			Ok(Ok(defaults)) => {
				*self.last_defaults.lock() = Some(defaults.clone());
				Ok(defaults)
			}
			Ok(Err(err)) => Err(err),
			Err(_) => {
				let cached = self.last_defaults.lock().clone();
				match cached {
					Some(defaults) => {
						tracing::warn!(
							folder = %self.folder.display(),
							"Default-configuration query timed out; using last known defaults"
						);
						Ok(defaults)
					}
					None => Err(Error::RequestTimeout(QueryDefaults::METHOD.into())),
				}
			}
		}
	}

	/// Push a settings snapshot to the engine. Blocking: operations enqueued
	/// afterwards run against the new settings.
	pub async fn did_change_settings(self: &Arc<Self>, settings: Value) -> Result<()> {
		self.notify_blocking::<DidChangeSettings>(DidChangeSettingsParams { settings })
			.await
	}

	/// Discard the engine's symbol database and re-index.
	pub async fn reset_database(self: &Arc<Self>) -> Result<()> {
		self.notify_when_ready::<ResetDatabase>(()).await
	}

	/// Suspend background parsing.
	pub async fn pause_parsing(self: &Arc<Self>) -> Result<()> {
		self.notify_when_ready::<PauseParsing>(()).await
	}

	/// Resume background parsing.
	pub async fn resume_parsing(self: &Arc<Self>) -> Result<()> {
		self.notify_when_ready::<ResumeParsing>(()).await
	}

	/// Find all references to the symbol at `position`.
	pub async fn find_all_references(
		&self,
		mode: ResultMode,
		uri: Uri,
		position: Position,
	) -> Result<ReferencesOutcome> {
		self.fail_fast()?;
		self.gate.ready().await.map_err(Error::from)?;
		Ok(self
			.references
			.request(ReferencesKind::FindAll, mode, uri, position, None)
			.await)
	}

	/// Rename the symbol at `position` to `new_name`.
	pub async fn rename(
		&self,
		uri: Uri,
		position: Position,
		new_name: String,
	) -> Result<ReferencesOutcome> {
		self.fail_fast()?;
		self.gate.ready().await.map_err(Error::from)?;
		Ok(self
			.references
			.request(
				ReferencesKind::Rename,
				ResultMode::OneShot,
				uri,
				position,
				Some(new_name),
			)
			.await)
	}

	/// Cancel the outstanding references/rename exchange, if any.
	pub async fn cancel_references(&self) -> Result<()> {
		self.references
			.cancel()
			.await
			.map_err(|_| Error::ServiceStopped)
	}

	/// A tracked document changed; outstanding rename state is invalid.
	pub fn on_document_edited(&self) {
		self.references.on_document_edited();
	}

	/// Route one transport event into the client.
	pub(crate) fn handle_event(self: &Arc<Self>, event: TransportEvent) {
		match event {
			TransportEvent::Status { engine, status } => {
				if engine != self.engine_id() {
					tracing::debug!(engine = %engine, "Dropping status event from stale incarnation");
					return;
				}
				match status {
					TransportStatus::Stopped | TransportStatus::Crashed => {
						self.handle_channel_closed();
					}
					TransportStatus::Starting | TransportStatus::Running => {
						tracing::debug!(engine = %engine, status = ?status, "Engine status update");
					}
				}
			}
			TransportEvent::Notification { engine, notif } => {
				if engine != self.engine_id() {
					tracing::debug!(
						engine = %engine,
						method = %notif.method,
						"Dropping notification from stale incarnation"
					);
					return;
				}
				self.handle_notification(notif);
			}
			TransportEvent::Disconnected => {}
		}
	}

	/// Dispatch an engine notification. Malformed payloads are logged and
	/// dropped at this boundary, never forwarded.
	fn handle_notification(&self, notif: AnyNotification) {
		match notif.method.as_str() {
			m if m == PublishDiagnostics::METHOD => {
				match serde_json::from_value::<lsp_types::PublishDiagnosticsParams>(notif.params) {
					Ok(params) => {
						self.handler
							.on_diagnostics(params.uri, params.diagnostics, params.version);
					}
					Err(err) => {
						tracing::warn!(error = %err, "Dropping malformed diagnostics payload");
					}
				}
			}
			m if m == ReportStatus::METHOD => {
				match serde_json::from_value::<tandem_proto::ReportStatusParams>(notif.params) {
					Ok(params) => self.handler.on_status(params.message),
					Err(err) => {
						tracing::warn!(error = %err, "Dropping malformed status payload");
					}
				}
			}
			m if m == ReferencesProgress::METHOD => {
				match serde_json::from_value(notif.params) {
					Ok(params) => self.references.on_progress(params, Instant::now()),
					Err(err) => {
						tracing::warn!(error = %err, "Dropping malformed references progress");
					}
				}
			}
			m if m == ReferencesResult::METHOD => match serde_json::from_value(notif.params) {
				Ok(params) => self.references.on_result(params),
				Err(err) => {
					tracing::warn!(error = %err, "Dropping malformed references result");
				}
			},
			method => {
				tracing::debug!(method = %method, "Unhandled engine notification");
			}
		}
	}

	/// The channel to the current incarnation closed without a dispose.
	fn handle_channel_closed(self: &Arc<Self>) {
		if self.disposing.load(Ordering::SeqCst) {
			return;
		}

		let verdict = self.supervisor.lock().on_channel_closed(Instant::now());
		match verdict {
			CrashVerdict::Restart => {
				tracing::warn!(
					engine = %self.engine_id(),
					folder = %self.folder.display(),
					"Engine channel closed unexpectedly; restarting"
				);
				self.gate.reset();
				let this = self.clone();
				tokio::spawn(async move {
					this.restart_engine().await;
				});
			}
			CrashVerdict::GiveUp => {
				tracing::error!(
					folder = %self.folder.display(),
					"Engine crash loop detected; disabling code intelligence"
				);
				self.gate.fail(GateFailure::CrashLoop);
				if !self.crash_reported.swap(true, Ordering::SeqCst) {
					self.handler.on_crash_loop(format!(
						"The code-intelligence engine for {} crashed repeatedly and will not be restarted. Reload the window to try again.",
						self.folder.display()
					));
				}
			}
		}
	}

	/// Bring up a fresh incarnation: same slot, next generation, new
	/// handshake. The client's identity (folder, handler, queue) survives.
	async fn restart_engine(self: Arc<Self>) {
		let previous = self.engine_id();
		let _ = self.transport.stop(previous).await;

		let next = {
			let mut engine = self.engine.write();
			engine.generation += 1;
			*engine
		};

		if let Err(err) = self.transport.start(self.spawn_config(next)).await {
			tracing::error!(engine = %next, error = %err, "Failed to respawn engine");
			self.gate.fail(GateFailure::Unsupported);
			return;
		}

		match self.handshake().await {
			Ok(_) => self.handler.on_engine_restarted(next.generation),
			Err(err) => self.handshake_failed(err),
		}
	}

	/// Tear down: graceful shutdown request, exit notification, then kill.
	pub async fn dispose(&self) {
		if self.disposing.swap(true, Ordering::SeqCst) {
			return;
		}
		self.gate.fail(GateFailure::Disposed);

		let engine = self.engine_id();
		let deadline = std::time::Duration::from_secs(2);
		let graceful = tokio::time::timeout(deadline, self.request_now::<Shutdown>(())).await;
		if !matches!(graceful, Ok(Ok(()))) {
			tracing::debug!(engine = %engine, "Graceful shutdown request failed");
		}
		let exit = AnyNotification {
			method: Exit::METHOD.into(),
			params: Value::Null,
		};
		let _ = self.transport.notify(engine, exit).await;
		let _ = self.transport.stop(engine).await;
	}
}

impl std::fmt::Debug for ActiveClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActiveClient")
			.field("folder", &self.folder)
			.field("engine", &self.engine_id())
			.field("ready", &self.is_ready())
			.finish_non_exhaustive()
	}
}

/// Ordered outbound path for the references coordinator: notifications are
/// handed to a forwarder task one by one, so find/cancel/refresh never
/// overtake each other on the way to the transport.
struct EngineWire {
	tx: mpsc::UnboundedSender<AnyNotification>,
}

impl EngineWire {
	fn spawn(transport: Arc<dyn Transport>, engine: Arc<RwLock<EngineId>>) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<AnyNotification>();
		tokio::spawn(async move {
			while let Some(notif) = rx.recv().await {
				let id = *engine.read();
				if let Err(err) = transport.notify(id, notif).await {
					tracing::debug!(engine = %id, error = %err, "Reference notification dropped");
				}
			}
		});
		Self { tx }
	}

	fn send<N: Notification>(&self, params: N::Params) {
		match serde_json::to_value(params) {
			Ok(params) => {
				let _ = self.tx.send(AnyNotification {
					method: N::METHOD.into(),
					params,
				});
			}
			Err(err) => {
				tracing::warn!(method = N::METHOD, error = %err, "Dropping unserializable notification");
			}
		}
	}
}

impl ReferencesWire for EngineWire {
	fn find(&self, params: tandem_proto::FindReferencesParams) {
		self.send::<FindReferences>(params);
	}

	fn cancel(&self) {
		self.send::<CancelReferences>(());
	}

	fn refresh(&self) {
		self.send::<RefreshReferences>(());
	}
}

#[cfg(test)]
mod tests;
