use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lsp_types::{Position, Uri};
use parking_lot::Mutex;
use tandem_proto::{
	AnyNotification, AnyRequest, AnyResponse, InitializeResult, ReferenceCategory, ReferenceItem,
	ReferencesResultParams,
};
use tokio::sync::{Notify, mpsc, oneshot};

use super::*;
use crate::handler::NoOpEventHandler;
use crate::registry::ClientRegistry;
use crate::transport::{StartedEngine, TransportStatus};

fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Scripted in-memory engine: records traffic, answers the handshake
/// (optionally held back until released), and lets tests inject events.
struct ScriptedTransport {
	event_tx: mpsc::UnboundedSender<TransportEvent>,
	event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
	started: Mutex<Vec<EngineId>>,
	stopped: Mutex<Vec<EngineId>>,
	requests: Mutex<Vec<(EngineId, String)>>,
	notifications: Mutex<Vec<(EngineId, String)>>,
	hold_initialize: AtomicBool,
	release_initialize: Notify,
}

impl ScriptedTransport {
	fn new() -> Arc<Self> {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		Arc::new(Self {
			event_tx,
			event_rx: Mutex::new(Some(event_rx)),
			started: Mutex::new(Vec::new()),
			stopped: Mutex::new(Vec::new()),
			requests: Mutex::new(Vec::new()),
			notifications: Mutex::new(Vec::new()),
			hold_initialize: AtomicBool::new(false),
			release_initialize: Notify::new(),
		})
	}

	fn hold_handshakes(&self) {
		self.hold_initialize.store(true, Ordering::SeqCst);
	}

	fn release_handshake(&self) {
		self.release_initialize.notify_one();
	}

	fn started_engines(&self) -> Vec<EngineId> {
		self.started.lock().clone()
	}

	fn notified_methods(&self) -> Vec<String> {
		self.notifications
			.lock()
			.iter()
			.map(|(_, method)| method.clone())
			.collect()
	}

	fn count_notifications(&self, method: &str) -> usize {
		self.notifications
			.lock()
			.iter()
			.filter(|(_, m)| m == method)
			.count()
	}

	fn inject(&self, event: TransportEvent) {
		self.event_tx.send(event).expect("router alive");
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	fn subscribe_events(&self) -> crate::Result<mpsc::UnboundedReceiver<TransportEvent>> {
		self.event_rx
			.lock()
			.take()
			.ok_or_else(|| Error::Protocol("events taken".into()))
	}

	async fn start(&self, cfg: SpawnConfig) -> crate::Result<StartedEngine> {
		self.started.lock().push(cfg.id);
		Ok(StartedEngine { id: cfg.id })
	}

	async fn request(
		&self,
		engine: EngineId,
		req: AnyRequest,
		_timeout: Option<std::time::Duration>,
	) -> crate::Result<AnyResponse> {
		self.requests.lock().push((engine, req.method.clone()));
		let result = match req.method.as_str() {
			"initialize" => {
				if self.hold_initialize.load(Ordering::SeqCst) {
					self.release_initialize.notified().await;
				}
				serde_json::to_value(InitializeResult {
					engine_version: Some("9.9".into()),
				})?
			}
			"engine/queryDefaults" => serde_json::to_value(tandem_proto::EngineDefaults {
				compiler_path: Some("/usr/bin/g++".into()),
				include_path: vec!["/usr/include".into()],
				standard: Some("c++20".into()),
			})?,
			_ => serde_json::Value::Null,
		};
		Ok(AnyResponse {
			id: req.id,
			result: Some(result),
			error: None,
		})
	}

	async fn notify(&self, engine: EngineId, notif: AnyNotification) -> crate::Result<()> {
		self.notifications.lock().push((engine, notif.method));
		Ok(())
	}

	async fn notify_with_barrier(
		&self,
		engine: EngineId,
		notif: AnyNotification,
	) -> crate::Result<oneshot::Receiver<crate::Result<()>>> {
		self.notifications.lock().push((engine, notif.method));
		let (tx, rx) = oneshot::channel();
		let _ = tx.send(Ok(()));
		Ok(rx)
	}

	async fn stop(&self, engine: EngineId) -> crate::Result<()> {
		self.stopped.lock().push(engine);
		Ok(())
	}
}

fn fake_install() -> tempfile::TempDir {
	let dir = tempfile::tempdir().unwrap();
	let binary = crate::config::engine_binary(dir.path());
	std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
	std::fs::write(&binary, b"fake engine").unwrap();
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
	}
	dir
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
	for _ in 0..1000 {
		if condition() {
			return;
		}
		tokio::task::yield_now().await;
	}
	panic!("condition not reached");
}

async fn open_ready_client(
	registry: &ClientRegistry,
	folder: &Path,
	install: &Path,
) -> Client {
	let client = registry
		.open_folder(folder, EngineConfig::new(install))
		.await;
	let probe = client.clone();
	wait_until(move || probe.is_ready()).await;
	client
}

fn uri(path: &str) -> Uri {
	format!("file://{path}").parse().expect("valid uri")
}

fn refs_result(engine: EngineId, canceled: bool, count: usize) -> TransportEvent {
	let items = (0..count)
		.map(|i| ReferenceItem {
			location: lsp_types::Location {
				uri: uri(&format!("/src/file{i}.cpp")),
				range: lsp_types::Range::default(),
			},
			text: "widget.draw();".into(),
			category: ReferenceCategory::Confirmed,
		})
		.collect();
	TransportEvent::Notification {
		engine,
		notif: AnyNotification {
			method: "references/result".into(),
			params: serde_json::to_value(ReferencesResultParams { canceled, items }).unwrap(),
		},
	}
}

#[tokio::test]
async fn startup_tasks_drain_in_order_once_the_handshake_completes() {
	init_tracing();
	let transport = ScriptedTransport::new();
	transport.hold_handshakes();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = registry
		.open_folder(Path::new("/work"), EngineConfig::new(install.path()))
		.await;
	assert!(client.is_active());
	assert!(!client.is_ready());

	// Enqueue three operations while the handshake is still pending. Each
	// spawn is allowed to reach its enqueue before the next starts.
	let mut ops = Vec::new();
	for op in ["reset", "pause", "resume"] {
		let client = client.clone();
		ops.push(tokio::spawn(async move {
			match op {
				"reset" => client.reset_database().await,
				"pause" => client.pause_parsing().await,
				_ => client.resume_parsing().await,
			}
		}));
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
	}

	assert!(
		transport.notified_methods().is_empty(),
		"nothing may reach the engine before the gate opens"
	);

	transport.release_handshake();
	for op in ops {
		op.await.unwrap().unwrap();
	}

	assert_eq!(
		transport.notified_methods(),
		vec![
			"engine/resetDatabase".to_string(),
			"engine/pauseParsing".to_string(),
			"engine/resumeParsing".to_string(),
		]
	);
}

#[tokio::test]
async fn crash_restarts_the_engine_under_a_new_generation() {
	init_tracing();
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;
	let first = EngineId::new(1, 1);
	assert_eq!(transport.started_engines(), vec![first]);

	transport.inject(TransportEvent::Status {
		engine: first,
		status: TransportStatus::Crashed,
	});

	let probe = transport.clone();
	wait_until(move || probe.started_engines().len() == 2).await;
	let probe = client.clone();
	wait_until(move || probe.is_ready()).await;

	// Same slot, bumped generation; the old incarnation was stopped.
	assert_eq!(
		transport.started_engines(),
		vec![first, EngineId::new(1, 2)]
	);
	assert!(transport.stopped.lock().contains(&first));

	// The restarted client keeps serving.
	client.reset_database().await.unwrap();
	assert_eq!(transport.count_notifications("engine/resetDatabase"), 1);
}

#[tokio::test]
async fn tasks_enqueued_during_a_restart_run_after_the_new_handshake() {
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;

	// Hold the restart handshake so the gate stays shut while we enqueue.
	transport.hold_handshakes();
	transport.inject(TransportEvent::Status {
		engine: EngineId::new(1, 1),
		status: TransportStatus::Crashed,
	});
	let probe = client.clone();
	wait_until(move || !probe.is_ready()).await;

	let queued = {
		let client = client.clone();
		tokio::spawn(async move { client.reset_database().await })
	};
	for _ in 0..20 {
		tokio::task::yield_now().await;
	}
	assert_eq!(transport.count_notifications("engine/resetDatabase"), 0);

	transport.release_handshake();
	queued.await.unwrap().unwrap();
	assert_eq!(transport.count_notifications("engine/resetDatabase"), 1);
}

#[tokio::test]
async fn sixth_rapid_crash_disables_the_client_and_reports_once() {
	struct CrashSink {
		reports: Mutex<Vec<String>>,
	}
	impl crate::handler::ClientEventHandler for CrashSink {
		fn on_crash_loop(&self, message: String) {
			self.reports.lock().push(message);
		}
	}

	let transport = ScriptedTransport::new();
	let sink = Arc::new(CrashSink {
		reports: Mutex::new(Vec::new()),
	});
	let registry = ClientRegistry::new(transport.clone(), sink.clone());
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;

	// Five crashes restart (each under a fresh generation); the sixth kills.
	for generation in 1..=5 {
		transport.inject(TransportEvent::Status {
			engine: EngineId::new(1, generation),
			status: TransportStatus::Crashed,
		});
		let probe = transport.clone();
		let expected = (generation + 1) as usize;
		wait_until(move || probe.started_engines().len() == expected).await;
		let probe = client.clone();
		wait_until(move || probe.is_ready()).await;
	}

	transport.inject(TransportEvent::Status {
		engine: EngineId::new(1, 6),
		status: TransportStatus::Crashed,
	});
	let probe = sink.clone();
	wait_until(move || !probe.reports.lock().is_empty()).await;

	assert_eq!(transport.started_engines().len(), 6, "no further restart");
	assert_eq!(sink.reports.lock().len(), 1);
	assert!(matches!(
		client.reset_database().await,
		Err(Error::CrashLoop)
	));
}

#[tokio::test]
async fn find_references_superseded_by_rename() {
	init_tracing();
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;
	let engine = EngineId::new(1, 1);
	let at = Position { line: 3, character: 7 };

	let find = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.find_all_references(ResultMode::Browse, uri("/src/widget.cpp"), at)
				.await
		})
	};
	let probe = transport.clone();
	wait_until(move || probe.count_notifications("references/find") == 1).await;

	let rename = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.rename(uri("/src/widget.cpp"), at, "gadget".into())
				.await
		})
	};
	let probe = transport.clone();
	wait_until(move || probe.count_notifications("references/cancel") == 1).await;

	// The engine confirms cancellation of the find exchange.
	transport.inject(refs_result(engine, true, 1));
	assert_eq!(find.await.unwrap().unwrap(), ReferencesOutcome::Superseded);

	// The rename goes out and completes with real data.
	let probe = transport.clone();
	wait_until(move || probe.count_notifications("references/find") == 2).await;
	transport.inject(refs_result(engine, false, 3));
	match rename.await.unwrap().unwrap() {
		ReferencesOutcome::Complete(items) => assert_eq!(items.len(), 3),
		other => panic!("expected Complete, got {other:?}"),
	}
}

#[tokio::test]
async fn query_defaults_is_cached_for_timeout_fallback() {
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;
	let defaults = client.query_defaults().await.unwrap();
	assert_eq!(defaults.compiler_path.as_deref(), Some("/usr/bin/g++"));
}

#[tokio::test]
async fn stale_generation_events_are_dropped() {
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;

	// A crash event from a generation that is not current must not trigger
	// a restart.
	transport.inject(TransportEvent::Status {
		engine: EngineId::new(1, 7),
		status: TransportStatus::Crashed,
	});
	for _ in 0..50 {
		tokio::task::yield_now().await;
	}
	assert_eq!(transport.started_engines().len(), 1);
	assert!(client.is_ready());
}

#[tokio::test]
async fn dispose_shuts_the_engine_down_gracefully() {
	let transport = ScriptedTransport::new();
	let registry = ClientRegistry::new(transport.clone(), Arc::new(NoOpEventHandler));
	registry.spawn_router().unwrap();
	let install = fake_install();

	let client = open_ready_client(&registry, Path::new("/work"), install.path()).await;
	registry.close_folder(Path::new("/work")).await;

	let requests: Vec<String> = transport
		.requests
		.lock()
		.iter()
		.map(|(_, method)| method.clone())
		.collect();
	assert!(requests.contains(&"shutdown".to_string()));
	assert_eq!(transport.count_notifications("exit"), 1);
	assert!(!transport.stopped.lock().is_empty());

	// The disposed client's folder is gone; operations on a stale handle
	// fail fast instead of hanging.
	assert!(registry.get(Path::new("/work")).is_none());
	assert!(matches!(
		client.reset_database().await,
		Err(Error::ServiceStopped)
	));
}
