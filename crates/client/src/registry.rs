//! Registry of live clients.
//!
//! The extension owns exactly one registry: created on activation, torn down
//! on deactivation, injected wherever a client is needed. It maps open
//! workspace folders to their clients, allocates engine slots, and runs the
//! event router that fans transport events out to the owning client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::{ActiveClient, Client};
use crate::config::{EngineConfig, locate_engine};
use crate::handler::SharedEventHandler;
use crate::transport::{Transport, TransportEvent};

/// Errors from [`ClientRegistry::spawn_router`].
#[derive(Debug, thiserror::Error)]
pub enum RouterStartError {
	/// The router was already spawned for this registry.
	#[error("event router already started")]
	AlreadyStarted,
	/// Called outside a tokio runtime.
	#[error("no tokio runtime available")]
	NoRuntime,
	/// The transport's event stream was already taken.
	#[error("transport events unavailable: {0}")]
	Events(crate::Error),
}

/// Process-wide owner of the live clients.
pub struct ClientRegistry {
	transport: Arc<dyn Transport>,
	handler: SharedEventHandler,
	clients: RwLock<HashMap<PathBuf, Client>>,
	/// Active clients by slot, for event routing.
	by_slot: Arc<RwLock<HashMap<u32, Arc<ActiveClient>>>>,
	next_slot: AtomicU32,
	router: Mutex<Option<JoinHandle<()>>>,
	router_started: AtomicBool,
}

impl ClientRegistry {
	/// Create a registry over the given transport and editor sink.
	pub fn new(transport: Arc<dyn Transport>, handler: SharedEventHandler) -> Self {
		Self {
			transport,
			handler,
			clients: RwLock::new(HashMap::new()),
			by_slot: Arc::new(RwLock::new(HashMap::new())),
			next_slot: AtomicU32::new(1),
			router: Mutex::new(None),
			router_started: AtomicBool::new(false),
		}
	}

	/// Spawn the background event router. Must be called once, from within a
	/// tokio runtime, before any folder is opened.
	pub fn spawn_router(&self) -> Result<(), RouterStartError> {
		if tokio::runtime::Handle::try_current().is_err() {
			return Err(RouterStartError::NoRuntime);
		}
		if self.router_started.swap(true, Ordering::SeqCst) {
			return Err(RouterStartError::AlreadyStarted);
		}

		let mut events_rx = self
			.transport
			.subscribe_events()
			.map_err(RouterStartError::Events)?;
		let by_slot = self.by_slot.clone();

		let handle = tokio::spawn(async move {
			while let Some(event) = events_rx.recv().await {
				let slot = match &event {
					TransportEvent::Status { engine, .. } => Some(engine.slot.0),
					TransportEvent::Notification { engine, .. } => Some(engine.slot.0),
					TransportEvent::Disconnected => None,
				};
				let Some(slot) = slot else { break };

				let client = by_slot.read().get(&slot).cloned();
				match client {
					Some(client) => client.handle_event(event),
					None => {
						tracing::debug!(slot = slot, "Transport event for unknown client slot");
					}
				}
			}
		});
		*self.router.lock() = Some(handle);
		Ok(())
	}

	/// Open (or return) the client for a workspace folder.
	///
	/// A host that cannot run the engine gets the null client: every
	/// operation on it fails fast instead of hanging on a gate that will
	/// never open.
	pub async fn open_folder(&self, folder: &Path, config: EngineConfig) -> Client {
		if let Some(existing) = self.get(folder) {
			return existing;
		}

		let command = match locate_engine(&config.install_dir) {
			Ok(command) => command,
			Err(_) => {
				tracing::error!(
					folder = %folder.display(),
					install_dir = %config.install_dir.display(),
					"Engine unavailable; folder gets a null client"
				);
				let client = Client::Null;
				self.clients
					.write()
					.insert(folder.to_path_buf(), client.clone());
				return client;
			}
		};

		let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
		match ActiveClient::launch(
			slot,
			folder,
			command,
			config,
			self.transport.clone(),
			self.handler.clone(),
		)
		.await
		{
			Ok(active) => {
				self.by_slot.write().insert(slot, active.clone());
				let client = Client::Active(active);
				self.clients
					.write()
					.insert(folder.to_path_buf(), client.clone());
				client
			}
			Err(err) => {
				tracing::error!(
					folder = %folder.display(),
					error = %err,
					"Engine launch failed; folder gets a null client"
				);
				let client = Client::Null;
				self.clients
					.write()
					.insert(folder.to_path_buf(), client.clone());
				client
			}
		}
	}

	/// The client for a folder, if it is open.
	pub fn get(&self, folder: &Path) -> Option<Client> {
		self.clients.read().get(folder).cloned()
	}

	/// Number of open folders.
	pub fn len(&self) -> usize {
		self.clients.read().len()
	}

	/// True when no folder is open.
	pub fn is_empty(&self) -> bool {
		self.clients.read().is_empty()
	}

	/// Close a folder and dispose its client.
	pub async fn close_folder(&self, folder: &Path) {
		let client = self.clients.write().remove(folder);
		if let Some(Client::Active(active)) = &client {
			self.by_slot
				.write()
				.retain(|_, candidate| !Arc::ptr_eq(candidate, active));
		}
		if let Some(client) = client {
			client.dispose().await;
		}
	}

	/// Dispose every client and stop the router.
	pub async fn teardown(&self) {
		let clients: Vec<Client> = {
			let mut map = self.clients.write();
			self.by_slot.write().clear();
			map.drain().map(|(_, client)| client).collect()
		};
		for client in clients {
			client.dispose().await;
		}
		if let Some(router) = self.router.lock().take() {
			router.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::handler::NoOpEventHandler;
	use crate::process::ProcessTransport;

	#[tokio::test]
	async fn missing_engine_yields_a_null_client() {
		let registry = ClientRegistry::new(ProcessTransport::new(), Arc::new(NoOpEventHandler));
		let dir = tempfile::tempdir().unwrap();

		let client = registry
			.open_folder(Path::new("/work"), EngineConfig::new(dir.path()))
			.await;
		assert!(!client.is_active());
		assert!(matches!(
			client.query_defaults().await,
			Err(crate::Error::Unsupported)
		));
		// The folder stays registered so the editor does not retry per event.
		assert_eq!(registry.len(), 1);
	}

	#[tokio::test]
	async fn router_can_only_start_once() {
		let registry = ClientRegistry::new(ProcessTransport::new(), Arc::new(NoOpEventHandler));
		assert!(registry.spawn_router().is_ok());
		assert!(matches!(
			registry.spawn_router(),
			Err(RouterStartError::AlreadyStarted)
		));
	}

	#[tokio::test]
	async fn close_folder_forgets_the_client() {
		let registry = ClientRegistry::new(ProcessTransport::new(), Arc::new(NoOpEventHandler));
		let dir = tempfile::tempdir().unwrap();

		registry
			.open_folder(Path::new("/work"), EngineConfig::new(dir.path()))
			.await;
		registry.close_folder(Path::new("/work")).await;
		assert!(registry.is_empty());
	}
}
