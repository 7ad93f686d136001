//! Coordinator for the find-references / rename exchange.
//!
//! The exchange is long-running and the user keeps working while it runs:
//! they re-trigger the query, move on to a different symbol, start a rename,
//! edit the document, or cancel outright. The engine only ever works on one
//! exchange per client, so all of that pressure is absorbed here:
//!
//! - every logical request gets a fresh token; the stored current token
//!   decides whose final result is authoritative, and everything else
//!   resolves as [`ReferencesOutcome::Superseded`] instead of leaking stale
//!   data into the UI,
//! - a different request while one is in flight is queued (at most one) and
//!   dispatched after the in-flight exchange is cancelled and confirmed,
//! - duplicate triggers of the in-flight query never send a second find;
//!   they share its outcome and at most ask the engine to re-deliver,
//! - cancellation is coalesced: the first cancel sends the wire message, all
//!   cancel waiters resolve together on the engine's confirmation,
//! - per-target progress is folded into one completion estimate and
//!   forwarded at a throttled rate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use lsp_types::{Position, Uri};
use parking_lot::Mutex;
use tandem_proto::{
	FindReferencesParams, ReferenceItem, ReferencesKind, ReferencesPhase, ReferencesProgressParams,
	ReferencesResultParams, TargetPhase, TargetProgress,
};
use tokio::sync::oneshot;

use crate::handler::SharedEventHandler;

/// Identity of one logical references/rename request. Monotonically
/// allocated; an exchange whose token no longer matches the coordinator's
/// current token has been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken(u64);

/// How the result will be presented, which decides how duplicate triggers
/// are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
	/// One-shot peek or rename: a repeat trigger asks the engine to
	/// re-deliver what it already has.
	OneShot,
	/// Persistent browse view: rapid repeat triggers coalesce into a single
	/// re-delivery request.
	Browse,
}

/// How a references/rename request ended, from its caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferencesOutcome {
	/// The engine finished and this request was still the current one.
	Complete(Vec<ReferenceItem>),
	/// The exchange was cancelled; whatever was confirmed so far.
	Canceled(Vec<ReferenceItem>),
	/// A newer request replaced this one. Silent by design.
	Superseded,
}

/// Aggregated progress forwarded to the editor sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencesProgressReport {
	/// Coarse phase of the exchange.
	pub phase: ReferencesPhase,
	/// Completion estimate in percent.
	pub percent: u8,
}

/// Outbound half of the exchange: how the coordinator talks to the engine.
///
/// Implementations must preserve call order; the production wire funnels
/// into the client's ordered notification channel.
pub trait ReferencesWire: Send + Sync {
	/// Send `references/find`.
	fn find(&self, params: FindReferencesParams);
	/// Send `references/cancel`.
	fn cancel(&self);
	/// Send `references/refresh`.
	fn refresh(&self);
}

/// Future resolving to a request's [`ReferencesOutcome`].
#[derive(Debug)]
pub struct ReferencesTicket {
	rx: oneshot::Receiver<ReferencesOutcome>,
}

impl Future for ReferencesTicket {
	type Output = ReferencesOutcome;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx).poll(cx).map(|settled| match settled {
			Ok(outcome) => outcome,
			// Coordinator dropped mid-flight: nothing will ever deliver.
			Err(_) => ReferencesOutcome::Superseded,
		})
	}
}

struct ProgressThrottle {
	interval: Duration,
	last_emit: Option<Instant>,
}

impl ProgressThrottle {
	fn new(interval: Duration) -> Self {
		Self {
			interval,
			last_emit: None,
		}
	}

	fn should_emit(&mut self, now: Instant) -> bool {
		let due = self
			.last_emit
			.is_none_or(|last| now.duration_since(last) >= self.interval);
		if due {
			self.last_emit = Some(now);
		}
		due
	}
}

struct Exchange {
	token: RequestToken,
	kind: ReferencesKind,
	uri: Uri,
	position: Position,
	new_name: Option<String>,
	waiters: Vec<oneshot::Sender<ReferencesOutcome>>,
	throttle: ProgressThrottle,
}

impl Exchange {
	fn find_params(&self) -> FindReferencesParams {
		FindReferencesParams {
			uri: self.uri.clone(),
			position: self.position,
			kind: self.kind,
			new_name: self.new_name.clone(),
		}
	}

	fn matches(&self, uri: &Uri, position: Position, kind: ReferencesKind) -> bool {
		self.kind == kind && self.position == position && self.uri == *uri
	}
}

#[derive(Clone, PartialEq)]
struct QueryKey {
	uri: Uri,
	position: Position,
	kind: ReferencesKind,
}

#[derive(Default)]
struct CoordinatorState {
	/// Exchange the engine is working on right now.
	inflight: Option<Exchange>,
	/// At most one successor waiting for the in-flight exchange to end.
	queued: Option<Exchange>,
	/// Token of the authoritative request; anything else is stale.
	current: Option<RequestToken>,
	/// Continuations waiting for cancellation to be confirmed.
	cancel_waiters: Vec<oneshot::Sender<()>>,
	/// Whether `references/cancel` went out for the in-flight exchange.
	cancel_sent: bool,
	/// Whether a browse re-delivery is already requested.
	refresh_pending: bool,
	/// Whether any exchange has completed for this client before.
	seen_before: bool,
	/// The last query sent to the engine, for repeat detection.
	last_query: Option<QueryKey>,
}

/// Per-client coordinator for the references/rename exchange.
pub struct ReferencesCoordinator {
	wire: Arc<dyn ReferencesWire>,
	sink: SharedEventHandler,
	throttle_interval: Duration,
	next_token: AtomicU64,
	state: Mutex<CoordinatorState>,
}

impl ReferencesCoordinator {
	/// Create a coordinator sending through `wire` and reporting progress to
	/// `sink`, with progress reports spaced at least `throttle_interval`
	/// apart.
	pub fn new(
		wire: Arc<dyn ReferencesWire>,
		sink: SharedEventHandler,
		throttle_interval: Duration,
	) -> Self {
		Self {
			wire,
			sink,
			throttle_interval,
			next_token: AtomicU64::new(0),
			state: Mutex::new(CoordinatorState::default()),
		}
	}

	/// Start (or absorb) a logical references/rename request.
	pub fn request(
		&self,
		kind: ReferencesKind,
		mode: ResultMode,
		uri: Uri,
		position: Position,
		new_name: Option<String>,
	) -> ReferencesTicket {
		let (tx, rx) = oneshot::channel();
		let token = RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
		let mut st = self.state.lock();

		// A re-trigger of the still-authoritative in-flight query shares its
		// exchange instead of sending a second find.
		let is_duplicate = match (&st.inflight, st.current) {
			(Some(exchange), Some(current)) => {
				exchange.token == current && exchange.matches(&uri, position, kind)
			}
			_ => false,
		};
		if is_duplicate {
			match mode {
				ResultMode::OneShot => self.wire.refresh(),
				ResultMode::Browse => {
					if !st.refresh_pending {
						st.refresh_pending = true;
						self.wire.refresh();
					}
				}
			}
			if let Some(exchange) = st.inflight.as_mut() {
				exchange.waiters.push(tx);
			}
			return ReferencesTicket { rx };
		}

		let repeat_browse = st.seen_before
			&& mode == ResultMode::Browse
			&& kind == ReferencesKind::FindAll
			&& st.last_query.as_ref().is_some_and(|q| {
				q.uri == uri && q.position == position && q.kind == kind
			});

		st.current = Some(token);
		st.last_query = Some(QueryKey {
			uri: uri.clone(),
			position,
			kind,
		});

		let exchange = Exchange {
			token,
			kind,
			uri,
			position,
			new_name,
			waiters: vec![tx],
			throttle: ProgressThrottle::new(self.throttle_interval),
		};

		if st.inflight.is_some() {
			// Supersede: park the new request and get the engine off the old
			// one. A previously queued request will never get a final result,
			// so it resolves superseded right away.
			if let Some(stale) = st.queued.take() {
				resolve_all(stale.waiters, &ReferencesOutcome::Superseded);
			}
			st.queued = Some(exchange);
			self.request_cancel_locked(&mut st);
		} else {
			let params = exchange.find_params();
			st.inflight = Some(exchange);
			if repeat_browse {
				self.wire.refresh();
			} else {
				self.wire.find(params);
			}
		}

		ReferencesTicket { rx }
	}

	/// Cancel whatever is outstanding. The returned receiver fires once the
	/// engine confirms; it fires immediately when nothing is in flight.
	/// Concurrent cancels coalesce into a single wire message.
	pub fn cancel(&self) -> oneshot::Receiver<()> {
		let (tx, rx) = oneshot::channel();
		let mut st = self.state.lock();
		if st.inflight.is_none() {
			let _ = tx.send(());
			return rx;
		}
		st.cancel_waiters.push(tx);
		self.request_cancel_locked(&mut st);
		rx
	}

	/// A tracked document changed. Position-based rename state is now
	/// invalid, so an outstanding rename is cancelled.
	pub fn on_document_edited(&self) {
		let mut st = self.state.lock();
		if let Some(queued) = st.queued.take_if(|q| q.kind == ReferencesKind::Rename) {
			if st.current == Some(queued.token) {
				st.current = None;
			}
			resolve_all(queued.waiters, &ReferencesOutcome::Canceled(Vec::new()));
		}
		if st
			.inflight
			.as_ref()
			.is_some_and(|e| e.kind == ReferencesKind::Rename)
		{
			self.request_cancel_locked(&mut st);
		}
	}

	/// Streamed progress from the engine.
	pub fn on_progress(&self, params: ReferencesProgressParams, now: Instant) {
		let report = {
			let mut st = self.state.lock();
			let Some(exchange) = st.inflight.as_mut() else {
				tracing::debug!("References progress with no exchange in flight");
				return;
			};
			match params.phase {
				ReferencesPhase::ProcessingTargets => {
					if !exchange.throttle.should_emit(now) {
						return;
					}
					ReferencesProgressReport {
						phase: params.phase,
						percent: aggregate_percent(&params.targets),
					}
				}
				ReferencesPhase::Finished => ReferencesProgressReport {
					phase: params.phase,
					percent: 100,
				},
				phase => ReferencesProgressReport { phase, percent: 0 },
			}
		};
		self.sink.on_references_progress(report);
	}

	/// Final result from the engine, closing the in-flight exchange.
	pub fn on_result(&self, params: ReferencesResultParams) {
		let mut st = self.state.lock();

		// The engine has confirmed the end of the exchange; every pending
		// cancellation is answered by it, canceled flag or not.
		let cancel_waiters = std::mem::take(&mut st.cancel_waiters);
		st.cancel_sent = false;
		st.refresh_pending = false;

		let Some(exchange) = st.inflight.take() else {
			tracing::debug!(canceled = params.canceled, "References result with no exchange in flight");
			for waiter in cancel_waiters {
				let _ = waiter.send(());
			}
			return;
		};

		let authoritative = st.current == Some(exchange.token);
		let outcome = if !authoritative {
			ReferencesOutcome::Superseded
		} else if params.canceled {
			ReferencesOutcome::Canceled(params.items)
		} else {
			st.seen_before = true;
			ReferencesOutcome::Complete(params.items)
		};
		if authoritative {
			st.current = None;
		}

		resolve_all(exchange.waiters, &outcome);
		for waiter in cancel_waiters {
			let _ = waiter.send(());
		}

		// Dispatch the queued successor, unless it too was superseded while
		// parked.
		if let Some(next) = st.queued.take() {
			if st.current == Some(next.token) {
				let params = next.find_params();
				st.inflight = Some(next);
				self.wire.find(params);
			} else {
				resolve_all(next.waiters, &ReferencesOutcome::Superseded);
			}
		}
	}

	fn request_cancel_locked(&self, st: &mut CoordinatorState) {
		if !st.cancel_sent && st.inflight.is_some() {
			st.cancel_sent = true;
			self.wire.cancel();
		}
	}
}

fn resolve_all(waiters: Vec<oneshot::Sender<ReferencesOutcome>>, outcome: &ReferencesOutcome) {
	for waiter in waiters {
		let _ = waiter.send(outcome.clone());
	}
}

fn phase_weight(phase: TargetPhase) -> u32 {
	match phase {
		TargetPhase::WaitingToLex => 0,
		TargetPhase::Lexing => 1,
		TargetPhase::WaitingToParse => 2,
		TargetPhase::Parsing => 3,
		TargetPhase::Confirming => 4,
		TargetPhase::Finished => 5,
	}
}

const MAX_PHASE_WEIGHT: u32 = 5;

/// Fold per-target sub-phases into one completion estimate.
fn aggregate_percent(targets: &[TargetProgress]) -> u8 {
	if targets.is_empty() {
		return 0;
	}
	let done: u32 = targets.iter().map(|t| phase_weight(t.phase)).sum();
	let total = MAX_PHASE_WEIGHT * targets.len() as u32;
	((done * 100) / total) as u8
}
