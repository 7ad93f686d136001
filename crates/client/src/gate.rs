//! Readiness gating for client operations.
//!
//! Nothing may touch the engine channel before the initialization handshake
//! completes. The gate is the single awaitable condition encoding that: unset
//! at construction, set once the handshake reply arrives, reset when a crash
//! restart begins a fresh handshake. A terminal failure (unsupported host,
//! crash loop, disposal) is sticky and makes every waiter fail fast instead
//! of hanging.

use tokio::sync::watch;

/// Why a gate will never open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFailure {
	/// Engine binary missing/broken or handshake failed.
	Unsupported,
	/// The crash supervisor gave up on this client.
	CrashLoop,
	/// The client was disposed.
	Disposed,
}

impl From<GateFailure> for crate::Error {
	fn from(failure: GateFailure) -> Self {
		match failure {
			GateFailure::Unsupported => crate::Error::Unsupported,
			GateFailure::CrashLoop => crate::Error::CrashLoop,
			GateFailure::Disposed => crate::Error::ServiceStopped,
		}
	}
}

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
	/// Handshake not completed yet; waiters suspend.
	Unset,
	/// Handshake complete; waiters pass through.
	Ready,
	/// Terminal failure; waiters fail fast.
	Failed(GateFailure),
}

/// Awaitable readiness condition for one client.
#[derive(Debug)]
pub struct ReadinessGate {
	tx: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
	fn default() -> Self {
		Self::new()
	}
}

impl ReadinessGate {
	/// Create an unset gate.
	pub fn new() -> Self {
		let (tx, _) = watch::channel(GateState::Unset);
		Self { tx }
	}

	/// Current state.
	pub fn state(&self) -> GateState {
		*self.tx.borrow()
	}

	/// True once the gate has been set and not reset since.
	pub fn is_ready(&self) -> bool {
		matches!(self.state(), GateState::Ready)
	}

	/// Open the gate. Idempotent; a no-op on a failed gate.
	pub fn set(&self) {
		self.tx.send_if_modified(|state| match state {
			GateState::Unset => {
				*state = GateState::Ready;
				true
			}
			GateState::Ready | GateState::Failed(_) => false,
		});
	}

	/// Close the gate again for a restart handshake. Waiters resolved by the
	/// prior [`set`](Self::set) stay resolved; failure is sticky.
	pub fn reset(&self) {
		self.tx.send_if_modified(|state| match state {
			GateState::Ready => {
				*state = GateState::Unset;
				true
			}
			GateState::Unset | GateState::Failed(_) => false,
		});
	}

	/// Mark the gate as permanently failed.
	pub fn fail(&self, failure: GateFailure) {
		self.tx.send_if_modified(|state| {
			if matches!(state, GateState::Failed(_)) {
				return false;
			}
			*state = GateState::Failed(failure);
			true
		});
	}

	/// Suspend until the gate is set. Resolves immediately when it already
	/// is; fails fast when the gate has failed.
	pub async fn ready(&self) -> Result<(), GateFailure> {
		let mut rx = self.tx.subscribe();
		loop {
			match *rx.borrow_and_update() {
				GateState::Ready => return Ok(()),
				GateState::Failed(failure) => return Err(failure),
				GateState::Unset => {}
			}
			if rx.changed().await.is_err() {
				return Err(GateFailure::Disposed);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[tokio::test]
	async fn ready_after_set_resolves_immediately() {
		let gate = ReadinessGate::new();
		gate.set();
		assert_eq!(futures::FutureExt::now_or_never(gate.ready()), Some(Ok(())));
	}

	#[tokio::test]
	async fn ready_before_set_waits_for_set() {
		let gate = Arc::new(ReadinessGate::new());
		let waiter = tokio::spawn({
			let gate = gate.clone();
			async move { gate.ready().await }
		});

		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		assert!(!waiter.is_finished());

		gate.set();
		assert_eq!(waiter.await.unwrap(), Ok(()));
	}

	#[tokio::test]
	async fn set_twice_is_idempotent() {
		let gate = ReadinessGate::new();
		gate.set();
		gate.set();
		assert_eq!(gate.state(), GateState::Ready);
		assert_eq!(futures::FutureExt::now_or_never(gate.ready()), Some(Ok(())));
	}

	#[tokio::test]
	async fn reset_makes_new_waiters_suspend() {
		let gate = Arc::new(ReadinessGate::new());
		gate.set();
		gate.ready().await.unwrap();

		gate.reset();
		assert!(!gate.is_ready());

		let waiter = tokio::spawn({
			let gate = gate.clone();
			async move { gate.ready().await }
		});
		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		assert!(!waiter.is_finished());

		gate.set();
		assert_eq!(waiter.await.unwrap(), Ok(()));
	}

	#[tokio::test]
	async fn failure_is_sticky_and_fails_waiters_fast() {
		let gate = ReadinessGate::new();
		gate.fail(GateFailure::Unsupported);
		assert_eq!(gate.ready().await, Err(GateFailure::Unsupported));

		// Neither set nor reset may resurrect a failed gate.
		gate.set();
		gate.reset();
		assert_eq!(gate.state(), GateState::Failed(GateFailure::Unsupported));
	}
}
