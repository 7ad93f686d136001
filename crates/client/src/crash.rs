//! Crash accounting and the restart-or-give-up decision.
//!
//! An unexpected channel close is either a transient engine failure worth a
//! transparent restart, or one more symptom of a crash loop that restarting
//! will not fix. The history keeps a bounded record of crash timestamps and
//! applies a sliding-window rule; the supervisor wraps it in the
//! `Running / Restarting / Dead` state machine. Both take timestamps as
//! arguments, so the rule is testable without spawning anything.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::CrashPolicy;

/// What to do about the crash that was just recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
	/// Recreate the engine and keep serving.
	Restart,
	/// Stop restarting; the client is dead until the editor reloads.
	GiveUp,
}

/// Bounded, sliding-window record of crash timestamps.
#[derive(Debug)]
pub struct CrashHistory {
	policy: CrashPolicy,
	times: VecDeque<Instant>,
	/// Whether the last full window was already concentrated and slid over.
	/// A full window of rapid crashes is tolerated once; an immediately
	/// following one is fatal.
	burst_tolerated: bool,
}

impl CrashHistory {
	/// Create an empty history under the given policy.
	pub fn new(policy: CrashPolicy) -> Self {
		Self {
			policy,
			times: VecDeque::with_capacity(policy.max_crashes),
			burst_tolerated: false,
		}
	}

	/// Number of retained crash timestamps.
	pub fn len(&self) -> usize {
		self.times.len()
	}

	/// True when no crash has been recorded.
	pub fn is_empty(&self) -> bool {
		self.times.is_empty()
	}

	/// Record a crash at `at` and decide what to do about it.
	pub fn record(&mut self, at: Instant) -> CrashVerdict {
		self.times.push_back(at);
		if self.times.len() < self.policy.max_crashes {
			return CrashVerdict::Restart;
		}

		let span = match (self.times.front(), self.times.back()) {
			(Some(oldest), Some(newest)) => newest.duration_since(*oldest),
			_ => return CrashVerdict::Restart,
		};

		if span > self.policy.window() {
			// The record is full but not concentrated: the oldest crash has
			// aged out of the window. Slide and keep going.
			self.times.pop_front();
			self.burst_tolerated = false;
			CrashVerdict::Restart
		} else if !self.burst_tolerated {
			// First full window of rapid crashes: evict the oldest and give
			// the engine one more chance.
			self.times.pop_front();
			self.burst_tolerated = true;
			CrashVerdict::Restart
		} else {
			CrashVerdict::GiveUp
		}
	}
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	/// Channel open, handshake complete.
	Running,
	/// Channel closed; a replacement engine is being brought up.
	Restarting,
	/// Crash loop detected; no further restarts.
	Dead,
}

/// Converts unexpected channel closes into restart-or-give-up decisions.
#[derive(Debug)]
pub struct CrashSupervisor {
	state: SupervisorState,
	history: CrashHistory,
}

impl CrashSupervisor {
	/// Create a supervisor for a client whose first handshake is in flight.
	pub fn new(policy: CrashPolicy) -> Self {
		Self {
			state: SupervisorState::Restarting,
			history: CrashHistory::new(policy),
		}
	}

	/// Current state.
	pub fn state(&self) -> SupervisorState {
		self.state
	}

	/// True once the supervisor has given up.
	pub fn is_dead(&self) -> bool {
		self.state == SupervisorState::Dead
	}

	/// The channel closed unexpectedly at `at`.
	pub fn on_channel_closed(&mut self, at: Instant) -> CrashVerdict {
		if self.state == SupervisorState::Dead {
			return CrashVerdict::GiveUp;
		}
		let verdict = self.history.record(at);
		self.state = match verdict {
			CrashVerdict::Restart => SupervisorState::Restarting,
			CrashVerdict::GiveUp => SupervisorState::Dead,
		};
		verdict
	}

	/// A handshake completed; the client is serving again.
	pub fn on_handshake_complete(&mut self) {
		if self.state != SupervisorState::Dead {
			self.state = SupervisorState::Running;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn policy() -> CrashPolicy {
		CrashPolicy::default()
	}

	fn at(base: Instant, secs: u64) -> Instant {
		base + Duration::from_secs(secs)
	}

	#[test]
	fn fewer_than_max_crashes_always_restart() {
		let base = Instant::now();
		let mut history = CrashHistory::new(policy());
		for i in 0..4 {
			assert_eq!(history.record(at(base, i)), CrashVerdict::Restart);
		}
		assert_eq!(history.len(), 4);
	}

	#[test]
	fn fifth_rapid_crash_restarts_and_only_the_sixth_gives_up() {
		let base = Instant::now();
		let mut history = CrashHistory::new(policy());

		// Five crashes inside the window: the fifth still restarts, evicting
		// the oldest timestamp.
		for i in 0..5 {
			assert_eq!(history.record(at(base, i * 10)), CrashVerdict::Restart);
		}
		assert_eq!(history.len(), 4);

		// A sixth crash still inside the window fills the record again and
		// is fatal.
		assert_eq!(history.record(at(base, 50)), CrashVerdict::GiveUp);
	}

	#[test]
	fn spread_out_crashes_never_give_up() {
		let base = Instant::now();
		let mut history = CrashHistory::new(policy());

		// Twelve crashes, each a minute apart: every full record spans more
		// than the window, so the history keeps sliding.
		for i in 0..12 {
			assert_eq!(history.record(at(base, i * 60)), CrashVerdict::Restart);
		}
	}

	#[test]
	fn slow_crash_clears_burst_tolerance() {
		let base = Instant::now();
		let mut history = CrashHistory::new(policy());

		for i in 0..5 {
			assert_eq!(history.record(at(base, i)), CrashVerdict::Restart);
		}
		// Quiet period: the next crash lands far outside the window.
		assert_eq!(history.record(at(base, 1000)), CrashVerdict::Restart);

		// A fresh burst gets tolerated once more before turning fatal.
		assert_eq!(history.record(at(base, 1001)), CrashVerdict::Restart);
		assert_eq!(history.record(at(base, 1002)), CrashVerdict::Restart);
		assert_eq!(history.record(at(base, 1003)), CrashVerdict::Restart);
		assert_eq!(history.record(at(base, 1004)), CrashVerdict::Restart);
		assert_eq!(history.record(at(base, 1005)), CrashVerdict::GiveUp);
	}

	#[test]
	fn supervisor_transitions_through_restart_to_running() {
		let mut supervisor = CrashSupervisor::new(policy());
		assert_eq!(supervisor.state(), SupervisorState::Restarting);

		supervisor.on_handshake_complete();
		assert_eq!(supervisor.state(), SupervisorState::Running);

		assert_eq!(
			supervisor.on_channel_closed(Instant::now()),
			CrashVerdict::Restart
		);
		assert_eq!(supervisor.state(), SupervisorState::Restarting);

		supervisor.on_handshake_complete();
		assert_eq!(supervisor.state(), SupervisorState::Running);
	}

	#[test]
	fn dead_supervisor_stays_dead() {
		let base = Instant::now();
		let mut supervisor = CrashSupervisor::new(policy());
		supervisor.on_handshake_complete();

		for i in 0..5 {
			assert_eq!(
				supervisor.on_channel_closed(at(base, i)),
				CrashVerdict::Restart
			);
		}
		assert_eq!(supervisor.on_channel_closed(at(base, 5)), CrashVerdict::GiveUp);
		assert!(supervisor.is_dead());

		supervisor.on_handshake_complete();
		assert!(supervisor.is_dead());
		assert_eq!(supervisor.on_channel_closed(at(base, 6)), CrashVerdict::GiveUp);
	}
}
