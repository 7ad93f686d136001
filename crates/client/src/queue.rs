//! Deferred-operation queue.
//!
//! Operations submitted before the engine is ready must still run, in the
//! order they were submitted, once it is. The queue holds them as thunks and
//! drains them through a single lazily-started dispatch loop: await the gate,
//! pop the oldest task, run it to settlement, repeat. A task's failure (or
//! panic) is delivered to that task's handle only; the loop keeps draining.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::gate::ReadinessGate;
use crate::{Error, Result};

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskThunk = Box<dyn FnOnce(Option<Error>) -> TaskFuture + Send>;

struct QueuedTask {
	blocking: bool,
	run: TaskThunk,
}

struct QueueInner {
	gate: Arc<ReadinessGate>,
	pending: Mutex<VecDeque<QueuedTask>>,
	draining: AtomicBool,
}

/// Handle to a queued task's eventual result.
#[derive(Debug)]
pub struct TaskHandle<T> {
	rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
	type Output = Result<T>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx).poll(cx).map(|settled| match settled {
			Ok(result) => result,
			Err(_) => Err(Error::ServiceStopped),
		})
	}
}

/// FIFO queue of deferred operations, gated on readiness.
#[derive(Clone)]
pub struct TaskQueue {
	inner: Arc<QueueInner>,
}

impl TaskQueue {
	/// Create a queue draining through the given gate.
	pub fn new(gate: Arc<ReadinessGate>) -> Self {
		Self {
			inner: Arc::new(QueueInner {
				gate,
				pending: Mutex::new(VecDeque::new()),
				draining: AtomicBool::new(false),
			}),
		}
	}

	/// Append a task. It runs once the gate is open and every earlier task
	/// has settled; the handle resolves with its result.
	pub fn enqueue<T, Fut>(&self, task: impl FnOnce() -> Fut + Send + 'static) -> TaskHandle<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		self.push(false, task)
	}

	/// Append a setup task that must be fully observed before anything
	/// enqueued after it starts.
	pub fn enqueue_blocking<T, Fut>(
		&self,
		task: impl FnOnce() -> Fut + Send + 'static,
	) -> TaskHandle<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		self.push(true, task)
	}

	/// Number of tasks waiting to run.
	pub fn pending_len(&self) -> usize {
		self.inner.pending.lock().len()
	}

	fn push<T, Fut>(
		&self,
		blocking: bool,
		task: impl FnOnce() -> Fut + Send + 'static,
	) -> TaskHandle<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		let (tx, rx) = oneshot::channel();
		let run: TaskThunk = Box::new(move |abort| {
			Box::pin(async move {
				if let Some(err) = abort {
					let _ = tx.send(Err(err));
					return;
				}
				match AssertUnwindSafe(async move { task().await })
					.catch_unwind()
					.await
				{
					Ok(result) => {
						if let Err(err) = &result {
							tracing::debug!(error = %err, "Queued task failed");
						}
						let _ = tx.send(result);
					}
					Err(_) => {
						tracing::error!("Queued task panicked");
						let _ = tx.send(Err(Error::Protocol("queued task panicked".into())));
					}
				}
			})
		});

		self.inner
			.pending
			.lock()
			.push_back(QueuedTask { blocking, run });
		self.ensure_draining();
		TaskHandle { rx }
	}

	fn ensure_draining(&self) {
		if self.inner.draining.swap(true, Ordering::SeqCst) {
			return;
		}
		let inner = self.inner.clone();
		tokio::spawn(drain(inner));
	}
}

/// Dispatch loop: one per queue at a time, exits when the queue is empty.
async fn drain(inner: Arc<QueueInner>) {
	loop {
		let gate_result = inner.gate.ready().await;

		let task = inner.pending.lock().pop_front();
		let Some(task) = task else {
			inner.draining.store(false, Ordering::SeqCst);
			// A task may have slipped in between the pop and the flag clear;
			// reclaim the drain if so.
			if inner.pending.lock().is_empty() {
				break;
			}
			if inner.draining.swap(true, Ordering::SeqCst) {
				break;
			}
			continue;
		};

		tracing::trace!(blocking = task.blocking, "Dispatching queued task");
		(task.run)(gate_result.err().map(Error::from)).await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use parking_lot::Mutex;

	use super::*;
	use crate::gate::GateFailure;

	fn queue_with_gate() -> (TaskQueue, Arc<ReadinessGate>) {
		let gate = Arc::new(ReadinessGate::new());
		(TaskQueue::new(gate.clone()), gate)
	}

	#[tokio::test]
	async fn tasks_wait_for_gate_and_run_in_submission_order() {
		let (queue, gate) = queue_with_gate();
		let log = Arc::new(Mutex::new(Vec::new()));

		let handles: Vec<_> = (0..3)
			.map(|i| {
				let log = log.clone();
				queue.enqueue(move || async move {
					log.lock().push(i);
					Ok(i)
				})
			})
			.collect();

		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		assert!(log.lock().is_empty(), "no task may run before the gate is set");

		gate.set();
		for (i, handle) in handles.into_iter().enumerate() {
			assert_eq!(handle.await.unwrap(), i);
		}
		assert_eq!(*log.lock(), vec![0, 1, 2]);
	}

	#[tokio::test]
	async fn later_task_starts_only_after_earlier_settles() {
		let (queue, gate) = queue_with_gate();
		gate.set();

		let log = Arc::new(Mutex::new(Vec::new()));
		let (release_tx, release_rx) = oneshot::channel::<()>();

		let first = queue.enqueue_blocking({
			let log = log.clone();
			move || async move {
				log.lock().push("first:start");
				let _ = release_rx.await;
				log.lock().push("first:end");
				Ok(())
			}
		});
		let second = queue.enqueue({
			let log = log.clone();
			move || async move {
				log.lock().push("second:start");
				Ok(())
			}
		});

		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		assert_eq!(*log.lock(), vec!["first:start"]);

		release_tx.send(()).unwrap();
		first.await.unwrap();
		second.await.unwrap();
		assert_eq!(
			*log.lock(),
			vec!["first:start", "first:end", "second:start"]
		);
	}

	#[tokio::test]
	async fn failed_task_does_not_stop_the_queue() {
		let (queue, gate) = queue_with_gate();
		gate.set();

		let failing = queue.enqueue(|| async { Err::<(), _>(Error::Protocol("boom".into())) });
		let following = queue.enqueue(|| async { Ok(42) });

		assert!(matches!(failing.await, Err(Error::Protocol(_))));
		assert_eq!(following.await.unwrap(), 42);
	}

	#[tokio::test]
	async fn panicked_task_is_isolated() {
		let (queue, gate) = queue_with_gate();
		gate.set();

		let panicking: TaskHandle<()> = queue.enqueue(|| async {
			if true {
				panic!("engine bug");
			}
			Ok(())
		});
		let following = queue.enqueue(|| async { Ok("alive") });

		assert!(panicking.await.is_err());
		assert_eq!(following.await.unwrap(), "alive");
	}

	#[tokio::test]
	async fn queue_restarts_lazily_after_draining() {
		let (queue, gate) = queue_with_gate();
		gate.set();

		assert_eq!(queue.enqueue(|| async { Ok(1) }).await.unwrap(), 1);
		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		// The drain loop has exited; a fresh enqueue must restart it.
		assert_eq!(queue.enqueue(|| async { Ok(2) }).await.unwrap(), 2);
	}

	#[tokio::test]
	async fn gate_failure_aborts_queued_tasks() {
		let (queue, gate) = queue_with_gate();

		let queued = queue.enqueue(|| async { Ok(()) });
		gate.fail(GateFailure::Unsupported);

		assert!(matches!(queued.await, Err(Error::Unsupported)));
		// Tasks enqueued afterwards fail the same way instead of hanging.
		let late = queue.enqueue(|| async { Ok(()) });
		assert!(matches!(late.await, Err(Error::Unsupported)));
	}
}
