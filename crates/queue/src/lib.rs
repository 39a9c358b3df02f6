//! An ordered collection of idle workers and a FIFO of waiters, with
//! condition/weight-based selection and explicit cancellation fairness.
//!
//! # Invariants
//!
//!   - First-time waiters enter the waiter line at the tail; a waiter that
//!     is woken only to find the idle set empty again re-enters at the
//!     head, keeping its place (enforced in [`WorkerQueue::acquire`]).
//!   - A waiter whose future is dropped before it consumes a slot it was
//!     already woken for wakes the next waiter in turn rather than
//!     stranding that slot (enforced in `WaiterGuard::drop`).
//!   - `acquire` only ever fails once [`WorkerQueue::close`] has been
//!     called.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("pool is stopping")]
	Closed,
}

struct Waiter {
	id: u64,
	tx: oneshot::Sender<bool>,
}

struct Inner<W> {
	queue: VecDeque<W>,
	waiters: VecDeque<Waiter>,
	next_waiter_id: u64,
	closed: bool,
}

/// FIFO of idle workers plus a waiter line, matching the selection and
/// fairness rules of the original `WorkerQueue`.
pub struct WorkerQueue<W> {
	inner: Mutex<Inner<W>>,
}

impl<W> Default for WorkerQueue<W> {
	fn default() -> Self {
		Self::new()
	}
}

impl<W> WorkerQueue<W> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				queue: VecDeque::new(),
				waiters: VecDeque::new(),
				next_waiter_id: 0,
				closed: false,
			}),
		}
	}

	/// Block until at least one worker is idle, then remove and return one.
	///
	/// If `condition` matches any idle worker, that one is returned. Else if
	/// `weighter` is given, the idle worker with the maximum weight is
	/// returned. Else the front of the idle queue is returned.
	pub async fn acquire(
		&self,
		condition: Option<&(dyn Fn(&W) -> bool + Send + Sync)>,
		weighter: Option<&(dyn Fn(&W) -> i64 + Send + Sync)>,
	) -> Result<W, QueueError> {
		let mut first_attempt = true;
		loop {
			let wait_on = {
				let mut g = self.inner.lock().unwrap();
				if g.closed {
					return Err(QueueError::Closed);
				}
				if !g.queue.is_empty() {
					None
				} else {
					let (tx, rx) = oneshot::channel();
					let id = g.next_waiter_id;
					g.next_waiter_id += 1;
					if first_attempt {
						g.waiters.push_back(Waiter { id, tx });
					} else {
						// Re-woken but lost the race for the item: keep our
						// place by re-entering at the head, not the tail.
						g.waiters.push_front(Waiter { id, tx });
					}
					Some((id, rx))
				}
			};

			let Some((id, rx)) = wait_on else { break };
			first_attempt = false;

			let guard = WaiterGuard {
				inner: &self.inner,
				id,
			};
			match rx.await {
				Ok(true) => return Err(QueueError::Closed),
				Ok(false) => {
					// Woken normally; loop back and re-check the queue.
					std::mem::forget(guard);
				}
				Err(_) => {
					// Sender dropped without firing: queue is shutting
					// down. The closed check at the top of the loop will
					// catch it on the next iteration.
					std::mem::forget(guard);
				}
			}
		}

		let mut g = self.inner.lock().unwrap();
		Ok(select_and_remove(&mut g.queue, condition, weighter))
	}

	/// Return `worker` to the idle set. `put_in_front=true` (LIFO, warm
	/// caches) is the default; in-transaction releases pass `false` so a
	/// normal request is less likely to land on a worker holding a specific
	/// transaction's state.
	pub fn release(&self, worker: W, put_in_front: bool) {
		let mut g = self.inner.lock().unwrap();
		if put_in_front {
			g.queue.push_front(worker);
		} else {
			g.queue.push_back(worker);
		}
		wake_next_waiter(&mut g);
	}

	/// Mark the queue closed: every outstanding and future `acquire` fails
	/// with [`QueueError::Closed`].
	pub fn close(&self) {
		let mut g = self.inner.lock().unwrap();
		g.closed = true;
		for waiter in g.waiters.drain(..) {
			let _ = waiter.tx.send(true);
		}
	}

	/// Non-blocking variant of [`WorkerQueue::acquire`]: returns `None`
	/// immediately if no worker is idle right now instead of waiting, and
	/// never enters the waiter line. Used by callers that want to drain
	/// idle workers opportunistically (e.g. scaling a pool down) rather
	/// than compete with ordinary callers for the next release.
	pub fn try_acquire(&self, weighter: Option<&(dyn Fn(&W) -> i64 + Send + Sync)>) -> Option<W> {
		let mut g = self.inner.lock().unwrap();
		if g.closed || g.queue.is_empty() {
			return None;
		}
		Some(select_and_remove(&mut g.queue, None, weighter))
	}

	#[must_use]
	pub fn qsize(&self) -> usize {
		self.inner.lock().unwrap().queue.len()
	}

	#[must_use]
	pub fn count_waiters(&self) -> usize {
		self.inner.lock().unwrap().waiters.len()
	}
}

struct WaiterGuard<'a, W> {
	inner: &'a Mutex<Inner<W>>,
	id: u64,
}

impl<'a, W> Drop for WaiterGuard<'a, W> {
	fn drop(&mut self) {
		let mut g = self.inner.lock().unwrap();
		if let Some(pos) = g.waiters.iter().position(|w| w.id == self.id) {
			g.waiters.remove(pos);
		} else {
			// We were already popped by a release() that intended to wake
			// us, but we're bailing out without consuming our turn. Pass
			// the baton on rather than stranding that slot.
			wake_next_waiter(&mut g);
		}
	}
}

fn wake_next_waiter<W>(inner: &mut Inner<W>) {
	while let Some(waiter) = inner.waiters.pop_front() {
		if waiter.tx.send(false).is_ok() {
			break;
		}
		// Receiver already gone (its acquire() was cancelled); try the
		// next one in line.
	}
}

fn select_and_remove<W>(
	queue: &mut VecDeque<W>,
	condition: Option<&(dyn Fn(&W) -> bool + Send + Sync)>,
	weighter: Option<&(dyn Fn(&W) -> i64 + Send + Sync)>,
) -> W {
	if let Some(condition) = condition {
		if let Some(pos) = queue.iter().position(|w| condition(w)) {
			return queue.remove(pos).expect("position came from this deque");
		}
	}
	if let Some(weighter) = weighter {
		let mut best_idx = 0;
		let mut best_weight = weighter(&queue[0]);
		for (i, w) in queue.iter().enumerate().skip(1) {
			let weight = weighter(w);
			if weight > best_weight {
				best_weight = weight;
				best_idx = i;
			}
		}
		return queue.remove(best_idx).expect("best_idx came from this deque");
	}
	queue.pop_front().expect("caller only calls with a non-empty queue")
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn acquire_returns_immediately_when_idle() {
		let q: WorkerQueue<u32> = WorkerQueue::new();
		q.release(7, true);
		assert_eq!(q.acquire(None, None).await.unwrap(), 7);
	}

	#[tokio::test]
	async fn acquire_blocks_until_release() {
		let q = Arc::new(WorkerQueue::<u32>::new());
		let q2 = q.clone();
		let handle = tokio::spawn(async move { q2.acquire(None, None).await.unwrap() });
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(q.count_waiters(), 1);
		q.release(99, true);
		assert_eq!(handle.await.unwrap(), 99);
	}

	#[tokio::test]
	async fn lifo_release_by_default() {
		let q: WorkerQueue<u32> = WorkerQueue::new();
		q.release(1, false);
		q.release(2, true);
		assert_eq!(q.acquire(None, None).await.unwrap(), 2);
		assert_eq!(q.acquire(None, None).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn condition_picks_matching_worker_out_of_order() {
		let q: WorkerQueue<u32> = WorkerQueue::new();
		q.release(1, true);
		q.release(2, true);
		q.release(3, true);
		let got = q.acquire(Some(&|w: &u32| *w == 2), None).await.unwrap();
		assert_eq!(got, 2);
		assert_eq!(q.qsize(), 2);
	}

	#[tokio::test]
	async fn weighter_picks_max_weight() {
		let q: WorkerQueue<u32> = WorkerQueue::new();
		q.release(1, true);
		q.release(5, true);
		q.release(3, true);
		let got = q.acquire(None, Some(&|w: &u32| *w as i64)).await.unwrap();
		assert_eq!(got, 5);
	}

	#[tokio::test]
	async fn cancelled_waiter_wakes_the_next_one() {
		let q = Arc::new(WorkerQueue::<u32>::new());
		let q_a = q.clone();
		let a = tokio::spawn(async move { q_a.acquire(None, None).await });
		tokio::time::sleep(Duration::from_millis(10)).await;

		let q_b = q.clone();
		let b = tokio::spawn(async move { q_b.acquire(None, None).await.unwrap() });
		tokio::time::sleep(Duration::from_millis(10)).await;

		// Release a worker: this wakes `a` first (it was waiting first).
		q.release(42, true);
		// Cancel `a` right away, before it gets to run its wakeup.
		a.abort();
		let _ = a.await;

		// `b` must still receive the worker even though `a` never consumed
		// its wakeup.
		let got = tokio::time::timeout(Duration::from_millis(200), b).await;
		assert_eq!(got.unwrap().unwrap(), 42);
	}

	#[tokio::test]
	async fn try_acquire_never_blocks_on_an_empty_queue() {
		let q: WorkerQueue<u32> = WorkerQueue::new();
		assert_eq!(q.try_acquire(None), None);
		q.release(1, true);
		assert_eq!(q.try_acquire(None), Some(1));
		assert_eq!(q.try_acquire(None), None);
	}

	#[tokio::test]
	async fn close_fails_pending_and_future_acquires() {
		let q = Arc::new(WorkerQueue::<u32>::new());
		let q2 = q.clone();
		let pending = tokio::spawn(async move { q2.acquire(None, None).await });
		tokio::time::sleep(Duration::from_millis(10)).await;

		q.close();
		assert!(matches!(pending.await.unwrap(), Err(QueueError::Closed)));
		assert!(matches!(q.acquire(None, None).await, Err(QueueError::Closed)));
	}
}
