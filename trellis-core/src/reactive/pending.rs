//! Asynchronous Resolution
//!
//! An async derivation reads its dependencies synchronously and hands back
//! a future. The store parks the cell on a fresh [`PendingToken`] and keeps
//! the future in its in-flight set until the host drives it.
//!
//! # Staleness
//!
//! Tokens are compared by identity. When a future settles, its result is
//! committed only if the cell still carries the token the future was
//! started with. A newer derivation replaces the token, raises the old
//! one's [`AbortSignal`] and aborts the old future, which is then dropped
//! from the in-flight set without being polled again.
//!
//! # Driving
//!
//! The store never spawns. [`Store::flush_pending`] polls the in-flight set
//! until it is empty, and [`Store::resolve`] polls until one cell leaves
//! the pending state. Both can be awaited from any executor.

use std::cell::{Cell as Flag, RefCell};
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::future::{AbortHandle, AbortRegistration, Abortable, LocalBoxFuture};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::cell::{Cell, CellDef, CellValue, Value};
use super::runtime::Store;
use crate::error::{Error, Result};
use crate::graph::Dependency;

// ----------------------------------------------------------------------------
// Abort signal
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SignalState {
    aborted: bool,
    wakers: SmallVec<[Waker; 2]>,
}

/// Raised when the derivation that produced it has been superseded.
///
/// The store drops a superseded future at its next await point. The signal
/// reaches work the future handed off elsewhere; it is `Send`, so it can
/// be given to another thread.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<Mutex<SignalState>>,
}

impl AbortSignal {
    /// Whether the signal has been raised.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// A future that completes once the signal is raised.
    pub fn aborted(&self) -> Aborted {
        Aborted {
            signal: self.clone(),
        }
    }

    fn raise(&self) {
        let wakers = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Future returned by [`AbortSignal::aborted`].
pub struct Aborted {
    signal: AbortSignal,
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.signal.state.lock();
        if state.aborted {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// ----------------------------------------------------------------------------
// Pending tokens
// ----------------------------------------------------------------------------

struct TokenInner {
    signal: Option<AbortSignal>,
    /// Stops the backing future. `None` for waiting tokens.
    task: Option<AbortHandle>,
    registration: RefCell<Option<AbortRegistration>>,
    aborted: Flag<bool>,
}

/// Identity of one outstanding resolution.
#[derive(Clone)]
pub(crate) struct PendingToken(Rc<TokenInner>);

impl PendingToken {
    /// Token for an in-flight future.
    pub(crate) fn new() -> Self {
        let (task, registration) = AbortHandle::new_pair();
        Self(Rc::new(TokenInner {
            signal: Some(AbortSignal::default()),
            task: Some(task),
            registration: RefCell::new(Some(registration)),
            aborted: Flag::new(false),
        }))
    }

    /// Token for a cell that is pending because a dependency is.
    ///
    /// No future backs it; the cell re-derives when the dependency settles.
    pub(crate) fn waiting() -> Self {
        Self(Rc::new(TokenInner {
            signal: None,
            task: None,
            registration: RefCell::new(None),
            aborted: Flag::new(false),
        }))
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.0.task.is_none()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.0.aborted.get()
    }

    pub(crate) fn signal(&self) -> Option<&AbortSignal> {
        self.0.signal.as_ref()
    }

    pub(crate) fn ptr_eq(&self, other: &PendingToken) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn take_registration(&self) -> Option<AbortRegistration> {
        self.0.registration.borrow_mut().take()
    }

    /// Abort the backing future and raise the derivation's signal.
    pub(crate) fn abort(&self) {
        if self.0.aborted.replace(true) {
            return;
        }
        if let Some(task) = &self.0.task {
            task.abort();
        }
        if let Some(signal) = &self.0.signal {
            signal.raise();
        }
    }
}

// ----------------------------------------------------------------------------
// In-flight set
// ----------------------------------------------------------------------------

/// A finished future, tagged with the token it was started under.
pub(crate) struct Settled {
    pub(crate) def: Rc<CellDef>,
    pub(crate) token: PendingToken,
    pub(crate) result: Result<Value>,
}

/// A task leaving the in-flight set. `result` is `None` if it was aborted.
struct Finished {
    def: Rc<CellDef>,
    token: PendingToken,
    result: Option<Result<Value>>,
}

type Task = LocalBoxFuture<'static, Finished>;

/// Futures owned by a store.
///
/// New futures are queued in `incoming` so that spawning never needs the
/// running set, which is moved out while it is being polled.
#[derive(Default)]
pub(crate) struct TaskQueue {
    running: RefCell<FuturesUnordered<Task>>,
    incoming: RefCell<Vec<Task>>,
    /// Tokens of every task not yet finished, aborted ones included.
    in_flight: RefCell<Vec<PendingToken>>,
    waker: RefCell<Option<Waker>>,
}

impl TaskQueue {
    pub(crate) fn spawn(
        &self,
        def: Rc<CellDef>,
        token: PendingToken,
        future: LocalBoxFuture<'static, Result<Value>>,
    ) {
        let registration = token
            .take_registration()
            .unwrap_or_else(|| AbortHandle::new_pair().1);
        self.in_flight.borrow_mut().push(token.clone());
        let task = Abortable::new(future, registration)
            .map(move |outcome| Finished {
                def,
                token,
                result: outcome.ok(),
            })
            .boxed_local();
        self.incoming.borrow_mut().push(task);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Number of tasks that have not finished and were not superseded.
    pub(crate) fn len(&self) -> usize {
        self.in_flight
            .borrow()
            .iter()
            .filter(|token| !token.is_aborted())
            .count()
    }

    fn forget(&self, token: &PendingToken) {
        self.in_flight.borrow_mut().retain(|t| !t.ptr_eq(token));
    }

    /// Poll for the next finished future. `None` when nothing is in flight.
    ///
    /// Aborted futures are dropped here and never reported.
    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Settled>> {
        let mut running = std::mem::take(&mut *self.running.borrow_mut());
        running.extend(self.incoming.borrow_mut().drain(..));
        if running.is_empty() {
            return Poll::Ready(None);
        }
        let polled = loop {
            match running.poll_next_unpin(cx) {
                Poll::Ready(Some(finished)) => {
                    self.forget(&finished.token);
                    let Finished { def, token, result } = finished;
                    match result {
                        Some(result) => break Poll::Ready(Some(Settled { def, token, result })),
                        None => debug!(cell = %def.id, "superseded future dropped"),
                    }
                }
                Poll::Ready(None) => break Poll::Ready(None),
                Poll::Pending => break Poll::Pending,
            }
        };
        // Futures spawned while polling went to `incoming`.
        let spawned: Vec<_> = self.incoming.borrow_mut().drain(..).collect();
        let respawn = !spawned.is_empty();
        running.extend(spawned);
        *self.running.borrow_mut() = running;
        let polled = match polled {
            Poll::Ready(None) if respawn => Poll::Pending,
            other => other,
        };
        if polled.is_pending() {
            if respawn {
                cx.waker().wake_by_ref();
            }
            *self.waker.borrow_mut() = Some(cx.waker().clone());
        }
        polled
    }
}

// ----------------------------------------------------------------------------
// Store integration
// ----------------------------------------------------------------------------

impl Store {
    /// Number of futures still in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Drive every in-flight future to completion, committing results.
    ///
    /// Futures started while settling others are driven too. Errors from
    /// listeners or effects triggered by the commits are collected.
    pub async fn flush_pending(&self) -> Result<()> {
        let mut errors = Vec::new();
        while let Some(settled) = self.next_settled().await {
            if let Err(error) = self.settle(settled) {
                errors.push(error);
            }
        }
        Error::collect(errors)
    }

    /// Wait until `cell` is no longer pending and return its outcome.
    ///
    /// Fails with [`Error::Stalled`] if the cell is pending but nothing is
    /// left in flight to settle it.
    pub async fn resolve<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        loop {
            match self.get(cell) {
                Err(Error::Pending(_)) => {}
                other => return other,
            }
            match self.next_settled().await {
                Some(settled) => self.settle(settled)?,
                None => return Err(Error::Stalled(cell.id())),
            }
        }
    }

    async fn next_settled(&self) -> Option<Settled> {
        poll_fn(|cx| self.inner.tasks.poll_next(cx)).await
    }

    /// Record a read made by a running future as a dependency of its cell.
    ///
    /// Ignored once `token` is no longer the cell's current one. A mounted
    /// cell mounts a newly read dependency and the store flushes.
    pub(crate) fn track_async_read(
        &self,
        cell: &Rc<CellDef>,
        token: &PendingToken,
        dependency: Dependency,
    ) -> Result<()> {
        let id = dependency.def.id;
        let mount = {
            let mut graph = self.inner.graph.borrow_mut();
            let mounted = graph.is_mounted(cell.id);
            let Some(state) = graph.states.get_mut(&cell.id) else {
                return Ok(());
            };
            if !state.pending().is_some_and(|pending| pending.ptr_eq(token)) {
                trace!(cell = %cell.id, dependency = %id, "read from a superseded future");
                return Ok(());
            }
            let added = state.dependencies.insert(id, dependency).is_none();
            mounted && added
        };
        if mount {
            debug!(cell = %cell.id, dependency = %id, "async dependency mounted");
            self.mount_dependencies(cell);
            self.end_transaction()?;
        }
        Ok(())
    }

    /// Commit a finished future if its token is still current.
    fn settle(&self, settled: Settled) -> Result<()> {
        let Settled { def, token, result } = settled;
        let id = def.id;
        {
            let mut graph = self.inner.graph.borrow_mut();
            let current = graph
                .states
                .get(&id)
                .and_then(|state| state.pending())
                .is_some_and(|pending| pending.ptr_eq(&token));
            if !current {
                debug!(cell = %id, "discarding stale async result");
                return Ok(());
            }
            let displaced = graph.states.get_mut(&id).map(|state| state.settle(result));
            graph.mark_changed(id);
            drop(graph);
            drop(displaced);
        }
        debug!(cell = %id, "async result committed");
        self.end_transaction()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagWaker(AtomicBool);

    impl std::task::Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn signal_wakes_waiters_once_raised() {
        let signal = AbortSignal::default();
        let flag = Arc::new(FlagWaker(AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);

        let mut aborted = signal.aborted();
        assert!(Pin::new(&mut aborted).poll(&mut cx).is_pending());
        assert!(!signal.is_aborted());

        signal.raise();
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(Pin::new(&mut aborted).poll(&mut cx).is_ready());
    }

    #[test]
    fn tokens_compare_by_identity() {
        let a = PendingToken::new();
        let b = PendingToken::new();
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert!(PendingToken::waiting().is_waiting());
        assert!(!a.is_waiting());
    }

    #[test]
    fn abort_raises_the_derivation_signal() {
        let token = PendingToken::new();
        let signal = token.signal().cloned().unwrap();
        token.abort();
        assert!(signal.is_aborted());
        assert!(token.is_aborted());
    }

    #[test]
    fn aborted_tasks_are_dropped_unreported() {
        let queue = TaskQueue::default();
        let cell = Cell::<i32>::derived(|_| Ok(0));
        let waker = Waker::from(Arc::new(FlagWaker(AtomicBool::new(false))));
        let mut cx = Context::from_waker(&waker);

        let stale = PendingToken::new();
        let never = std::future::pending::<Result<Value>>().boxed_local();
        queue.spawn(Rc::clone(&cell.def), stale.clone(), never);
        let live = PendingToken::new();
        let ready = async { Ok(Rc::new(1_i32) as Value) }.boxed_local();
        queue.spawn(Rc::clone(&cell.def), live.clone(), ready);
        assert_eq!(queue.len(), 2);

        stale.abort();
        assert_eq!(queue.len(), 1);

        match queue.poll_next(&mut cx) {
            Poll::Ready(Some(settled)) => assert!(settled.token.ptr_eq(&live)),
            _ => panic!("expected the live task to settle"),
        }
        assert!(matches!(queue.poll_next(&mut cx), Poll::Ready(None)));
        assert_eq!(queue.len(), 0);
    }
}
