//! Integration Tests for Async Cells
//!
//! These tests drive async derivations from a tokio runtime and verify
//! pending propagation, staleness, abort signals, and reads and writes
//! made by futures.

use std::cell::{Cell as Counter, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::oneshot;
use trellis_core::utils::loadable;
use trellis_core::{AbortSignal, Cell, Error, Status, Store, WritableCell};

type Senders = Rc<RefCell<Vec<oneshot::Sender<i32>>>>;

/// An async cell whose value arrives through a channel, scaled by `factor`.
fn remote(factor: &WritableCell<i32>, senders: &Senders) -> Cell<i32> {
    let (f, tx) = (factor.clone(), Rc::clone(senders));
    Cell::derived_async(move |get, _| {
        let factor = get.get(&f)?;
        let (sender, receiver) = oneshot::channel();
        tx.borrow_mut().push(sender);
        Ok(async move {
            let value = receiver.await.map_err(|_| Error::msg("sender dropped"))?;
            Ok::<_, Error>(value * factor)
        })
    })
}

/// Readers see `Pending` until the future settles.
#[tokio::test]
async fn pending_until_resolved() {
    let store = Store::new();
    let factor = WritableCell::primitive(1);
    let senders = Senders::default();
    let user = remote(&factor, &senders);

    assert!(matches!(store.get(&user), Err(Error::Pending(_))));
    assert_eq!(store.status(&user), Status::Pending);
    assert_eq!(store.pending_count(), 1);

    let sender = senders.borrow_mut().remove(0);
    sender.send(7).unwrap();
    assert_eq!(store.resolve(&user).await.unwrap(), 7);
    assert_eq!(store.pending_count(), 0);
}

/// A superseded result is discarded even if it arrives.
#[tokio::test]
async fn stale_results_are_discarded() {
    let store = Store::new();
    let factor = WritableCell::primitive(1);
    let senders = Senders::default();
    let user = remote(&factor, &senders);

    let calls = Rc::new(Counter::new(0));
    let n = Rc::clone(&calls);
    let _sub = store.sub(&user, move || n.set(n.get() + 1)).unwrap();

    store.set(&factor, 2).unwrap();
    assert_eq!(store.pending_count(), 1);
    let mut pending = std::mem::take(&mut *senders.borrow_mut());
    let current = pending.pop().unwrap();
    let stale = pending.remove(0);

    // The stale future may already be gone.
    let _ = stale.send(10);
    current.send(20).unwrap();
    let before = calls.get();
    store.flush_pending().await.unwrap();

    assert_eq!(store.get(&user).unwrap(), 40);
    assert_eq!(calls.get(), before + 1);
}

/// Superseding a derivation raises the previous run's abort signal.
#[tokio::test]
async fn supersede_raises_abort_signal() {
    let store = Store::new();
    let id = WritableCell::primitive(1);
    let signals: Rc<RefCell<Vec<AbortSignal>>> = Rc::default();

    let (i, sig) = (id.clone(), Rc::clone(&signals));
    let profile = Cell::derived_async(move |get, options| {
        let id = get.get(&i)?;
        let signal = options.signal();
        sig.borrow_mut().push(signal.clone());
        Ok(async move {
            // The first request only finishes by being cancelled.
            if id == 1 {
                signal.aborted().await;
                return Err(Error::msg("aborted"));
            }
            Ok(id * 10)
        })
    });
    let _sub = store.sub(&profile, || {}).unwrap();

    store.set(&id, 2).unwrap();
    {
        let signals = signals.borrow();
        assert!(signals[0].is_aborted());
        assert!(!signals.last().unwrap().is_aborted());
    }

    store.flush_pending().await.unwrap();
    assert_eq!(store.get(&profile).unwrap(), 20);
}

/// A superseded future that never finishes does not hold up
/// `flush_pending`, and stops counting as in flight.
#[tokio::test]
async fn superseded_futures_are_dropped() {
    let store = Store::new();
    let id = WritableCell::primitive(1);
    let i = id.clone();
    let profile = Cell::derived_async(move |get, _| {
        let id = get.get(&i)?;
        Ok(async move {
            if id == 1 {
                std::future::pending::<()>().await;
            }
            Ok::<_, Error>(id * 10)
        })
    });
    let _sub = store.sub(&profile, || {}).unwrap();
    assert_eq!(store.pending_count(), 1);

    store.set(&id, 2).unwrap();
    assert_eq!(store.pending_count(), 1);

    tokio::time::timeout(Duration::from_secs(5), store.flush_pending())
        .await
        .expect("flush_pending waited on a superseded future")
        .unwrap();
    assert_eq!(store.pending_count(), 0);
    assert_eq!(store.get(&profile).unwrap(), 20);
}

/// Cells the future reads after the derivation returned are dependencies:
/// they are mounted, and a change to them starts a new derivation.
#[tokio::test]
async fn future_reads_are_tracked() {
    let store = Store::new();
    let offset = WritableCell::primitive(100);
    let senders = Senders::default();

    let (o, tx) = (offset.clone(), Rc::clone(&senders));
    let total = Cell::derived_async(move |_, options| {
        let get = options.getter();
        let o = o.clone();
        let (sender, receiver) = oneshot::channel();
        tx.borrow_mut().push(sender);
        Ok(async move {
            let value = receiver.await.map_err(|_| Error::msg("sender dropped"))?;
            Ok::<_, Error>(value + get.get(&o)?)
        })
    });

    let calls = Rc::new(Counter::new(0));
    let n = Rc::clone(&calls);
    let _sub = store.sub(&total, move || n.set(n.get() + 1)).unwrap();
    assert!(!store.is_mounted(&offset));

    senders.borrow_mut().remove(0).send(1).unwrap();
    store.flush_pending().await.unwrap();
    assert_eq!(store.get(&total).unwrap(), 101);
    assert!(store.is_mounted(&offset));
    assert_eq!(calls.get(), 1);

    store.set(&offset, 200).unwrap();
    assert_eq!(store.status(&total), Status::Pending);
    senders.borrow_mut().remove(0).send(2).unwrap();
    store.flush_pending().await.unwrap();
    assert_eq!(store.get(&total).unwrap(), 202);
}

/// A writable async cell writes itself from its future through `set_self`,
/// and is refused while the derivation itself is still running.
#[tokio::test]
async fn futures_write_through_set_self() {
    let store = Store::new();
    let input = WritableCell::primitive(3);
    let received = WritableCell::primitive(0);
    let refused_early = Rc::new(Counter::new(false));

    let (i, r, early) = (input.clone(), received.clone(), Rc::clone(&refused_early));
    let echo = WritableCell::<i32, i32>::derived_async(
        move |get, options| {
            let v = get.get(&i)?;
            let set_self = options.set_self::<i32, ()>();
            early.set(matches!(set_self.set(-1), Err(Error::SetSelfInRead(_))));
            Ok(async move {
                set_self.set(v * 2)?;
                Ok::<_, Error>(v)
            })
        },
        move |set, v: i32| set.set(&r, v),
    );

    let _sub = store.sub(&echo, || {}).unwrap();
    assert!(refused_early.get());
    assert_eq!(store.get(&received).unwrap(), 0);

    store.flush_pending().await.unwrap();
    assert_eq!(store.get(&received).unwrap(), 6);
    assert_eq!(store.get(&echo).unwrap(), 3);
}

/// A derivation reading a pending cell is pending too, and recovers once
/// the dependency settles.
#[tokio::test]
async fn pending_is_contagious() {
    let store = Store::new();
    let factor = WritableCell::primitive(1);
    let senders = Senders::default();
    let source = remote(&factor, &senders);

    let s = source.clone();
    let plus_one = Cell::derived(move |get| Ok(get.get(&s)? + 1));

    assert!(matches!(store.get(&plus_one), Err(Error::Pending(_))));
    assert_eq!(store.status(&plus_one), Status::Pending);

    let sender = senders.borrow_mut().remove(0);
    sender.send(41).unwrap();
    assert_eq!(store.resolve(&plus_one).await.unwrap(), 42);
}

/// `loadable` turns the pending state into a value.
#[tokio::test]
async fn loadable_reports_loading_then_ready() {
    let store = Store::new();
    let factor = WritableCell::primitive(1);
    let senders = Senders::default();
    let source = remote(&factor, &senders);
    let view = loadable(&source);

    let calls = Rc::new(Counter::new(0));
    let n = Rc::clone(&calls);
    let _sub = store.sub(&view, move || n.set(n.get() + 1)).unwrap();
    assert!(store.get(&view).unwrap().is_loading());

    let sender = senders.borrow_mut().remove(0);
    sender.send(5).unwrap();
    store.flush_pending().await.unwrap();

    assert_eq!(store.get(&view).unwrap().ready(), Some(&5));
    assert_eq!(calls.get(), 1);
}

/// Resolving a cell that nothing in flight can settle fails instead of
/// waiting forever.
#[tokio::test]
async fn resolve_reports_stall() {
    let store = Store::new();
    let other = WritableCell::primitive(0);
    let waiting_on = other.id();
    let stuck = Cell::<i32>::derived(move |_| Err(Error::Pending(waiting_on)));

    let err = store.resolve(&stuck).await.unwrap_err();
    assert!(matches!(err, Error::Stalled(id) if id == stuck.id()));
}

/// A failed future stores its error like a failed derivation.
#[tokio::test]
async fn failed_future_stores_error() {
    let store = Store::new();
    let factor = WritableCell::primitive(1);
    let senders = Senders::default();
    let source = remote(&factor, &senders);

    assert!(store.get(&source).is_err());
    senders.borrow_mut().clear();

    let err = store.resolve(&source).await.unwrap_err();
    assert_eq!(err.to_string(), "sender dropped");
    assert_eq!(store.status(&source), Status::Error);
}
