
mod common;

use common::SimClock;
use eventq::Dispatch;
use eventq::Eventq;

use std::cell::Cell;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[test]
fn test_cancel() {
    let q = Eventq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    let id = q.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    assert_eq!(q.cancel(id), true);
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_dont() {
    let q = Eventq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    let id = q.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();
    q.dispatch_ready();

    assert_eq!(q.cancel(id), false);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_twice() {
    let q = Eventq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    let id = q.call_in(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    assert_eq!(q.cancel(id), true);
    assert_eq!(q.cancel(id), false);

    assert_eq!(count.load(Ordering::SeqCst), 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_many() {
    let q = Eventq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    let mut ids = vec![];
    for _ in 0..1000 {
        ids.push(q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap());
    }

    for id in ids {
        assert_eq!(q.cancel(id), true);
    }
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_many_reversed() {
    let q = Eventq::with_size(1024*1024);

    let count = AtomicU32::new(0);
    let mut ids = vec![];
    for _ in 0..1000 {
        ids.push(q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap());
    }

    for &id in ids.iter().rev() {
        assert_eq!(q.cancel(id), true);
    }
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_interior_sibling() {
    let q = Eventq::with_clock(1024*1024, SimClock::new());

    // cancel the middle of a coincident group, then shuffle the
    // group's neighborhood to make sure the links survived
    let count = AtomicU32::new(0);
    let mut ids = vec![];
    for _ in 0..3 {
        ids.push(q.call_in(10, || {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap());
    }
    q.call_in(20, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    assert_eq!(q.cancel(ids[1]), true);
    q.dispatch(30);

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(q.usage().pending, 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_pending_never_runs() {
    let q = Eventq::with_clock(1024*1024, SimClock::new());

    let count = AtomicU32::new(0);
    let id = q.call_in(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    q.clock().advance(10);
    assert_eq!(q.cancel(id), true);
    assert_eq!(q.dispatch(200), Dispatch::Timeout);

    // never ran and the chunk is back in the free index
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(q.usage().pending, 0);
    assert!(q.usage().slab_fragmented > 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_in_flight() {
    let q = Eventq::with_clock(1024*1024, SimClock::new());

    // a periodic event cancelling itself mid-callback must not be
    // re-posted, and must be freed exactly once
    let count = AtomicU32::new(0);
    let id = Cell::new(None);
    {
        let count = &count;
        let id = &id;
        let q2 = &q;
        id.set(Some(q.call_every(10, move || {
            count.fetch_add(1, Ordering::SeqCst);
            assert_eq!(q2.cancel(id.get().unwrap()), true);
        }).unwrap()));
    }

    assert_eq!(q.dispatch(50), Dispatch::Timeout);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(q.usage().pending, 0);
    assert_eq!(q.usage().slab_used, 0);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_many_periodic() {
    let q = Eventq::with_clock(1024*1024, SimClock::new());

    let count = AtomicU32::new(0);
    let mut ids = vec![];
    for i in 0..10 {
        for _ in 0..100 {
            ids.push(q.call_every(i*100 + 100, || {
                count.fetch_add(1, Ordering::SeqCst);
            }).unwrap());
        }
    }

    q.dispatch(1100);
    let before = count.load(Ordering::SeqCst);
    assert!(before > 0);

    for id in ids {
        assert_eq!(q.cancel(id), true);
    }

    q.dispatch(1100);
    let after = count.load(Ordering::SeqCst);

    assert_eq!(before, after);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_cancel_unposted_handle() {
    let q = Eventq::with_size(1024*1024);

    // a negative delay destroys the event instead of posting it, the
    // returned handle must already be dead
    let count = AtomicU32::new(0);
    let id = q.alloc_from(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap()
        .delay(-1)
        .post();

    assert_eq!(q.cancel(id), false);
    q.dispatch_ready();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(q.usage().slab_fragmented > 0);

    // even after the slot is recycled
    let id2 = q.call_in(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();
    assert_eq!(q.cancel(id), false);
    assert_eq!(q.cancel(id2), true);

    println!("usage: {:#?}", q.usage());
}
