
#![deny(missing_debug_implementations)]

use core::alloc::Layout;
use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::mem::forget;
use core::mem::size_of;
use core::mem::align_of;
use core::num::NonZeroU32;
use core::ops::Deref;
use core::ops::DerefMut;
use core::ptr;
use core::ptr::drop_in_place;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering as AtomicOrdering;

use log::debug;
use log::trace;
use parking_lot::Mutex;
use static_assertions::const_assert;
use thiserror::Error;

pub mod sys;
pub mod traits;
mod util;

pub use sys::itick;
pub use sys::utick;
pub use sys::SysClock;
pub use traits::Clock;
pub use traits::Post;
pub use traits::Sema;
pub use traits::Signal;

use util::*;


/// Event queue errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The backing region can't fit the allocation right now, it may
    /// succeed again after pending events complete
    #[error("Out of memory")]
    NoMem,
    /// The provided backing region is unusably small after alignment
    #[error("Backing region too small")]
    TooSmall,
}

/// Why dispatch returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The requested time budget elapsed
    Timeout,
    /// Someone asked us to stop via break_
    Break,
}

/// An opaque handle to a posted event, for cancellation
///
/// One 32-bit word holding the event's slot offset in the low bits and
/// its generation in the high bits, so a handle can never confuse an
/// event with a later reuse of its slot. Zero is never a valid handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(0x{:08x})", self.0.get())
    }
}


// alignment of every chunk in the backing region, chunk sizes are
// rounded up to this so payloads directly follow their headers
const ALIGN: usize = size_of::<usize>();

/// Offset of an event header within the backing region, 0 is null
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
struct Eptr(u32);

impl fmt::Debug for Eptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // these really need to be in hex to be readable
        write!(f, "Eptr(0x{:x})", self.0)
    }
}

impl Eptr {
    const NULL: Eptr = Eptr(0);

    fn from<C: Clock + Sema>(q: &Eventq<C>, e: &Enode) -> Eptr {
        unsafe {
            Eptr(
                (e as *const Enode as *const u8)
                    .offset_from(q.slab.as_ptr())
                    as u32
            )
        }
    }

    fn as_ref<'a, C: Clock + Sema>(self, q: &'a Eventq<C>) -> Option<&'a Enode> {
        if self.0 != 0 {
            debug_assert!(self.0 as usize + size_of::<Enode>() <= q.len as usize);
            Some(unsafe { &*(q.slab.as_ptr().add(self.0 as usize) as *const Enode) })
        } else {
            None
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn as_mut<'a, C: Clock + Sema>(self, q: &'a Eventq<C>) -> Option<&'a mut Enode> {
        if self.0 != 0 {
            debug_assert!(self.0 as usize + size_of::<Enode>() <= q.len as usize);
            Some(unsafe { &mut *(q.slab.as_ptr().add(self.0 as usize) as *mut Enode) })
        } else {
            None
        }
    }
}

/// The unique cell pointing at a linked event, either the pending
/// queue's head, some event's next, or some event's sibling
///
/// This is what makes unlink O(1) without a walk.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
struct Eref(u32);

const SIBLING: u32 = 1 << 31;

impl fmt::Debug for Eref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eref(0x{:x})", self.0)
    }
}

impl Eref {
    const HEAD: Eref = Eref(0);

    fn next_of(e: Eptr) -> Eref {
        Eref(e.0)
    }

    fn sibling_of(e: Eptr) -> Eref {
        Eref(e.0 | SIBLING)
    }

    fn is_sibling(self) -> bool {
        self.0 & SIBLING != 0
    }

    fn owner(self) -> Eptr {
        Eptr(self.0 & !SIBLING)
    }
}

/// Where an event is in its lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum State {
    /// Parked in the free chunk index
    Free = 0,
    /// Allocated and staged, not yet posted
    Idle = 1,
    /// Linked in the pending queue
    Pending = 2,
    /// Dequeued for dispatch, owned by the dispatcher
    InFlight = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Free,
            1 => State::Idle,
            2 => State::Pending,
            _ => State::InFlight,
        }
    }
}

/// Internal event header, payload bytes directly follow
///
/// gen and state are atomic because a stale cancel may probe them while
/// the slot's new owner stages it outside any lock. The locks still
/// order every transition cancel acts on, the atomics only make the
/// no-op probe well-defined, so relaxed accesses are enough.
#[derive(Debug)]
#[repr(C)]
struct Enode {
    // chunk size in bytes including this header, word-rounded
    size: u32,
    // identity generation, always >= 1
    gen: AtomicU32,
    state: AtomicU8,

    // absolute due tick while pending
    target: utick,
    // staged relative delay, < 0 suppresses posting
    delay: itick,
    // re-enqueue delay after completion, -1 = one-shot
    period: itick,

    next: Eptr,
    sibling: Eptr,
    backref: Eref,

    cb: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
}

// handle encoding and payload placement depend on this
const_assert!(size_of::<Enode>() % ALIGN == 0);
const_assert!(align_of::<Enode>() <= ALIGN);

impl Enode {
    fn gen(&self) -> u32 {
        self.gen.load(AtomicOrdering::Relaxed)
    }

    fn set_gen(&self, gen: u32) {
        self.gen.store(gen, AtomicOrdering::Relaxed);
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(AtomicOrdering::Relaxed))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, AtomicOrdering::Relaxed);
    }

    unsafe fn as_ptr<T>(&self) -> *const T {
        (self as *const Enode).add(1) as *const T
    }

    unsafe fn as_mut_ptr<T>(&mut self) -> *mut T {
        (self as *mut Enode).add(1) as *mut T
    }

    unsafe fn from_mut_ptr<'a, T>(p: *mut T) -> Option<&'a mut Enode> {
        if !p.is_null() {
            Some(&mut *(p as *mut Enode).sub(1))
        } else {
            None
        }
    }
}

// allocator state, protected by memlock
#[derive(Debug)]
struct MemState {
    // bump cursor into never-touched region bytes
    slab_off: u32,
    // size-ordered free chunk index, same-size chunks chain as siblings
    chunks: Eptr,
}

// pending queue state, protected by queuelock
#[derive(Debug)]
struct QueueState {
    // target-ordered primary chain, coincident targets chain as siblings
    queue: Eptr,
    // outstanding requests for a dispatcher to return
    breaks: u32,
}

/// Event queue struct
///
/// All events live in one fixed backing region handed out by a bump
/// slab and recycled through a size-ordered free chunk index. Any
/// number of threads may post and cancel, one thread at a time may
/// dispatch.
#[derive(Debug)]
pub struct Eventq<C: Clock + Sema = SysClock> {
    slab: NonNull<u8>,
    len: u32,
    npw2: u8,
    // words to reconstruct the owned allocation, 0 when borrowed
    owned_words: usize,

    memlock: Mutex<MemState>,
    queuelock: Mutex<QueueState>,

    clock: C,
}

unsafe impl<C: Clock + Sema> Send for Eventq<C> {}
unsafe impl<C: Clock + Sema> Sync for Eventq<C> {}

impl Eventq<SysClock> {
    /// Create an event queue with an internally allocated backing
    /// region of roughly the given size
    pub fn with_size(size: usize) -> Eventq {
        Self::with_clock(size, SysClock::new())
    }

    /// Create an event queue backed by a caller-provided buffer
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Eventq, Error> {
        Self::with_buffer_and_clock(buffer, SysClock::new())
    }
}

impl<C: Clock + Sema> Eventq<C> {
    /// Create an event queue with a custom clock/semaphore
    /// implementation
    pub fn with_clock(size: usize, clock: C) -> Eventq<C> {
        let words = alignup(size, ALIGN) / size_of::<usize>();
        let buffer = vec![0usize; words].into_boxed_slice();
        let len = buffer.len() * size_of::<usize>();
        let slab = Box::into_raw(buffer) as *mut u8;

        unsafe { Self::init(NonNull::new_unchecked(slab), len, words, clock) }
    }

    /// Create an event queue backed by a caller-provided buffer, with a
    /// custom clock/semaphore implementation
    pub fn with_buffer_and_clock(
        buffer: &'static mut [u8],
        clock: C
    ) -> Result<Eventq<C>, Error> {
        // align buffer
        let skip = alignup(buffer.as_ptr() as usize, ALIGN)
            - buffer.as_ptr() as usize;
        if buffer.len() < skip + ALIGN + size_of::<Enode>() {
            return Err(Error::TooSmall);
        }

        let len = aligndown(buffer.len() - skip, ALIGN);
        let slab = unsafe { buffer.as_mut_ptr().add(skip) };

        Ok(unsafe { Self::init(NonNull::new_unchecked(slab), len, 0, clock) })
    }

    unsafe fn init(
        slab: NonNull<u8>,
        len: usize,
        owned_words: usize,
        clock: C
    ) -> Eventq<C> {
        // the handle format needs room for at least one generation bit
        // above the offset field
        assert!(len <= 1 << 30, "backing region too large for 32-bit handles");

        Eventq {
            slab: slab,
            len: len as u32,
            npw2: npw2(len),
            owned_words: owned_words,

            memlock: Mutex::new(MemState {
                // offset 0 is reserved so it can serve as the null link
                slab_off: ALIGN as u32,
                chunks: Eptr::NULL,
            }),
            queuelock: Mutex::new(QueueState {
                queue: Eptr::NULL,
                breaks: 0,
            }),

            clock: clock,
        }
    }

    /// The queue's clock, mostly useful for tests with virtual time
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn contains(&self, e: &Enode) -> bool {
        let p = e as *const Enode as usize;
        let base = self.slab.as_ptr() as usize;
        p >= base && p < base + self.len as usize
    }

    // Handle encoding

    fn id_of(&self, e: &Enode) -> Id {
        let off = Eptr::from(self, e).0;
        Id(NonZeroU32::new((e.gen() << self.npw2) | off).unwrap())
    }

    fn decode(&self, id: Id) -> (u32, u32) {
        let mask = (1u32 << self.npw2) - 1;
        (id.0.get() >> self.npw2, id.0.get() & mask)
    }

    // increment a generation, skipping 0 and wrapping before the
    // field bleeds into the handle's sign bit
    fn incid(&self, gen: u32) -> u32 {
        if (gen + 1) >> (31 - self.npw2 as u32) != 0 {
            return 1;
        }

        gen + 1
    }

    // Memory management

    fn mem_alloc(&self, size: usize) -> Option<&mut Enode> {
        let size = alignup(size + size_of::<Enode>(), ALIGN);
        let mut mem = self.memlock.lock();

        // first fit on the size-ordered index is best fit over
        // distinct sizes
        let mut prev = Eptr::NULL;
        let mut p = mem.chunks;
        while let Some(c) = p.as_mut(self) {
            if c.size as usize >= size {
                // pop the primary, promoting its first same-size
                // sibling if it has one
                let replacement = match c.sibling.as_mut(self) {
                    Some(s) => {
                        s.next = c.next;
                        c.sibling
                    }
                    None => c.next,
                };
                match prev.as_mut(self) {
                    Some(pr) => pr.next = replacement,
                    None => mem.chunks = replacement,
                }

                return Some(c);
            }

            prev = p;
            p = c.next;
        }

        // fall back to never-touched slab bytes
        let remaining = (self.len as usize).saturating_sub(mem.slab_off as usize);
        if remaining >= size {
            let off = mem.slab_off;
            mem.slab_off += size as u32;
            drop(mem);

            let e = unsafe { self.slab.as_ptr().add(off as usize) as *mut Enode };
            unsafe {
                e.write(Enode {
                    size: size as u32,
                    gen: AtomicU32::new(1),
                    state: AtomicU8::new(State::Idle as u8),

                    target: 0,
                    delay: 0,
                    period: -1,

                    next: Eptr::NULL,
                    sibling: Eptr::NULL,
                    backref: Eref::HEAD,

                    cb: None,
                    dtor: None,
                });
            }
            return Some(unsafe { &mut *e });
        }

        None
    }

    fn mem_dealloc(&self, e: &mut Enode) {
        debug_assert!(self.contains(e));
        let mut mem = self.memlock.lock();

        // find the first chunk at least as large
        let mut prev = Eptr::NULL;
        let mut p = mem.chunks;
        while let Some(c) = p.as_ref(self) {
            if c.size >= e.size {
                break;
            }

            prev = p;
            p = c.next;
        }

        match p.as_mut(self) {
            // exact size match, e becomes the new primary with the old
            // primary heading its sibling chain
            Some(c) if c.size == e.size => {
                e.sibling = p;
                e.next = c.next;
            }
            // otherwise a new distinct size slots in here
            _ => {
                e.sibling = Eptr::NULL;
                e.next = p;
            }
        }
        e.set_state(State::Free);

        let ep = Eptr::from(self, e);
        match prev.as_mut(self) {
            Some(pr) => pr.next = ep,
            None => mem.chunks = ep,
        }
    }

    // Queue management, all under queuelock

    fn set_cell(&self, qs: &mut QueueState, cell: Eref, val: Eptr) {
        match cell.owner().as_mut(self) {
            None => qs.queue = val,
            Some(o) if cell.is_sibling() => o.sibling = val,
            Some(o) => o.next = val,
        }
    }

    fn enqueue(&self, qs: &mut QueueState, e: &mut Enode, ms: utick) {
        e.target = self.clock.now().wrapping_add(ms);

        // walk the primary chain to our landing spot
        let mut cell = Eref::HEAD;
        let mut p = qs.queue;
        while let Some(c) = p.as_ref(self) {
            if scmp(c.target, e.target) != Ordering::Less {
                break;
            }

            cell = Eref::next_of(p);
            p = c.next;
        }

        let ep = Eptr::from(self, e);
        match p.as_mut(self) {
            // coincident target, e becomes the group's new primary and
            // the old primary heads its sibling chain
            Some(c) if c.target == e.target => {
                c.backref = Eref::sibling_of(ep);
                e.sibling = p;

                if let Some(n) = c.next.as_mut(self) {
                    n.backref = Eref::next_of(ep);
                }
                e.next = c.next;
                c.next = Eptr::NULL;
            }
            // otherwise a new primary slots in before the landing spot
            landing => {
                if let Some(c) = landing {
                    c.backref = Eref::next_of(ep);
                }
                e.next = p;
                e.sibling = Eptr::NULL;
            }
        }

        e.backref = cell;
        self.set_cell(qs, cell, ep);
    }

    fn unqueue(&self, qs: &mut QueueState, e: &mut Enode) {
        if e.backref.is_sibling() {
            // a group member, splice it out of the sibling chain
            if let Some(s) = e.sibling.as_mut(self) {
                s.backref = e.backref;
            }
            self.set_cell(qs, e.backref, e.sibling);
        } else if e.sibling.as_ref(self).is_some() {
            // a group primary with members, promote the first sibling
            // into its place on the primary chain
            if let Some(n) = e.next.as_mut(self) {
                n.backref = Eref::next_of(e.sibling);
            }
            let s = e.sibling.as_mut(self).unwrap();
            s.next = e.next;
            s.backref = e.backref;
            self.set_cell(qs, e.backref, e.sibling);
        } else {
            // a lone primary
            if let Some(n) = e.next.as_mut(self) {
                n.backref = e.backref;
            }
            self.set_cell(qs, e.backref, e.next);
        }
    }

    // collect everything due at now into a flat dispatch list, oldest
    // post first within a group, and report the next deadline
    fn dequeue(&self, qs: &mut QueueState, now: utick) -> (Eptr, itick) {
        let mut head = Eptr::NULL;
        let mut tail = Eptr::NULL;
        let mut deadline = -1;

        while let Some(es) = qs.queue.as_ref(self) {
            let diff = sdiff(es.target, now);
            if diff > 0 {
                deadline = diff;
                break;
            }

            let es_ptr = qs.queue;
            qs.queue = es.next;

            // the sibling chain is newest-first, reverse it so posting
            // order is preserved in the dispatch list
            let mut prev = Eptr::NULL;
            let mut cur = es_ptr;
            while let Some(c) = cur.as_mut(self) {
                let sibling = c.sibling;
                c.next = prev;
                prev = cur;
                cur = sibling;
            }

            match tail.as_mut(self) {
                Some(t) => t.next = prev,
                None => head = prev,
            }
            tail = es_ptr;
        }

        if let Some(h) = qs.queue.as_mut(self) {
            h.backref = Eref::HEAD;
        }

        (head, deadline)
    }

    // Handling of raw allocations

    /// Allocate a staged event with room for a payload of the given
    /// layout, returning the payload pointer, or null when the backing
    /// region is exhausted
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized, and must be returned to
    /// this queue via post_raw or dealloc_raw.
    pub unsafe fn alloc_raw(&self, layout: Layout) -> *mut u8 {
        assert!(layout.align() <= ALIGN);

        match self.mem_alloc(layout.size()) {
            Some(e) => {
                e.set_state(State::Idle);
                e.delay = 0;
                e.period = -1;
                e.cb = None;
                e.dtor = None;
                e.as_mut_ptr()
            }
            None => ptr::null_mut(),
        }
    }

    /// Destroy an event, invoking its dtor if one was set and returning
    /// the chunk to the free index
    ///
    /// # Safety
    ///
    /// p must have come from alloc_raw on this queue and must not be
    /// currently posted.
    pub unsafe fn dealloc_raw(&self, p: *mut u8) {
        let e = match Enode::from_mut_ptr(p) {
            Some(e) => e,
            None => return, // do nothing
        };
        debug_assert!(self.contains(e));

        if let Some(dtor) = e.dtor {
            dtor(p);
        }

        self.mem_dealloc(e);
    }

    /// Stage a relative delay in ticks, negative suppresses posting
    ///
    /// # Safety
    ///
    /// p must be a staged allocation from alloc_raw on this queue.
    pub unsafe fn delay_raw(&self, p: *mut u8, ms: itick) {
        let e = Enode::from_mut_ptr(p).unwrap();
        debug_assert_eq!(e.state(), State::Idle);
        e.delay = ms;
    }

    /// Stage a re-post period in ticks, negative means one-shot
    ///
    /// # Safety
    ///
    /// p must be a staged allocation from alloc_raw on this queue.
    pub unsafe fn period_raw(&self, p: *mut u8, ms: itick) {
        let e = Enode::from_mut_ptr(p).unwrap();
        debug_assert_eq!(e.state(), State::Idle);
        e.period = ms;
    }

    /// Stage a destructor, run on the payload exactly once when the
    /// event is destroyed
    ///
    /// # Safety
    ///
    /// p must be a staged allocation from alloc_raw on this queue.
    pub unsafe fn dtor_raw(&self, p: *mut u8, dtor: fn(*mut u8)) {
        let e = Enode::from_mut_ptr(p).unwrap();
        debug_assert_eq!(e.state(), State::Idle);
        e.dtor = Some(dtor);
    }

    /// Post a staged event, transferring it to the queue
    ///
    /// Always returns a handle. A negative staged delay destroys the
    /// event instead of posting it, and the returned handle is already
    /// stale.
    ///
    /// # Safety
    ///
    /// p must be a staged allocation from alloc_raw on this queue, cb
    /// will be invoked with it from the dispatching thread.
    pub unsafe fn post_raw(&self, cb: fn(*mut u8), p: *mut u8) -> Id {
        let e = Enode::from_mut_ptr(p).unwrap();
        debug_assert!(self.contains(e));
        debug_assert_eq!(e.state(), State::Idle);
        e.cb = Some(cb);

        let id = self.id_of(e);
        if e.delay < 0 {
            // never posted, retire the generation so the handle we
            // hand back stays stale across slot reuse
            e.set_gen(self.incid(e.gen()));
            self.dealloc_raw(p);
            return id;
        }

        let delay = e.delay as utick;
        {
            let mut qs = self.queuelock.lock();
            e.set_state(State::Pending);
            self.enqueue(&mut qs, e, delay);
        }
        self.clock.signal();

        trace!("posted {:?} delay {}", id, delay);
        id
    }

    // Scheduling functions

    /// Cancel a posted event
    ///
    /// Returns true if this call kept the event's callback from running
    /// or kept a periodic event from re-posting. Stale handles are a
    /// no-op, callers racing dispatch can't know whether the event
    /// already fired.
    pub fn cancel(&self, id: Id) -> bool {
        let (gen, off) = self.decode(id);
        // a handle can outlive anything, be paranoid about the decode
        if (off as usize) < ALIGN
            || off >= self.len
            || off as usize % ALIGN != 0
        {
            return false;
        }
        let e = match Eptr(off).as_mut(self) {
            Some(e) => e,
            None => return false,
        };

        let mut qs = self.queuelock.lock();
        if e.gen() != gen {
            return false;
        }

        match e.state() {
            State::InFlight => {
                // the dispatcher owns it now, strip the callback and
                // periodicity and let the dispatcher retire it
                e.cb = None;
                e.period = -1;
                trace!("cancelled in-flight {:?}", id);
                true
            }
            State::Pending => {
                self.unqueue(&mut qs, e);
                e.set_gen(self.incid(e.gen()));
                e.set_state(State::Idle);
                drop(qs);

                unsafe { self.dealloc_raw(e.as_mut_ptr()) };
                trace!("cancelled {:?}", id);
                true
            }
            _ => false,
        }
    }

    /// Ask one in-progress dispatch to return
    ///
    /// Sticky, a break posted with no dispatcher running makes the next
    /// dispatch return immediately.
    pub fn break_(&self) {
        {
            let mut qs = self.queuelock.lock();
            qs.breaks += 1;
        }
        self.clock.signal();
        debug!("break requested");
    }

    /// Dispatch events for roughly the given number of ticks, negative
    /// dispatches until broken
    ///
    /// Only one thread may dispatch at a time.
    pub fn dispatch(&self, ms: itick) -> Dispatch {
        let timeout = self.clock.now().wrapping_add(ms as utick);

        loop {
            // collect all due events and the next deadline, marking
            // them in-flight so cancel knows who owns them
            let (mut es, mut deadline) = {
                let mut qs = self.queuelock.lock();
                let now = self.clock.now();
                let (head, deadline) = self.dequeue(&mut qs, now);

                let mut p = head;
                while let Some(e) = p.as_mut(self) {
                    e.set_state(State::InFlight);
                    p = e.next;
                }

                (head, deadline)
            };

            // dispatch events
            while let Some(e) = es.as_mut(self) {
                es = e.next;

                // the final invocation decision races cancel, settle
                // it under queuelock
                let cb = {
                    let _qs = self.queuelock.lock();
                    e.cb
                };
                if let Some(cb) = cb {
                    cb(unsafe { e.as_mut_ptr() });
                }

                // either re-post periodic events, measured from
                // completion, or retire the generation and dealloc
                let mut qs = self.queuelock.lock();
                if e.period >= 0 {
                    let period = e.period as utick;
                    e.set_state(State::Pending);
                    self.enqueue(&mut qs, e, period);
                    drop(qs);
                    self.clock.signal();
                } else {
                    e.set_gen(self.incid(e.gen()));
                    e.set_state(State::Idle);
                    drop(qs);

                    unsafe { self.dealloc_raw(e.as_mut_ptr()) };
                }
            }

            // check if we should stop dispatching soon
            if ms >= 0 {
                let diff = sdiff(timeout, self.clock.now());
                if diff <= 0 {
                    return Dispatch::Timeout;
                }

                if deadline < 0 || diff < deadline {
                    deadline = diff;
                }
            }

            // wait for something to happen
            self.clock.wait(deadline);

            // were we asked to break out?
            let mut qs = self.queuelock.lock();
            if qs.breaks > 0 {
                qs.breaks -= 1;
                debug!("dispatch broken");
                return Dispatch::Break;
            }
        }
    }

    /// Dispatch only the events that are already due
    pub fn dispatch_ready(&self) -> Dispatch {
        self.dispatch(0)
    }
}

impl<C: Clock + Sema> Drop for Eventq<C> {
    fn drop(&mut self) {
        // run destructors on everything still pending, walking every
        // member of every group
        let mut p = self.queuelock.get_mut().queue;
        while let Some(es) = p.as_ref(self) {
            let mut s = p;
            while let Some(e) = s.as_ref(self) {
                if let Some(dtor) = e.dtor {
                    dtor(unsafe { e.as_ptr::<u8>() as *mut u8 });
                }
                s = e.sibling;
            }
            p = es.next;
        }

        if self.owned_words > 0 {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.slab.as_ptr() as *mut usize,
                    self.owned_words,
                )));
            }
        }
    }
}


/// A staged typed event, configure then post
#[derive(Debug)]
pub struct Event<'a, T, C: Clock + Sema = SysClock> {
    q: &'a Eventq<C>,
    e: &'a mut Enode,
    _phantom: PhantomData<T>,
}

impl<C: Clock + Sema> Eventq<C> {
    /// Allocate a staged event holding the given payload
    pub fn alloc_from<T>(&self, t: T) -> Result<Event<'_, T, C>, Error> {
        assert!(align_of::<T>() <= ALIGN);

        let e = self.mem_alloc(size_of::<T>()).ok_or(Error::NoMem)?;
        e.set_state(State::Idle);
        e.delay = 0;
        e.period = -1;
        e.cb = None;
        e.dtor = None;
        unsafe { e.as_mut_ptr::<T>().write(t); }

        Ok(Event {
            q: self,
            e: e,
            _phantom: PhantomData,
        })
    }
}

impl<'a, T, C: Clock + Sema> Event<'a, T, C> {
    /// Run the event after the given number of ticks
    pub fn delay(mut self, ms: itick) -> Self {
        self.e.delay = ms;
        self
    }

    /// Re-post the event this many ticks after each completion
    pub fn period(mut self, ms: itick) -> Self {
        self.e.period = ms;
        self
    }
}

impl<'a, T: Post, C: Clock + Sema> Event<'a, T, C> {
    /// Post the event, the queue owns it from here
    pub fn post(mut self) -> Id {
        // cb/drop thunks
        fn cb_thunk<T: Post>(p: *mut u8) {
            unsafe { &mut *(p as *mut T) }.post();
        }

        fn drop_thunk<T>(p: *mut u8) {
            unsafe { drop_in_place(p as *mut T) };
        }

        self.e.dtor = Some(drop_thunk::<T>);

        let q = self.q;
        let p = unsafe { self.e.as_mut_ptr::<u8>() };
        forget(self);

        unsafe { q.post_raw(cb_thunk::<T>, p) }
    }
}

impl<T, C: Clock + Sema> Drop for Event<'_, T, C> {
    fn drop(&mut self) {
        // make sure we clean up if the event is never posted
        unsafe { drop_in_place(self.e.as_mut_ptr::<T>()) };
        self.q.mem_dealloc(self.e);
    }
}

impl<T, C: Clock + Sema> Deref for Event<'_, T, C> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.e.as_ptr() }
    }
}

impl<T, C: Clock + Sema> DerefMut for Event<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.e.as_mut_ptr() }
    }
}

impl<T, C: Clock + Sema> AsRef<T> for Event<'_, T, C> {
    fn as_ref(&self) -> &T {
        self.deref()
    }
}

impl<T, C: Clock + Sema> AsMut<T> for Event<'_, T, C> {
    fn as_mut(&mut self) -> &mut T {
        self.deref_mut()
    }
}

impl<C: Clock + Sema> Eventq<C> {
    // convenience functions

    /// Post a callback to run as soon as possible
    pub fn call<F: Post>(&self, cb: F) -> Result<Id, Error> {
        Ok(self.alloc_from(cb)?
            .post())
    }

    /// Post a callback to run after a delay in ticks
    pub fn call_in<F: Post>(&self, ms: itick, cb: F) -> Result<Id, Error> {
        Ok(self.alloc_from(cb)?
            .delay(ms)
            .post())
    }

    /// Post a callback to run every ms ticks, measured from each
    /// completion
    pub fn call_every<F: Post>(&self, ms: itick, cb: F) -> Result<Id, Error> {
        Ok(self.alloc_from(cb)?
            .delay(ms)
            .period(ms)
            .post())
    }
}


/// A snapshot of where the backing region's bytes are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub slab_total: usize,
    pub slab_used: usize,
    pub slab_fragmented: usize,
    pub pending: usize,
}

impl<C: Clock + Sema> Eventq<C> {
    pub fn usage(&self) -> Usage {
        let (consumed, fragmented) = {
            let mem = self.memlock.lock();

            let mut fragmented = 0;
            let mut p = mem.chunks;
            while let Some(c) = p.as_ref(self) {
                let mut s = p;
                while let Some(e) = s.as_ref(self) {
                    fragmented += e.size as usize;
                    s = e.sibling;
                }
                p = c.next;
            }

            (mem.slab_off as usize - ALIGN, fragmented)
        };

        let pending = {
            let qs = self.queuelock.lock();

            let mut pending = 0;
            let mut p = qs.queue;
            while let Some(es) = p.as_ref(self) {
                let mut s = p;
                while let Some(e) = s.as_ref(self) {
                    pending += 1;
                    s = e.sibling;
                }
                p = es.next;
            }

            pending
        };

        Usage {
            slab_total: (self.len as usize).saturating_sub(ALIGN),
            slab_used: consumed - fragmented,
            slab_fragmented: fragmented,
            pending: pending,
        }
    }
}
