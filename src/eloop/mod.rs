//!
//! A single-threaded, callback-oriented event loop.
//!
//! The loop multiplexes level-triggered fd readiness, POSIX signals (through
//! signalfd), monotonic timers (through timerfd) and idle tasks on one epoll
//! set. It is the sole scheduler of this crate: every other module registers
//! its file descriptors here and gets called back from [`EventLoop::dispatch`].
//!
//! ## How to use it
//!
//! ```no_run
//! use seatmux::eloop::{EventLoop, Readiness};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let _source = event_loop
//!     .add_fd(0 /* stdin */, Readiness::READABLE, |ready| {
//!         println!("stdin became {:?}", ready);
//!     })
//!     .unwrap();
//! event_loop.run(None).unwrap();
//! ```
//!
//! Sources are handles: dropping a [`FdSource`], [`SignalSource`],
//! [`TimerSource`] or [`IdleSource`] unregisters the callback. Removal is
//! safe from within any callback of the same loop; a source removed while a
//! dispatch pass is in flight will not be called again during that pass.
//!
//! Loops can be nested: [`EventLoop::add_nested`] attaches a child loop as a
//! single fd source of the parent, dispatching the child with a zero timeout
//! whenever the child has pending events.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    os::unix::io::RawFd,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;
use tracing::{trace, warn};

mod signals;
mod timer;

pub use nix::sys::signal::Signal;
pub use nix::sys::signalfd::siginfo;
pub use signals::SignalSource;
pub use timer::{TimerSource, TimerSpec};

bitflags::bitflags! {
    /// Readiness mask of an fd source.
    ///
    /// `READABLE` and `WRITABLE` may be requested when registering; `HUP` and
    /// `ERR` are always reported when the kernel flags them, regardless of the
    /// registered mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        /// The fd can be read without blocking
        const READABLE = 0x01;
        /// The fd can be written without blocking
        const WRITABLE = 0x02;
        /// The peer hung up
        const HUP = 0x04;
        /// The fd is in an error state
        const ERR = 0x08;
    }
}

fn epoll_mask(mask: Readiness) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if mask.contains(Readiness::READABLE) {
        flags |= EpollFlags::EPOLLIN;
    }
    if mask.contains(Readiness::WRITABLE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn ready_mask(flags: EpollFlags) -> Readiness {
    let mut mask = Readiness::empty();
    if flags.contains(EpollFlags::EPOLLIN) {
        mask |= Readiness::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        mask |= Readiness::WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        mask |= Readiness::HUP;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        mask |= Readiness::ERR;
    }
    mask
}

/// Errors related to the event loop
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to create the epoll set
    #[error("Failed to create the epoll set")]
    CreatePoll(#[source] nix::Error),
    /// The fd is already part of the readiness set
    #[error("The fd is already registered with this event loop")]
    AlreadyRegistered,
    /// The source is not (or no longer) registered with this loop
    #[error("The source is not registered with this event loop")]
    NotRegistered,
    /// A loop cannot be attached to itself
    #[error("An event loop cannot be nested within itself")]
    SelfNesting,
    /// Failed to modify the readiness set
    #[error("Failed to update the readiness set")]
    PollCtl(#[source] nix::Error),
    /// The readiness wait itself failed
    #[error("The readiness wait failed")]
    Dispatch(#[source] nix::Error),
    /// Failed to adjust the process signal mask
    #[error("Failed to adjust the process signal mask")]
    SignalMask(#[source] nix::Error),
    /// Failed to create a signalfd
    #[error("Failed to create the signal fd for {signal}")]
    CreateSignalFd {
        /// The signal that was being subscribed
        signal: Signal,
        /// The underlying OS error
        #[source]
        source: nix::Error,
    },
    /// Failed to create a timerfd
    #[error("Failed to create a timer fd")]
    CreateTimer(#[source] nix::Error),
    /// Failed to program a timerfd
    #[error("Failed to program a timer fd")]
    SetTimer(#[source] nix::Error),
}

type FdCallback = RefCell<Box<dyn FnMut(Readiness)>>;
type IdleCallback = RefCell<dyn FnMut()>;

pub(crate) struct FdInner {
    fd: RawFd,
    token: u64,
    mask: Cell<Readiness>,
    cb: FdCallback,
    owner: RefCell<Weak<LoopInner>>,
}

#[derive(Clone)]
struct ScratchSlot {
    token: u64,
    ready: Readiness,
    source: Rc<FdInner>,
}

/// A registered fd watch.
///
/// Dropping the handle removes the fd from the loop. The handle is exclusively
/// owned by whoever registered the fd; it cannot be cloned.
pub struct FdSource {
    inner: Rc<FdInner>,
}

impl fmt::Debug for FdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSource")
            .field("fd", &self.inner.fd)
            .field("mask", &self.inner.mask.get())
            .finish_non_exhaustive()
    }
}

impl Drop for FdSource {
    fn drop(&mut self) {
        let owner = self.inner.owner.borrow().upgrade();
        if let Some(owner) = owner {
            owner.remove_source(&self.inner);
        }
    }
}

/// An idle task.
///
/// The callback runs once per dispatch pass, before the readiness wait.
/// Dropping the handle removes the task.
pub struct IdleSource {
    cb: Rc<IdleCallback>,
}

impl fmt::Debug for IdleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleSource").finish_non_exhaustive()
    }
}

pub(crate) struct LoopInner {
    epfd: RawFd,
    sources: RefCell<HashMap<u64, Rc<FdInner>>>,
    scratch: RefCell<Vec<Option<ScratchSlot>>>,
    idle: RefCell<Vec<Weak<IdleCallback>>>,
    signals: RefCell<HashMap<i32, Rc<signals::SignalMux>>>,
    next_token: Cell<u64>,
    exiting: Cell<bool>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        if let Err(err) = close(self.epfd) {
            warn!("Failed to close the epoll fd: {}", err);
        }
    }
}

/// Handle to an event loop.
///
/// This is a handle to the inner loop state, it can be cloned; all clones
/// drive the same epoll set.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("epfd", &self.inner.epfd)
            .field("sources", &self.inner.sources.borrow().len())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Create a new event loop with its own epoll set.
    pub fn new() -> Result<EventLoop, Error> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::CreatePoll)?;
        Ok(EventLoop {
            inner: Rc::new(LoopInner {
                epfd,
                sources: RefCell::new(HashMap::new()),
                scratch: RefCell::new(Vec::new()),
                idle: RefCell::new(Vec::new()),
                signals: RefCell::new(HashMap::new()),
                next_token: Cell::new(1),
                exiting: Cell::new(false),
            }),
        })
    }

    /// Register an fd with the given readiness mask.
    ///
    /// The mask may be empty; `HUP` and `ERR` conditions are reported either
    /// way. Registering an fd that is already part of this loop's readiness
    /// set fails with [`Error::AlreadyRegistered`].
    pub fn add_fd<F>(&self, fd: RawFd, mask: Readiness, cb: F) -> Result<FdSource, Error>
    where
        F: FnMut(Readiness) + 'static,
    {
        LoopInner::add_fd(&self.inner, fd, mask, cb)
    }

    /// Atomically replace the readiness mask of a registered fd.
    pub fn update_fd(&self, source: &FdSource, mask: Readiness) -> Result<(), Error> {
        if !self.owns(&source.inner) {
            return Err(Error::NotRegistered);
        }
        let mut event = EpollEvent::new(epoll_mask(mask), source.inner.token);
        epoll_ctl(
            self.inner.epfd,
            EpollOp::EpollCtlMod,
            source.inner.fd,
            &mut event,
        )
        .map_err(Error::PollCtl)?;
        source.inner.mask.set(mask);
        Ok(())
    }

    /// Remove an fd watch.
    ///
    /// Safe to call from within the watch's own callback: a pending readiness
    /// event that has not been delivered yet in the current pass is dropped.
    pub fn remove_fd(&self, source: &FdSource) -> Result<(), Error> {
        if !self.owns(&source.inner) {
            return Err(Error::NotRegistered);
        }
        self.inner.remove_source(&source.inner);
        Ok(())
    }

    /// Subscribe to a POSIX signal.
    ///
    /// The first subscription for a signal number blocks the signal
    /// process-wide and routes it through a shared signalfd. The signal is
    /// never unblocked again, even when the last subscription is dropped,
    /// because other subsystems may rely on the same routing. Subscribers
    /// are invoked in registration order.
    pub fn add_signal<F>(&self, signal: Signal, cb: F) -> Result<SignalSource, Error>
    where
        F: FnMut(&siginfo) + 'static,
    {
        signals::add_signal(&self.inner, signal, cb)
    }

    /// Create a monotonic timer.
    ///
    /// The callback receives the number of expirations since it last ran.
    /// Use [`TimerSource::update`] to re-arm or disarm.
    pub fn add_timer<F>(&self, spec: TimerSpec, cb: F) -> Result<TimerSource, Error>
    where
        F: FnMut(u64) + 'static,
    {
        timer::add_timer(&self.inner, spec, cb)
    }

    /// Register an idle task.
    ///
    /// Idle tasks run once per dispatch pass before the readiness wait, in
    /// registration order. A task registered while a pass is running is first
    /// invoked on the next pass.
    pub fn add_idle<F>(&self, cb: F) -> IdleSource
    where
        F: FnMut() + 'static,
    {
        let rc = Rc::new(RefCell::new(cb));
        let weak = Rc::downgrade(&rc) as Weak<IdleCallback>;
        self.inner.idle.borrow_mut().push(weak);
        IdleSource { cb: rc }
    }

    /// Remove an idle task without dropping its handle.
    pub fn remove_idle(&self, task: &IdleSource) {
        let weak = Rc::downgrade(&task.cb);
        self.inner.idle.borrow_mut().retain(|w| !Weak::ptr_eq(w, &weak));
    }

    /// Attach a child loop as a single fd source of this loop.
    ///
    /// Whenever the child has pending events, the parent dispatches it with a
    /// zero timeout. The returned source detaches the child when dropped.
    pub fn add_nested(&self, child: &EventLoop) -> Result<FdSource, Error> {
        if Rc::ptr_eq(&self.inner, &child.inner) {
            return Err(Error::SelfNesting);
        }
        let child = child.clone();
        LoopInner::add_fd(&self.inner, child.inner.epfd, Readiness::READABLE, move |_| {
            if let Err(err) = child.dispatch(Some(Duration::ZERO)) {
                warn!("Dispatching a nested loop failed: {}", err);
            }
        })
    }

    /// Perform one dispatch pass.
    ///
    /// The pass runs all idle tasks, waits once on the readiness set for at
    /// most `timeout` (`None` blocks indefinitely), and delivers the returned
    /// events in kernel order. Readiness-wait failures other than `EINTR` are
    /// returned verbatim.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.inner.dispatch(timeout)
    }

    /// Dispatch until [`EventLoop::exit`] is called or `timeout` elapses.
    pub fn run(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.inner.exiting.set(false);
        while !self.inner.exiting.get() {
            let step = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
            };
            self.dispatch(step)?;
        }
        Ok(())
    }

    /// Make the innermost [`EventLoop::run`] return after the current pass.
    pub fn exit(&self) {
        self.inner.exiting.set(true);
    }

    fn owns(&self, inner: &FdInner) -> bool {
        inner
            .owner
            .borrow()
            .upgrade()
            .map(|owner| Rc::ptr_eq(&owner, &self.inner))
            .unwrap_or(false)
    }
}

impl LoopInner {
    fn add_fd<F>(this: &Rc<Self>, fd: RawFd, mask: Readiness, cb: F) -> Result<FdSource, Error>
    where
        F: FnMut(Readiness) + 'static,
    {
        let token = this.next_token.get();
        this.next_token.set(token + 1);
        let mut event = EpollEvent::new(epoll_mask(mask), token);
        epoll_ctl(this.epfd, EpollOp::EpollCtlAdd, fd, &mut event).map_err(|err| match err {
            nix::errno::Errno::EEXIST => Error::AlreadyRegistered,
            err => Error::PollCtl(err),
        })?;
        let inner = Rc::new(FdInner {
            fd,
            token,
            mask: Cell::new(mask),
            cb: RefCell::new(Box::new(cb)),
            owner: RefCell::new(Rc::downgrade(this)),
        });
        this.sources.borrow_mut().insert(token, inner.clone());
        Ok(FdSource { inner })
    }

    fn remove_source(&self, inner: &FdInner) {
        if self.sources.borrow_mut().remove(&inner.token).is_some() {
            // The fd may already be gone; a stale DEL is harmless.
            if let Err(err) = epoll_ctl(self.epfd, EpollOp::EpollCtlDel, inner.fd, None) {
                trace!("Removing fd {} from the epoll set failed: {}", inner.fd, err);
            }
            // Null the scratch slot so a pending event is not delivered.
            for slot in self.scratch.borrow_mut().iter_mut() {
                if slot.as_ref().map(|s| s.token) == Some(inner.token) {
                    *slot = None;
                }
            }
        }
        inner.owner.replace(Weak::new());
    }

    fn dispatch(&self, timeout: Option<Duration>) -> Result<(), Error> {
        // Idle phase. Operate on a snapshot: tasks registered from within a
        // callback must not run before the next pass, removed tasks must not
        // run at all.
        let snapshot: Vec<_> = self.idle.borrow().clone();
        for weak in snapshot {
            if let Some(cb) = weak.upgrade() {
                (cb.borrow_mut())();
            }
        }
        self.idle.borrow_mut().retain(|w| w.strong_count() > 0);

        // A queued exit must not keep us in a blocking wait.
        let timeout_ms: isize = match timeout {
            _ if self.exiting.get() => 0,
            None => -1,
            Some(t) => t.as_millis().min(isize::MAX as u128) as isize,
        };
        let mut events = [EpollEvent::empty(); 32];
        let count = match epoll_wait(self.epfd, &mut events, timeout_ms) {
            Ok(count) => count,
            // With all handled signals routed through signalfd an interrupted
            // wait carries no information; treat it as an empty pass.
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(Error::Dispatch(err)),
        };

        {
            let sources = self.sources.borrow();
            let mut scratch = self.scratch.borrow_mut();
            scratch.clear();
            for event in &events[..count] {
                let token = event.data();
                scratch.push(sources.get(&token).map(|source| ScratchSlot {
                    token,
                    ready: ready_mask(event.events()),
                    source: source.clone(),
                }));
            }
        }

        let len = self.scratch.borrow().len();
        for idx in 0..len {
            // Re-check each slot: a callback may have nulled later entries.
            let slot = self.scratch.borrow()[idx].clone();
            if let Some(slot) = slot {
                (slot.source.cb.borrow_mut())(slot.ready);
            }
        }
        self.scratch.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::os::unix::io::RawFd;
    use std::rc::Rc;

    fn pipe() -> (RawFd, RawFd) {
        nix::unistd::pipe().unwrap()
    }

    #[test]
    fn idle_order_and_deferred_registration() {
        let event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _a = event_loop.add_idle(move || o.borrow_mut().push("a"));
        let o = order.clone();
        let late: Rc<RefCell<Option<IdleSource>>> = Rc::new(RefCell::new(None));
        let late2 = late.clone();
        let inner_loop = event_loop.clone();
        let _b = event_loop.add_idle(move || {
            o.borrow_mut().push("b");
            if late2.borrow().is_none() {
                let o2 = o.clone();
                *late2.borrow_mut() = Some(inner_loop.add_idle(move || o2.borrow_mut().push("late")));
            }
        });
        let o = order.clone();
        let _c = event_loop.add_idle(move || o.borrow_mut().push("c"));

        event_loop.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);

        event_loop.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "c", "a", "b", "late", "c"]);
    }

    #[test]
    fn idle_self_removal() {
        let event_loop = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        let slot: Rc<RefCell<Option<IdleSource>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let c = count.clone();
        let task = event_loop.add_idle(move || {
            c.set(c.get() + 1);
            slot2.borrow_mut().take();
        });
        *slot.borrow_mut() = Some(task);

        event_loop.dispatch(Some(Duration::ZERO)).unwrap();
        event_loop.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn fd_readiness() {
        let event_loop = EventLoop::new().unwrap();
        let (rx, tx) = pipe();

        let got = Rc::new(Cell::new(Readiness::empty()));
        let g = got.clone();
        let _source = event_loop
            .add_fd(rx, Readiness::READABLE, move |ready| g.set(ready))
            .unwrap();

        nix::unistd::write(tx, b"x").unwrap();
        event_loop.dispatch(Some(Duration::from_millis(100))).unwrap();
        assert!(got.get().contains(Readiness::READABLE));

        let _ = nix::unistd::close(rx);
        let _ = nix::unistd::close(tx);
    }

    #[test]
    fn removal_during_dispatch_suppresses_delivery() {
        let event_loop = EventLoop::new().unwrap();
        let (rx1, tx1) = pipe();
        let (rx2, tx2) = pipe();

        let second: Rc<RefCell<Option<FdSource>>> = Rc::new(RefCell::new(None));
        let second_fired = Rc::new(Cell::new(false));

        let s = second.clone();
        let _first = event_loop
            .add_fd(rx1, Readiness::READABLE, move |_| {
                // Tear down the other watch while its event may be pending.
                s.borrow_mut().take();
            })
            .unwrap();
        let fired = second_fired.clone();
        let source = event_loop
            .add_fd(rx2, Readiness::READABLE, move |_| fired.set(true))
            .unwrap();
        *second.borrow_mut() = Some(source);

        nix::unistd::write(tx1, b"x").unwrap();
        nix::unistd::write(tx2, b"x").unwrap();
        event_loop.dispatch(Some(Duration::from_millis(100))).unwrap();

        // Either the first callback ran first and nulled the second's slot, or
        // the second ran before the first; in the former case it must not have
        // fired at all.
        if second.borrow().is_none() && !second_fired.get() {
            event_loop.dispatch(Some(Duration::ZERO)).unwrap();
            assert!(!second_fired.get());
        }

        for fd in [rx1, tx1, rx2, tx2] {
            let _ = nix::unistd::close(fd);
        }
    }

    #[test]
    fn self_removal_from_callback() {
        let event_loop = EventLoop::new().unwrap();
        let (rx, tx) = pipe();

        let slot: Rc<RefCell<Option<FdSource>>> = Rc::new(RefCell::new(None));
        let count = Rc::new(Cell::new(0u32));

        let s = slot.clone();
        let c = count.clone();
        let source = event_loop
            .add_fd(rx, Readiness::READABLE, move |_| {
                c.set(c.get() + 1);
                s.borrow_mut().take();
            })
            .unwrap();
        *slot.borrow_mut() = Some(source);

        nix::unistd::write(tx, b"x").unwrap();
        event_loop.dispatch(Some(Duration::from_millis(100))).unwrap();
        event_loop.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(count.get(), 1);

        let _ = nix::unistd::close(rx);
        let _ = nix::unistd::close(tx);
    }

    #[test]
    fn nested_loop_dispatch() {
        let parent = EventLoop::new().unwrap();
        let child = EventLoop::new().unwrap();
        let (rx, tx) = pipe();

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let _child_source = child
            .add_fd(rx, Readiness::READABLE, move |_| f.set(true))
            .unwrap();
        let _nested = parent.add_nested(&child).unwrap();

        nix::unistd::write(tx, b"x").unwrap();
        parent.dispatch(Some(Duration::from_millis(100))).unwrap();
        assert!(fired.get());

        let _ = nix::unistd::close(rx);
        let _ = nix::unistd::close(tx);
    }

    #[test]
    fn nesting_self_fails() {
        let event_loop = EventLoop::new().unwrap();
        assert!(matches!(
            event_loop.add_nested(&event_loop),
            Err(Error::SelfNesting)
        ));
    }

    #[test]
    fn duplicate_fd_registration_fails() {
        let event_loop = EventLoop::new().unwrap();
        let (rx, tx) = pipe();

        let _first = event_loop.add_fd(rx, Readiness::READABLE, |_| {}).unwrap();
        assert!(matches!(
            event_loop.add_fd(rx, Readiness::READABLE, |_| {}),
            Err(Error::AlreadyRegistered)
        ));

        let _ = nix::unistd::close(rx);
        let _ = nix::unistd::close(tx);
    }

    #[test]
    fn run_honours_exit() {
        let event_loop = EventLoop::new().unwrap();
        let inner = event_loop.clone();
        let _idle = event_loop.add_idle(move || inner.exit());
        event_loop.run(Some(Duration::from_secs(5))).unwrap();
    }
}
