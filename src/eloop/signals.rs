//! Signal sources backed by a shared signalfd.
//!
//! One signalfd exists per subscribed signal number per loop; all
//! subscriptions for that number share it. Subscribing blocks the signal
//! process-wide and it stays blocked for the remaining lifetime of the
//! process: other subsystems may have taken their own subscriptions, so
//! reference-counted unmasking would pull the fd out from under them.

use std::{
    cell::RefCell,
    fmt,
    os::unix::io::AsRawFd,
    rc::{Rc, Weak},
};

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{siginfo, SfdFlags, SignalFd};
use tracing::{debug, warn};

use super::{Error, FdSource, LoopInner, Readiness};

type SignalCallback = RefCell<dyn FnMut(&siginfo)>;

/// A subscription to one POSIX signal.
///
/// Dropping the handle removes the subscription; when the last subscription
/// for a signal number goes away, the shared signalfd is closed as well (the
/// signal itself stays blocked).
pub struct SignalSource {
    cb: Rc<SignalCallback>,
    signal: Signal,
    owner: Weak<LoopInner>,
}

impl fmt::Debug for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSource")
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let mut signals = owner.signals.borrow_mut();
        let Some(mux) = signals.get(&(self.signal as i32)) else {
            return;
        };
        let me = Rc::downgrade(&self.cb);
        mux.subscribers
            .borrow_mut()
            .retain(|w| !Weak::ptr_eq(w, &me) && w.strong_count() > 0);
        if mux.subscribers.borrow().is_empty() {
            debug!("Last subscriber for {} gone, closing signal fd", self.signal);
            signals.remove(&(self.signal as i32));
        }
    }
}

pub(crate) struct SignalMux {
    // Declared first so the watch is deregistered before the fd closes.
    _source: RefCell<Option<FdSource>>,
    signal: Signal,
    fd: RefCell<SignalFd>,
    pub(super) subscribers: RefCell<Vec<Weak<SignalCallback>>>,
}

impl SignalMux {
    fn drain(&self) {
        loop {
            let info = match self.fd.borrow_mut().read_signal() {
                Ok(Some(info)) => info,
                Ok(None) => break,
                Err(err) => {
                    warn!("Reading from the {} signal fd failed: {}", self.signal, err);
                    break;
                }
            };
            let subscribers: Vec<_> = self.subscribers.borrow().clone();
            for weak in subscribers {
                if let Some(cb) = weak.upgrade() {
                    (cb.borrow_mut())(&info);
                }
            }
        }
    }
}

pub(super) fn add_signal<F>(
    owner: &Rc<LoopInner>,
    signal: Signal,
    cb: F,
) -> Result<SignalSource, Error>
where
    F: FnMut(&siginfo) + 'static,
{
    let mux = signal_mux(owner, signal)?;
    let rc = Rc::new(RefCell::new(cb));
    let weak = Rc::downgrade(&rc) as Weak<SignalCallback>;
    mux.subscribers.borrow_mut().push(weak);
    Ok(SignalSource {
        cb: rc,
        signal,
        owner: Rc::downgrade(owner),
    })
}

fn signal_mux(owner: &Rc<LoopInner>, signal: Signal) -> Result<Rc<SignalMux>, Error> {
    if let Some(mux) = owner.signals.borrow().get(&(signal as i32)) {
        return Ok(mux.clone());
    }

    let mut mask = SigSet::empty();
    mask.add(signal);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(Error::SignalMask)?;
    let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(|source| Error::CreateSignalFd { signal, source })?;
    debug!("Blocked {} and routed it through a signal fd", signal);

    let mux = Rc::new(SignalMux {
        _source: RefCell::new(None),
        signal,
        fd: RefCell::new(fd),
        subscribers: RefCell::new(Vec::new()),
    });
    let weak = Rc::downgrade(&mux);
    let raw = mux.fd.borrow().as_raw_fd();
    let source = LoopInner::add_fd(owner, raw, Readiness::READABLE, move |ready| {
        if ready.intersects(Readiness::HUP | Readiness::ERR) {
            warn!("Signal fd reported {:?}", ready);
            return;
        }
        if let Some(mux) = weak.upgrade() {
            mux.drain();
        }
    })?;
    *mux._source.borrow_mut() = Some(source);
    owner.signals.borrow_mut().insert(signal as i32, mux.clone());
    Ok(mux)
}

#[cfg(test)]
mod tests {
    use super::super::EventLoop;
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn delivery_in_registration_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _first = event_loop
            .add_signal(Signal::SIGUSR1, move |info| {
                assert_eq!(info.ssi_signo, Signal::SIGUSR1 as u32);
                o.borrow_mut().push(1);
            })
            .unwrap();
        let o = order.clone();
        let _second = event_loop
            .add_signal(Signal::SIGUSR1, move |_| o.borrow_mut().push(2))
            .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        event_loop.dispatch(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscription_is_skipped() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(0u32));

        let h = hits.clone();
        let source = event_loop
            .add_signal(Signal::SIGUSR2, move |_| *h.borrow_mut() += 1)
            .unwrap();
        drop(source);

        let h = hits.clone();
        let _live = event_loop
            .add_signal(Signal::SIGUSR2, move |_| *h.borrow_mut() += 10)
            .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        event_loop.dispatch(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(*hits.borrow(), 10);
    }
}
