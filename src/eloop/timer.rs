//! Monotonic timer sources backed by timerfd.

use std::{
    cell::RefCell,
    fmt,
    os::unix::io::AsRawFd,
    rc::Rc,
    time::Duration,
};

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::read;
use tracing::warn;

use super::{Error, FdSource, LoopInner, Readiness};

/// Arming specification of a timer.
///
/// `initial` is the delay until the first expiration, `interval` the period of
/// every following one. A zero `initial` with a non-zero `interval` starts the
/// period immediately; an all-zero spec disarms the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerSpec {
    /// Delay until the first expiration
    pub initial: Duration,
    /// Period between subsequent expirations; zero for a one-shot timer
    pub interval: Duration,
}

impl TimerSpec {
    /// A timer that fires once after `initial`.
    pub fn oneshot(initial: Duration) -> TimerSpec {
        TimerSpec {
            initial,
            interval: Duration::ZERO,
        }
    }

    /// A timer that fires after `initial` and then every `interval`.
    pub fn repeating(initial: Duration, interval: Duration) -> TimerSpec {
        TimerSpec { initial, interval }
    }

    /// The all-zero spec; updating a timer with it disarms the timer.
    pub fn disarmed() -> TimerSpec {
        TimerSpec::default()
    }
}

struct TimerInner {
    fd: TimerFd,
    cb: RefCell<Box<dyn FnMut(u64)>>,
}

impl TimerInner {
    fn tick(&self) {
        let mut buf = [0u8; 8];
        match read(self.fd.as_raw_fd(), &mut buf) {
            Ok(8) => {
                let expirations = u64::from_ne_bytes(buf);
                (self.cb.borrow_mut())(expirations);
            }
            Ok(n) => warn!("Short read of {} bytes from a timer fd", n),
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(err) => warn!("Reading from a timer fd failed: {}", err),
        }
    }
}

/// A registered timer.
///
/// Dropping the handle disarms and removes the timer.
pub struct TimerSource {
    // Declared first so the watch is deregistered before the fd closes.
    _source: FdSource,
    inner: Rc<TimerInner>,
}

impl fmt::Debug for TimerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSource")
            .field("fd", &self.inner.fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl TimerSource {
    /// Re-arm (or disarm, for an all-zero spec) the timer.
    pub fn update(&self, spec: TimerSpec) -> Result<(), Error> {
        program(&self.inner.fd, spec)
    }
}

pub(super) fn add_timer<F>(owner: &Rc<LoopInner>, spec: TimerSpec, cb: F) -> Result<TimerSource, Error>
where
    F: FnMut(u64) + 'static,
{
    let fd = TimerFd::new(
        ClockId::CLOCK_MONOTONIC,
        TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
    )
    .map_err(Error::CreateTimer)?;
    program(&fd, spec)?;

    let inner = Rc::new(TimerInner {
        fd,
        cb: RefCell::new(Box::new(cb)),
    });
    let weak = Rc::downgrade(&inner);
    let source = LoopInner::add_fd(owner, inner.fd.as_raw_fd(), Readiness::READABLE, move |ready| {
        if ready.intersects(Readiness::HUP | Readiness::ERR) {
            warn!("Timer fd reported {:?}", ready);
            return;
        }
        if let Some(inner) = weak.upgrade() {
            inner.tick();
        }
    })?;
    Ok(TimerSource {
        _source: source,
        inner,
    })
}

fn program(fd: &TimerFd, spec: TimerSpec) -> Result<(), Error> {
    if spec.initial.is_zero() && spec.interval.is_zero() {
        return fd.unset().map_err(Error::SetTimer);
    }
    let initial = if spec.initial.is_zero() {
        spec.interval
    } else {
        spec.initial
    };
    let expiration = if spec.interval.is_zero() {
        Expiration::OneShot(TimeSpec::from_duration(initial))
    } else {
        Expiration::IntervalDelayed(
            TimeSpec::from_duration(initial),
            TimeSpec::from_duration(spec.interval),
        )
    };
    fd.set(expiration, TimerSetTimeFlags::empty())
        .map_err(Error::SetTimer)
}

#[cfg(test)]
mod tests {
    use super::super::EventLoop;
    use super::*;

    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn oneshot_fires_once() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0u64));

        let f = fired.clone();
        let _timer = event_loop
            .add_timer(TimerSpec::oneshot(Duration::from_millis(10)), move |n| {
                f.set(f.get() + n)
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.get() == 0 && Instant::now() < deadline {
            event_loop.dispatch(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(fired.get(), 1);

        event_loop.dispatch(Some(Duration::from_millis(30))).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn update_to_zero_disarms() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let timer = event_loop
            .add_timer(
                TimerSpec::repeating(Duration::from_millis(20), Duration::from_millis(20)),
                move |_| f.set(true),
            )
            .unwrap();
        timer.update(TimerSpec::disarmed()).unwrap();

        event_loop.dispatch(Some(Duration::from_millis(60))).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn repeating_reports_expirations() {
        let event_loop = EventLoop::new().unwrap();
        let total = Rc::new(Cell::new(0u64));

        let t = total.clone();
        let _timer = event_loop
            .add_timer(
                TimerSpec::repeating(Duration::from_millis(5), Duration::from_millis(5)),
                move |n| t.set(t.get() + n),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        event_loop.dispatch(Some(Duration::from_millis(20))).unwrap();
        assert!(total.get() >= 2, "expected accumulated expirations, got {}", total.get());
    }
}
