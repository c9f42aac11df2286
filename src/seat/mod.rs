//!
//! Seat and session scheduling.
//!
//! A [`Seat`] bundles the input devices, the displays and the VT of one
//! workstation and multiplexes an ordered list of [`Session`]s onto it. At
//! most one session is *current*; it receives the activate/deactivate pair
//! whenever the seat wakes up or goes to sleep with its VT.
//!
//! An optional *dummy* session backs the seat whenever no regular session is
//! enabled, so the seat never ends up without a consumer while awake. The
//! rotation hotkeys skip it.
//!
//! ## Hotkey grabs
//!
//! Four configurable grabs are consumed ahead of the sessions:
//! session-next, session-prev, session-close and terminal-new. A grab matches
//! when the event's modifier mask equals the grab's mask exactly and any grab
//! keysym equals any event keysym. The terminal-new grab defers to a
//! caller-installed terminal factory, see [`Seat::set_terminal_factory`].

use std::{
    cell::{Cell, RefCell},
    fmt,
    path::PathBuf,
    rc::{Rc, Weak},
};

use tracing::{debug, info, warn};

use crate::eloop::EventLoop;
use crate::input::keyboard::keysyms;
use crate::input::{InputEvent, InputManager, Keysym, Modifiers, XkbConfig};
use crate::vt::{Switch, Vt, VtAction, VtEvent, VtMaster, VtResponse, VtTypes};

/// Errors related to the seat scheduler
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The per-seat session cap is reached
    #[error("The session cap of this seat is reached")]
    CapExceeded,
    /// The session is not enabled and cannot become current
    #[error("The session is not enabled")]
    NotEnabled,
    /// The session does not (or no longer) belong to this seat
    #[error("The session is not registered with this seat")]
    NotRegistered,
    /// A dummy session is already installed
    #[error("This seat already has a dummy session")]
    DummyExists,
    /// The VT layer failed
    #[error(transparent)]
    Vt(#[from] crate::vt::Error),
    /// The input layer failed
    #[error(transparent)]
    Input(#[from] crate::input::Error),
}

/// Seat-level event delivered to the owner callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatEvent {
    /// The seat acquired its VT; sessions will run now
    WakeUp,
    /// The seat released its VT
    Sleep,
    /// The seat's VT is gone; the seat is unusable
    Hup,
}

/// Event delivered to a session callback.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session became current on an awake seat
    Activate,
    /// The session stopped being current (or the seat went to sleep)
    Deactivate,
    /// A display was added to the seat
    DisplayNew(Display),
    /// A display disappeared from the seat
    DisplayGone(Display),
    /// The session was removed from its seat; its seat reference is gone
    /// after this callback returns
    Unregister,
}

/// A configured hotkey grab.
#[derive(Debug, Clone)]
pub struct KeyGrab {
    /// Modifier mask that must match the event exactly
    pub mods: Modifiers,
    /// Keysyms of which any may match any event keysym
    pub keysyms: Vec<Keysym>,
}

impl KeyGrab {
    /// A grab for `mods` plus one or more keysyms.
    pub fn new(mods: Modifiers, syms: impl Into<Vec<Keysym>>) -> KeyGrab {
        KeyGrab {
            mods,
            keysyms: syms.into(),
        }
    }

    /// Whether the event matches this grab.
    pub fn matches(&self, event: &InputEvent) -> bool {
        event.mods == self.mods
            && self
                .keysyms
                .iter()
                .any(|grab| event.keysyms.iter().any(|sym| sym == grab))
    }
}

/// Seat configuration.
///
/// `session_max == 0` lifts the session cap. The grab defaults follow the
/// usual console-daemon bindings on the logo key.
#[derive(Debug, Clone)]
pub struct SeatConfig {
    /// Keymap configuration handed to the input aggregator
    pub xkb: XkbConfig,
    /// Auto-repeat delay in milliseconds
    pub repeat_delay_ms: u32,
    /// Auto-repeat period in milliseconds
    pub repeat_rate_ms: u32,
    /// Maximum number of registered sessions, `0` for unlimited
    pub session_max: usize,
    /// VT backends the seat may use
    pub vt_types: VtTypes,
    /// Override tty discovery for the real VT backend
    pub tty_path: Option<PathBuf>,
    /// Switch to the next session
    pub grab_session_next: Option<KeyGrab>,
    /// Switch to the previous session
    pub grab_session_prev: Option<KeyGrab>,
    /// Close the current session
    pub grab_session_close: Option<KeyGrab>,
    /// Ask the terminal factory for a new session
    pub grab_terminal_new: Option<KeyGrab>,
}

impl Default for SeatConfig {
    fn default() -> SeatConfig {
        SeatConfig {
            xkb: XkbConfig::default(),
            repeat_delay_ms: 250,
            repeat_rate_ms: 50,
            session_max: 50,
            vt_types: VtTypes::all(),
            tty_path: None,
            grab_session_next: Some(KeyGrab::new(
                Modifiers::LOGO,
                vec![Keysym::new(keysyms::KEY_Right)],
            )),
            grab_session_prev: Some(KeyGrab::new(
                Modifiers::LOGO,
                vec![Keysym::new(keysyms::KEY_Left)],
            )),
            grab_session_close: Some(KeyGrab::new(
                Modifiers::LOGO,
                vec![Keysym::new(keysyms::KEY_BackSpace)],
            )),
            grab_terminal_new: Some(KeyGrab::new(
                Modifiers::LOGO,
                vec![Keysym::new(keysyms::KEY_Return)],
            )),
        }
    }
}

type SeatCallback = Box<dyn FnMut(&SeatEvent)>;
type SessionCallback = Box<dyn FnMut(&SessionEvent)>;
type TerminalFactory = Box<dyn FnMut(&Seat) -> Result<Session, Error>>;

struct SessionInner {
    seat: RefCell<Option<Weak<SeatInner>>>,
    enabled: Cell<bool>,
    dummy: bool,
    cb: Rc<RefCell<SessionCallback>>,
}

impl SessionInner {
    fn call(&self, event: &SessionEvent) {
        // Clone the callback out so the session list stays borrowable while
        // client code runs.
        let cb = self.cb.clone();
        (cb.borrow_mut())(event);
    }
}

/// Handle to a registered session.
///
/// This is a handle to the inner state, it can be cloned. Equality is
/// identity of the underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("enabled", &self.inner.enabled.get())
            .field("dummy", &self.inner.dummy)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Whether the session may become current.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    /// Whether this is the seat's dummy session.
    pub fn is_dummy(&self) -> bool {
        self.inner.dummy
    }
}

struct DisplayInner {
    name: String,
    activated: Cell<bool>,
}

/// Handle to a display record on a seat.
///
/// The display carries an opaque name identifying the video output it stands
/// for; driving the output itself is out of scope here.
#[derive(Clone)]
pub struct Display {
    inner: Rc<DisplayInner>,
}

impl PartialEq for Display {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Display {}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display")
            .field("name", &self.inner.name)
            .field("activated", &self.inner.activated.get())
            .finish()
    }
}

impl Display {
    /// Create a display record for the named output.
    pub fn new(name: impl Into<String>) -> Display {
        Display {
            inner: Rc::new(DisplayInner {
                name: name.into(),
                activated: Cell::new(false),
            }),
        }
    }

    /// The output name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the seat has activated this display.
    pub fn is_activated(&self) -> bool {
        self.inner.activated.get()
    }
}

struct SeatInner {
    name: String,
    input: InputManager,
    vt: RefCell<Option<Vt>>,
    config: SeatConfig,
    sessions: RefCell<Vec<Rc<SessionInner>>>,
    current: RefCell<Option<Rc<SessionInner>>>,
    displays: RefCell<Vec<Rc<DisplayInner>>>,
    awake: Cell<bool>,
    cb: RefCell<SeatCallback>,
    factory: RefCell<Option<TerminalFactory>>,
    // Keeps the grab filter registered for the lifetime of the seat.
    hook: RefCell<Option<crate::input::HookToken>>,
}

/// Handle to a seat.
///
/// This is a handle to the inner state, it can be cloned.
#[derive(Clone)]
pub struct Seat {
    inner: Rc<SeatInner>,
}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat")
            .field("name", &self.inner.name)
            .field("awake", &self.inner.awake.get())
            .field("sessions", &self.inner.sessions.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Seat {
    /// Create a seat: build its input aggregator, allocate its VT and install
    /// the hotkey grabs.
    ///
    /// A seat without a usable VT is not viable, so VT allocation failure
    /// unwinds seat creation.
    pub fn new<F>(
        eloop: &EventLoop,
        master: &VtMaster,
        name: &str,
        config: SeatConfig,
        cb: F,
    ) -> Result<Seat, Error>
    where
        F: FnMut(&SeatEvent) + 'static,
    {
        info!("Creating seat {}", name);
        let input = InputManager::new(
            eloop,
            &config.xkb,
            config.repeat_delay_ms,
            config.repeat_rate_ms,
        )?;

        let inner = Rc::new(SeatInner {
            name: name.to_owned(),
            input: input.clone(),
            vt: RefCell::new(None),
            config,
            sessions: RefCell::new(Vec::new()),
            current: RefCell::new(None),
            displays: RefCell::new(Vec::new()),
            awake: Cell::new(false),
            cb: RefCell::new(Box::new(cb)),
            factory: RefCell::new(None),
            hook: RefCell::new(None),
        });

        // The VT installs its own input filter first; the grab filter below
        // therefore sees VT hotkeys as already handled.
        let weak = Rc::downgrade(&inner);
        let vt = Vt::allocate(
            master,
            inner.config.vt_types,
            name,
            &input,
            inner.config.tty_path.as_deref(),
            move |event| match weak.upgrade() {
                Some(inner) => Seat { inner }.handle_vt_event(event),
                None => VtResponse::Accept,
            },
        )?;
        *inner.vt.borrow_mut() = Some(vt);

        let weak = Rc::downgrade(&inner);
        let hook = input.register_hook(move |event| {
            if let Some(inner) = weak.upgrade() {
                Seat { inner }.filter_grabs(event);
            }
        });
        *inner.hook.borrow_mut() = Some(hook);

        Ok(Seat { inner })
    }

    /// The seat name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The seat's input aggregator.
    pub fn input(&self) -> &InputManager {
        &self.inner.input
    }

    /// Whether the seat currently owns its VT.
    pub fn is_awake(&self) -> bool {
        self.inner.awake.get()
    }

    /// Number of registered sessions, including the dummy.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    /// The current session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.inner
            .current
            .borrow()
            .clone()
            .map(|inner| Session { inner })
    }

    /// Install the collaborator that creates terminal sessions for the
    /// terminal-new grab.
    pub fn set_terminal_factory<F>(&self, factory: F)
    where
        F: FnMut(&Seat) -> Result<Session, Error> + 'static,
    {
        *self.inner.factory.borrow_mut() = Some(Box::new(factory));
    }

    /// Append a session to the seat.
    ///
    /// The session starts disabled; enable it to make it eligible for
    /// activation. Already-activated displays are announced to the new
    /// session right away.
    pub fn register_session<F>(&self, cb: F) -> Result<Session, Error>
    where
        F: FnMut(&SessionEvent) + 'static,
    {
        self.register(cb, false)
    }

    /// Install the always-eligible fallback session.
    pub fn register_dummy_session<F>(&self, cb: F) -> Result<Session, Error>
    where
        F: FnMut(&SessionEvent) + 'static,
    {
        if self.inner.sessions.borrow().iter().any(|s| s.dummy) {
            return Err(Error::DummyExists);
        }
        self.register(cb, true)
    }

    fn register<F>(&self, cb: F, dummy: bool) -> Result<Session, Error>
    where
        F: FnMut(&SessionEvent) + 'static,
    {
        let max = self.inner.config.session_max;
        if !dummy && max > 0 && self.inner.sessions.borrow().len() >= max {
            warn!("Session cap ({}) reached on seat {}", max, self.inner.name);
            return Err(Error::CapExceeded);
        }

        let session = Rc::new(SessionInner {
            seat: RefCell::new(Some(Rc::downgrade(&self.inner))),
            enabled: Cell::new(dummy),
            dummy,
            cb: Rc::new(RefCell::new(Box::new(cb))),
        });
        self.inner.sessions.borrow_mut().push(session.clone());
        debug!(
            "Registered {} session on seat {}",
            if dummy { "dummy" } else { "regular" },
            self.inner.name
        );

        // Catch the new session up on the activated displays.
        let displays: Vec<_> = self.inner.displays.borrow().clone();
        for display in displays.into_iter().filter(|d| d.activated.get()) {
            session.call(&SessionEvent::DisplayNew(Display { inner: display }));
        }

        // The dummy backs the seat immediately when nothing else runs.
        if dummy && self.inner.current.borrow().is_none() {
            *self.inner.current.borrow_mut() = Some(session.clone());
            if self.inner.awake.get() {
                session.call(&SessionEvent::Activate);
            }
        }
        Ok(Session { inner: session })
    }

    /// Remove a session from the seat.
    ///
    /// A current session is deactivated and the scheduler picks the next
    /// one. The session receives a final `Unregister` event, after which its
    /// seat reference is dead.
    pub fn unregister_session(&self, session: &Session) {
        if !self.owns(&session.inner) {
            return;
        }
        let inner = &session.inner;
        if self.is_current(inner) {
            if self.inner.awake.get() {
                inner.call(&SessionEvent::Deactivate);
            }
            *self.inner.current.borrow_mut() = None;
            self.pick_next(Some(inner));
        }
        self.inner
            .sessions
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(s, inner));
        debug!("Unregistered session from seat {}", self.inner.name);
        inner.call(&SessionEvent::Unregister);
        *inner.seat.borrow_mut() = None;
    }

    /// Make a session eligible for activation.
    ///
    /// When the seat is idling on the dummy, the newly enabled session takes
    /// over immediately.
    pub fn enable_session(&self, session: &Session) {
        if !self.owns(&session.inner) || session.inner.enabled.replace(true) {
            return;
        }
        let covering_dummy = self
            .inner
            .current
            .borrow()
            .as_ref()
            .map(|c| c.dummy)
            .unwrap_or(true);
        if covering_dummy {
            let _ = self.activate_session(session);
        }
    }

    /// Make a session ineligible; a current session is deactivated first.
    pub fn disable_session(&self, session: &Session) {
        if !self.owns(&session.inner) || !session.inner.enabled.replace(false) {
            return;
        }
        if self.is_current(&session.inner) {
            self.deactivate_session(session);
        }
    }

    /// Make `session` the current session of the seat.
    ///
    /// Fails with [`Error::NotEnabled`] for disabled sessions. On an awake
    /// seat the old current receives `Deactivate` before the new one
    /// receives `Activate`.
    pub fn activate_session(&self, session: &Session) -> Result<(), Error> {
        let inner = &session.inner;
        if !self.owns(inner) {
            return Err(Error::NotRegistered);
        }
        if self.is_current(inner) {
            return Ok(());
        }
        if !inner.enabled.get() && !inner.dummy {
            return Err(Error::NotEnabled);
        }

        let old = self.inner.current.borrow().clone();
        if self.inner.awake.get() {
            if let Some(old) = &old {
                old.call(&SessionEvent::Deactivate);
            }
        }
        *self.inner.current.borrow_mut() = Some(inner.clone());
        if self.inner.awake.get() {
            inner.call(&SessionEvent::Activate);
        }
        Ok(())
    }

    /// Deactivate the current session and schedule the next one.
    ///
    /// Ignored when `session` is not current.
    pub fn deactivate_session(&self, session: &Session) {
        let inner = &session.inner;
        if !self.owns(inner) || !self.is_current(inner) {
            return;
        }
        if self.inner.awake.get() {
            inner.call(&SessionEvent::Deactivate);
        }
        *self.inner.current.borrow_mut() = None;
        self.pick_next(Some(inner));
    }

    /// Link a display record into the seat.
    ///
    /// The display activates immediately on an awake seat (announcing
    /// `display-new` to every session once); on a sleeping seat the
    /// activation is pending until the next wake-up.
    pub fn add_display(&self, disp: &Display) {
        debug!("Adding display {} to seat {}", disp.name(), self.inner.name);
        self.inner.displays.borrow_mut().push(disp.inner.clone());
        if self.inner.awake.get() && !disp.inner.activated.replace(true) {
            self.broadcast(&SessionEvent::DisplayNew(disp.clone()));
        }
    }

    /// Unlink a display record.
    ///
    /// Sessions see `display-gone` only when the display had been activated.
    pub fn remove_display(&self, disp: &Display) {
        if disp.inner.activated.replace(false) {
            self.broadcast(&SessionEvent::DisplayGone(disp.clone()));
        }
        self.inner
            .displays
            .borrow_mut()
            .retain(|d| !Rc::ptr_eq(d, &disp.inner));
        debug!(
            "Removed display {} from seat {}",
            disp.name(),
            self.inner.name
        );
    }

    /// Ask the VT layer to release the seat (switch back to the saved VT).
    pub fn release_control(&self) -> Result<Switch, Error> {
        let vt = self.inner.vt.borrow().clone();
        match vt {
            Some(vt) => Ok(vt.deactivate()?),
            None => Ok(Switch::Complete),
        }
    }

    /// Tear the seat down: unregister every session and deallocate the VT.
    pub fn destroy(&self) {
        info!("Destroying seat {}", self.inner.name);
        loop {
            let session = self.inner.sessions.borrow().last().cloned();
            match session {
                Some(inner) => self.unregister_session(&Session { inner }),
                None => break,
            }
        }
        self.inner.hook.borrow_mut().take();
        let vt = self.inner.vt.borrow_mut().take();
        if let Some(vt) = vt {
            vt.deallocate();
        }
    }

    fn owns(&self, session: &Rc<SessionInner>) -> bool {
        session
            .seat
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|seat| Rc::ptr_eq(&seat, &self.inner))
            .unwrap_or(false)
    }

    fn is_current(&self, session: &Rc<SessionInner>) -> bool {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|c| Rc::ptr_eq(c, session))
            .unwrap_or(false)
    }

    fn broadcast(&self, event: &SessionEvent) {
        let sessions: Vec<_> = self.inner.sessions.borrow().clone();
        for session in sessions {
            // A callback earlier in the fan-out may have unregistered this one.
            if session.seat.borrow().is_some() {
                session.call(event);
            }
        }
    }

    /// Choose the session that follows `after` in the list: the first enabled
    /// non-dummy session walking forward (wrapping once), falling back to the
    /// dummy.
    fn pick_next(&self, after: Option<&Rc<SessionInner>>) {
        let sessions: Vec<_> = self.inner.sessions.borrow().clone();
        let len = sessions.len();
        if len == 0 {
            return;
        }
        let start = after
            .and_then(|a| sessions.iter().position(|s| Rc::ptr_eq(s, a)))
            .map(|idx| idx + 1)
            .unwrap_or(0);

        let mut next = None;
        for offset in 0..len {
            let candidate = &sessions[(start + offset) % len];
            if let Some(after) = after {
                if Rc::ptr_eq(candidate, after) {
                    continue;
                }
            }
            if candidate.dummy || !candidate.enabled.get() {
                continue;
            }
            next = Some(candidate.clone());
            break;
        }
        if next.is_none() {
            next = sessions.iter().find(|s| s.dummy).cloned();
        }

        *self.inner.current.borrow_mut() = next.clone();
        if let Some(next) = next {
            if self.inner.awake.get() {
                next.call(&SessionEvent::Activate);
            }
        }
    }

    /// Walk the session list relative to the current session, skipping the
    /// dummy and disabled entries, and activate the first match.
    fn rotate(&self, forward: bool) {
        let sessions: Vec<_> = self.inner.sessions.borrow().clone();
        let len = sessions.len();
        if len == 0 {
            return;
        }
        let current = self.inner.current.borrow().clone();
        let base = current
            .as_ref()
            .and_then(|c| sessions.iter().position(|s| Rc::ptr_eq(s, c)))
            .unwrap_or(0);

        for step in 1..=len {
            let idx = if forward {
                (base + step) % len
            } else {
                (base + len - (step % len)) % len
            };
            let candidate = &sessions[idx];
            if candidate.dummy || !candidate.enabled.get() {
                continue;
            }
            if let Some(current) = &current {
                if Rc::ptr_eq(candidate, current) {
                    break;
                }
            }
            let _ = self.activate_session(&Session {
                inner: candidate.clone(),
            });
            return;
        }
    }

    fn spawn_terminal(&self) {
        // Take the factory out for the duration of the call so it may use the
        // seat freely.
        let factory = self.inner.factory.borrow_mut().take();
        let Some(mut factory) = factory else {
            debug!("terminal-new grabbed but no terminal factory is installed");
            return;
        };
        match factory(self) {
            Ok(session) => {
                session.inner.enabled.set(true);
                if let Err(err) = self.activate_session(&session) {
                    warn!("Activating a new terminal session failed: {}", err);
                }
            }
            Err(err) => warn!("The terminal factory failed: {}", err),
        }
        let mut slot = self.inner.factory.borrow_mut();
        if slot.is_none() {
            *slot = Some(factory);
        }
    }

    fn filter_grabs(&self, event: &mut InputEvent) {
        if event.handled || !self.inner.awake.get() {
            return;
        }
        let config = &self.inner.config;
        if config
            .grab_session_next
            .as_ref()
            .map(|g| g.matches(event))
            .unwrap_or(false)
        {
            event.handled = true;
            self.rotate(true);
        } else if config
            .grab_session_prev
            .as_ref()
            .map(|g| g.matches(event))
            .unwrap_or(false)
        {
            event.handled = true;
            self.rotate(false);
        } else if config
            .grab_session_close
            .as_ref()
            .map(|g| g.matches(event))
            .unwrap_or(false)
        {
            event.handled = true;
            let current = self.current_session();
            if let Some(current) = current {
                if !current.is_dummy() {
                    self.unregister_session(&current);
                }
            }
        } else if config
            .grab_terminal_new
            .as_ref()
            .map(|g| g.matches(event))
            .unwrap_or(false)
        {
            event.handled = true;
            self.spawn_terminal();
        }
    }

    fn handle_vt_event(&self, event: &VtEvent) -> VtResponse {
        match event.action {
            VtAction::Activate => self.wake_up(),
            VtAction::Deactivate => self.sleep(),
            VtAction::Hup => {
                warn!("Seat {} lost its VT", self.inner.name);
                (self.inner.cb.borrow_mut())(&SeatEvent::Hup);
            }
        }
        VtResponse::Accept
    }

    fn wake_up(&self) {
        if self.inner.awake.replace(true) {
            return;
        }
        debug!("Waking up seat {}", self.inner.name);
        (self.inner.cb.borrow_mut())(&SeatEvent::WakeUp);
        self.inner.input.wake_up();

        // Displays added while asleep activate now, exactly once each.
        let displays: Vec<_> = self.inner.displays.borrow().clone();
        for display in displays {
            if !display.activated.replace(true) {
                self.broadcast(&SessionEvent::DisplayNew(Display { inner: display }));
            }
        }

        let current = self.inner.current.borrow().clone();
        match current {
            Some(current) => current.call(&SessionEvent::Activate),
            None => self.pick_next(None),
        }
    }

    fn sleep(&self) {
        if !self.inner.awake.get() {
            return;
        }
        debug!("Seat {} going to sleep", self.inner.name);
        let current = self.inner.current.borrow().clone();
        if let Some(current) = current {
            current.call(&SessionEvent::Deactivate);
        }
        self.inner.input.sleep();
        (self.inner.cb.borrow_mut())(&SeatEvent::Sleep);
        self.inner.awake.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::CODEPOINT_INVALID;
    use smallvec::smallvec;

    type EventLog = Rc<RefCell<Vec<(&'static str, String)>>>;

    struct Fixture {
        _eloop: EventLoop,
        master: VtMaster,
        seat: Seat,
        log: EventLog,
    }

    fn fixture() -> Fixture {
        fixture_with(SeatConfig {
            vt_types: VtTypes::FAKE,
            ..Default::default()
        })
    }

    fn fixture_with(config: SeatConfig) -> Fixture {
        // Capture the crate's tracing output in the test log; filtered by
        // `RUST_LOG` as usual. Only the first caller installs the subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let eloop = EventLoop::new().unwrap();
        let master = VtMaster::new(&eloop).unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let seat = Seat::new(&eloop, &master, "testseat", config, move |event| {
            l.borrow_mut().push(("seat", format!("{:?}", event)));
        })
        .unwrap();
        Fixture {
            _eloop: eloop,
            master,
            seat,
            log,
        }
    }

    fn session(fixture: &Fixture, tag: &'static str) -> Session {
        let log = fixture.log.clone();
        let session = fixture
            .seat
            .register_session(move |event| {
                let what = match event {
                    SessionEvent::Activate => "activate".to_owned(),
                    SessionEvent::Deactivate => "deactivate".to_owned(),
                    SessionEvent::DisplayNew(d) => format!("display-new:{}", d.name()),
                    SessionEvent::DisplayGone(d) => format!("display-gone:{}", d.name()),
                    SessionEvent::Unregister => "unregister".to_owned(),
                };
                log.borrow_mut().push((tag, what));
            })
            .unwrap();
        fixture.seat.enable_session(&session);
        session
    }

    fn key_event(mods: Modifiers, sym: u32) -> InputEvent {
        InputEvent {
            handled: false,
            keycode: 0,
            ascii: 0,
            mods,
            keysyms: smallvec![Keysym::new(sym)],
            codepoints: smallvec![CODEPOINT_INVALID],
        }
    }

    fn wake(fixture: &Fixture) {
        fixture.master.activate_all().unwrap();
        assert!(fixture.seat.is_awake());
    }

    #[test]
    fn fake_vt_hotkey_toggles_seat() {
        let fixture = fixture();
        let session = session(&fixture, "s");
        assert!(!fixture.seat.is_awake());

        let mut event = key_event(Modifiers::LOGO | Modifiers::CONTROL, keysyms::KEY_F12);
        fixture.seat.input().feed(&mut event);
        assert!(event.handled);
        assert!(fixture.seat.is_awake());
        assert_eq!(fixture.seat.current_session(), Some(session));
        assert!(fixture
            .log
            .borrow()
            .contains(&("seat", "WakeUp".to_owned())));
        assert!(fixture.log.borrow().contains(&("s", "activate".to_owned())));

        let mut event = key_event(Modifiers::LOGO | Modifiers::CONTROL, keysyms::KEY_F12);
        fixture.seat.input().feed(&mut event);
        assert!(event.handled);
        assert!(!fixture.seat.is_awake());
        assert!(fixture
            .log
            .borrow()
            .contains(&("s", "deactivate".to_owned())));
        assert!(fixture.log.borrow().contains(&("seat", "Sleep".to_owned())));
    }

    #[test]
    fn session_rotation_skips_dummy() {
        let fixture = fixture();
        let _dummy = fixture.seat.register_dummy_session(|_| {}).unwrap();
        let a = session(&fixture, "a");
        let b = session(&fixture, "b");
        let c = session(&fixture, "c");
        wake(&fixture);

        fixture.seat.activate_session(&a).unwrap();
        assert_eq!(fixture.seat.current_session(), Some(a.clone()));

        let next = || {
            let mut event = key_event(Modifiers::LOGO, keysyms::KEY_Right);
            fixture.seat.input().feed(&mut event);
            assert!(event.handled);
        };
        next();
        assert_eq!(fixture.seat.current_session(), Some(b.clone()));
        next();
        assert_eq!(fixture.seat.current_session(), Some(c.clone()));
        next();
        assert_eq!(fixture.seat.current_session(), Some(a.clone()));

        let mut event = key_event(Modifiers::LOGO, keysyms::KEY_Left);
        fixture.seat.input().feed(&mut event);
        assert_eq!(fixture.seat.current_session(), Some(c));
    }

    #[test]
    fn dummy_covers_when_all_sessions_close() {
        let fixture = fixture();
        let dummy = fixture.seat.register_dummy_session(|_| {}).unwrap();
        let a = session(&fixture, "a");
        wake(&fixture);
        fixture.seat.activate_session(&a).unwrap();

        fixture.seat.unregister_session(&a);
        assert_eq!(fixture.seat.current_session(), Some(dummy));
        assert!(fixture.log.borrow().contains(&("a", "unregister".to_owned())));
    }

    #[test]
    fn close_grab_spares_the_dummy() {
        let fixture = fixture();
        let dummy = fixture.seat.register_dummy_session(|_| {}).unwrap();
        let a = session(&fixture, "a");
        wake(&fixture);
        fixture.seat.activate_session(&a).unwrap();

        let close = || {
            let mut event = key_event(Modifiers::LOGO, keysyms::KEY_BackSpace);
            fixture.seat.input().feed(&mut event);
        };
        close();
        assert_eq!(fixture.seat.current_session(), Some(dummy.clone()));
        assert_eq!(fixture.seat.session_count(), 1);

        // The dummy itself is never closed by the grab.
        close();
        assert_eq!(fixture.seat.current_session(), Some(dummy));
        assert_eq!(fixture.seat.session_count(), 1);
    }

    #[test]
    fn session_cap_is_enforced() {
        let fixture = fixture_with(SeatConfig {
            vt_types: VtTypes::FAKE,
            session_max: 2,
            ..Default::default()
        });
        let _a = fixture.seat.register_session(|_| {}).unwrap();
        let _b = fixture.seat.register_session(|_| {}).unwrap();
        assert!(matches!(
            fixture.seat.register_session(|_| {}),
            Err(Error::CapExceeded)
        ));
    }

    #[test]
    fn disabled_sessions_cannot_activate() {
        let fixture = fixture();
        let session = fixture.seat.register_session(|_| {}).unwrap();
        assert!(matches!(
            fixture.seat.activate_session(&session),
            Err(Error::NotEnabled)
        ));
    }

    #[test]
    fn enabling_replaces_the_dummy() {
        let fixture = fixture();
        let dummy = fixture.seat.register_dummy_session(|_| {}).unwrap();
        wake(&fixture);
        assert_eq!(fixture.seat.current_session(), Some(dummy));

        let session = fixture.seat.register_session(|_| {}).unwrap();
        fixture.seat.enable_session(&session);
        assert_eq!(fixture.seat.current_session(), Some(session));
    }

    #[test]
    fn displays_activate_on_wakeup_exactly_once() {
        let fixture = fixture();
        let _a = session(&fixture, "a");
        let display = Display::new("card0-0");
        fixture.seat.add_display(&display);
        assert!(!display.is_activated());
        assert!(!fixture
            .log
            .borrow()
            .iter()
            .any(|(_, what)| what.starts_with("display-new")));

        wake(&fixture);
        assert!(display.is_activated());
        let count = |log: &EventLog| {
            log.borrow()
                .iter()
                .filter(|(tag, what)| *tag == "a" && what == "display-new:card0-0")
                .count()
        };
        assert_eq!(count(&fixture.log), 1);

        // A session registered afterwards is caught up immediately.
        let _b = session(&fixture, "b");
        assert!(fixture
            .log
            .borrow()
            .contains(&("b", "display-new:card0-0".to_owned())));

        fixture.seat.remove_display(&display);
        assert!(!display.is_activated());
        assert!(fixture
            .log
            .borrow()
            .contains(&("a", "display-gone:card0-0".to_owned())));
    }

    #[test]
    fn terminal_factory_spawns_and_activates() {
        let fixture = fixture();
        let _dummy = fixture.seat.register_dummy_session(|_| {}).unwrap();
        wake(&fixture);

        let spawned: Rc<RefCell<Option<Session>>> = Rc::new(RefCell::new(None));
        let slot = spawned.clone();
        fixture.seat.set_terminal_factory(move |seat| {
            let session = seat.register_session(|_| {})?;
            *slot.borrow_mut() = Some(session.clone());
            Ok(session)
        });

        let mut event = key_event(Modifiers::LOGO, keysyms::KEY_Return);
        fixture.seat.input().feed(&mut event);
        assert!(event.handled);

        let spawned = spawned.borrow().clone().expect("factory ran");
        assert!(spawned.is_enabled());
        assert_eq!(fixture.seat.current_session(), Some(spawned));
    }

    #[test]
    fn destroy_unwinds_sessions_and_vt() {
        let fixture = fixture();
        let _a = session(&fixture, "a");
        let _b = session(&fixture, "b");
        wake(&fixture);

        fixture.seat.destroy();
        assert_eq!(fixture.seat.session_count(), 0);
        assert_eq!(fixture.master.vt_count(), 0);
        assert!(!fixture.seat.input().is_awake());
        assert!(fixture.log.borrow().contains(&("a", "unregister".to_owned())));
        assert!(fixture.log.borrow().contains(&("b", "unregister".to_owned())));
    }
}
