#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like VT
#![allow(clippy::upper_case_acronyms)]

//! # Seatmux: seat and session multiplexing for the Linux console
//!
//! This crate is the runtime core of a privileged per-machine console daemon.
//! It discovers nothing and draws nothing; what it provides is the
//! interlocking machinery between the kernel and the parts of such a daemon
//! that do: an event loop, a hot-plug keyboard pipeline, a virtual-terminal
//! abstraction and a seat/session scheduler.
//!
//! ## Structure of the crate
//!
//! - [`eloop`] is a single-threaded, epoll-based event loop with fd, signal,
//!   timer and idle sources. It is the sole scheduler: everything else in the
//!   crate (and in a daemon built on it) runs from its callbacks.
//! - [`input`] owns the evdev keyboard devices of one seat, translates their
//!   key events through a shared XKB keymap and fans the results out to an
//!   ordered hook list. Sleeping and waking the pipeline tracks VT ownership.
//! - [`vt`] multiplexes console access: a real backend cooperating with the
//!   kernel's legacy VT subsystem (asynchronous switches acknowledged via
//!   `SIGUSR1`/`SIGUSR2`) and a fake backend for seats without kernel VTs.
//! - [`seat`] ties the three together: it schedules an ordered list of
//!   sessions onto the seat, wires session activation to VT ownership and
//!   consumes the configured hotkeys before sessions see them.
//!
//! ## The event loop and state handling
//!
//! The crate is callback-oriented and strictly single-threaded: all mutation
//! happens on the loop thread, and shared state lives behind `Rc` handles
//! with interior mutability rather than locks. Public objects are cheap
//! clonable handles to their inner state; sources and hooks unregister when
//! their handle is dropped.
//!
//! ## Logging
//!
//! This crate never initializes a logging backend; it emits its diagnostics
//! through [`tracing`] and leaves subscriber setup to the daemon.

pub mod eloop;
pub mod input;
pub mod seat;
pub mod vt;

pub mod reexports;
