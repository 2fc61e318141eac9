//! Connection core: lifecycle state machine, invocation correlation,
//! inbound dispatch, idle watchdog and shutdown fan-out.
//!
//! # Architecture Overview
//!
//! ```text
//! caller                         HubConnection                    transport
//! ──────                         ─────────────                    ─────────
//! invoke/stream ──▶ register in PendingCalls ──▶ serialize ──▶ send (lock)
//! send ───────────────────────────────────────▶ serialize ──▶ send (lock)
//! on ──────────────▶ HandlerRegistry
//!
//! receive task ◀── TransportEvent::Data ◀─────────────────────── inbound
//!   │ rearm watchdog, parse via protocol + binder
//!   ├─ Completion / StreamItem ──▶ resolve PendingCalls entry
//!   ├─ Invocation ───────────────▶ HandlerRegistry snapshot
//!   └─ Ping ─────────────────────▶ (nothing; the rearm was the point)
//!
//! shutdown ◀── TransportEvent::Closed / watchdog abort / dispose
//!   cancel active signal + drain PendingCalls under one lock,
//!   then fire the closed callbacks exactly once
//! ```
//!
//! The pieces are deliberately small and separately testable; the
//! [`connection`] module owns the only state machine.

mod binder;
mod connection;
mod handlers;
mod ids;
mod invocation;
mod pending;
mod watchdog;

pub use connection::{HubConnection, HubConnectionBuilder, HubStream};
pub use handlers::{HandlerFn, HandlerFuture, HandlerState, Subscription};
pub use ids::{InvocationIdSource, SequentialIds};
