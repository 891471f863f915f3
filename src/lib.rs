//! auraflowd - keeps an idle session awake by nudging the pointer.
//!
//! The daemon samples how long the user has been idle and, once that passes
//! a configured threshold, injects a one-pixel pointer nudge on every tick.
//! Front ends drive it through [`commands::CommandFacade`] and observe it
//! through [`events::EventSink`].

pub mod commands;
pub mod config;
pub mod engine;
pub mod events;
pub mod idle;
pub mod input;
pub mod settings;
pub mod x11;
