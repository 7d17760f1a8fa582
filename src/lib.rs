//! Headless playback orchestration for streamed audio.
//!
//! One [`player::Player`] per session owns a queue of track references, the
//! connection to an audio sink, and the policy that decides what plays next,
//! when to retry, and when to give up. Lazily-specified tracks (catalog
//! placeholders) are resolved on demand through a chain of lookup strategies,
//! and byte streams are acquired through a chain of extraction strategies
//! with bounded retries.
//!
//! The [`session::Registry`] maps session keys to live players and is the
//! only piece of shared state between sessions.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod acquire;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http;
pub mod player;
pub mod resolver;
pub mod search;
pub mod session;
pub mod sink;
pub mod track;
