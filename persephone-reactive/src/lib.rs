//! Reactive primitives shared by the persephone crates.
//!
//! The only primitive so far is the broadcasting [`Publisher`], a hot event
//! stream with drop-on-full delivery and subscriber counting.

mod publisher;

pub use publisher::{Publisher, PublisherClosed, Subscription};
