//! Test doubles shared by unit tests across the crate: a tiny wire schema, an in-memory hub that
//!  can be scripted from the test, and a delegate that records every callback.

pub mod delegate;
pub mod framer;
pub mod hub;
