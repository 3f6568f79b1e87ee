//! keelctl - CLI for keel node lifecycle operations.
//!
//! The heart of the crate is the [`action::Tracker`]: it issues an action
//! (reboot, upgrade, reset) against a set of nodes concurrently, follows
//! each node's event stream with reconnect handling, runs optional post
//! checks and streams progress to the operator.

pub mod action;
pub mod client;
pub mod commands;
pub mod ring;
