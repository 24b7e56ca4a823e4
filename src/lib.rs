//! An embedded-Linux debug bridge, in the spirit of adb: a workstation-side
//! client and an on-target agent exposing filesystem navigation, file
//! transfer, system introspection and command execution over a single TCP
//! connection.
//!
//! The wire format is a length-prefixed framing of a small MessagePack
//! subset; see the [`protocol`] module. The [`session`] module implements the
//! per-connection state machine, [`client`] the workstation facade and
//! [`agent`] the on-target dispatcher.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications
)]

pub mod agent;
pub mod client;
pub mod protocol;
pub mod session;

pub use client::{Client, ClientError};

/// The TCP port both endpoints use unless overridden.
pub const DEFAULT_PORT: u16 = 1337;
