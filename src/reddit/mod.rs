//! Upstream platform client
//!
//! A single shared [`Client`] per process; workers construct a lightweight
//! [`AuthenticatedClient`] per account on each use.

mod client;
pub mod singleflight;
mod types;

pub use client::{obfuscate, AuthenticatedClient, Client, Error};
pub use types::{Comment, Message, Post, RefreshedTokens, Thread};
