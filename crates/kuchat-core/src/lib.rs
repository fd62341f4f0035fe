//! ku-chat core - shared types for the real-time routing core
//!
//! This crate provides the domain types shared between the wire
//! protocol (`kuchat-protocol`) and the daemon (`kuchatd`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use user::{UserId, MAX_USER_ID_LEN};
