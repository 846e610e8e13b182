//! Ratewarden - Leaky Bucket Rate Limiting Engine
//!
//! This crate decides whether an operation may proceed given a set of named
//! limits. Each limit is a leaky bucket scoped by engine identity, owner tag,
//! limit name and an optional per-request identifier; allowances live in a
//! pluggable store. Observers are told about every evaluation and may attach
//! response headers, veto the operation, or reject it with an error.

pub mod allowance;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ratelimit;
