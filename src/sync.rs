//! Atomics the segment chain is built on.
//!
//! Under `--cfg loom` the chain links (`head`, `tail` and every segment's
//! `next`) become Loom atomics, so the model tests explore the link and head
//! advance paths of the real queue. Ring internals stay on core atomics.

#[cfg(not(loom))]
pub use core::sync::atomic::AtomicPtr;

#[cfg(loom)]
pub use loom::sync::atomic::AtomicPtr;
