//! Synchronization primitives

pub mod keyed_lock;
