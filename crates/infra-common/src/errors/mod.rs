//! Error types shared by infrastructure helpers

pub mod types;
