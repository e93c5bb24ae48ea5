//! Mirror API route handlers.

pub mod collections;
pub mod health;
