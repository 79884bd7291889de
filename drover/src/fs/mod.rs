//! Filesystem helpers shared by every state-writing component.

pub mod atomic;
pub mod locking;

pub use atomic::write_atomic;
pub use locking::{locked_append, locked_read, locked_write};
