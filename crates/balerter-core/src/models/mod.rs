//! Data models for Balerter

mod alert;
mod encoding;
mod message;
mod options;

pub use alert::*;
pub use message::*;
pub use options::*;
