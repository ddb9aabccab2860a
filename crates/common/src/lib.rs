//! guard-common - 通用类型和工具库

pub mod clock;
pub mod redact;

pub use clock::*;
pub use redact::*;
