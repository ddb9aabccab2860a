//! guard-adapter-local - 进程内降级存储
//!
//! 内存 Map + 可选的整文件 JSON 持久化，主存储不可用或未配置时使用

mod store;

pub use store::*;
