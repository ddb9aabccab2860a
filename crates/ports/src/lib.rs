//! ports - 抽象 trait 层
//!
//! 定义存储与外部协作方的抽象接口

mod email;
mod kv_store;
mod workflow;

pub use email::*;
pub use kv_store::*;
pub use workflow::*;
