//! 工具函数模块

pub mod context;
pub mod endpoint;
pub mod logging;

pub use context::{Context, ContextError};
pub use endpoint::{new_endpoint, parse_endpoint, scheme, split_endpoint};
