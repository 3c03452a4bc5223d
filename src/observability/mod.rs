//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，可由 RUST_LOG 覆盖；重复初始化（如多个测试）静默忽略。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_directive("info");
}

/// 以指定默认指令初始化（如 "hive=debug"）；返回是否由本次调用完成安装
pub fn init_with_directive(directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
