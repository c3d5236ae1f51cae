//! 可观测性：tracing 订阅器初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，`RUST_LOG` 可覆盖
pub fn init() {
    init_with_directive("info");
}

/// 以给定的默认指令初始化（如 `apiary=debug`）；重复初始化时静默忽略
pub fn init_with_directive(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
