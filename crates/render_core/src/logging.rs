//! Logging setup for binaries and tests

pub use log::{debug, error, info, trace, warn, LevelFilter};

/// Initialize `env_logger` from `RUST_LOG`, defaulting to `info`
///
/// Calling it more than once is harmless.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Initialize `env_logger` with `level` unless `RUST_LOG` overrides it
pub fn init_with_level(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
    if result.is_err() {
        log::trace!("Logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_with_level(LevelFilter::Debug);
        init();
        info!("logging initialized");
    }
}
