//! Logging init. `-v` raises the default level from `info` to `debug`; `RUST_LOG`
//! still overrides either, same as every other `env_logger` consumer.

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
