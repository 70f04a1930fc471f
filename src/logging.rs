use std::io::Write;

/// Install the process-wide logger. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: log::LevelFilter) {
    let result = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
    // A second initialization (tests, embedding) keeps the first logger.
    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}
