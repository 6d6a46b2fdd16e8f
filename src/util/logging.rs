use tracing::Level;

/// Installs the process wide fmt subscriber. Calling this more than once is harmless, later
///  calls are ignored.
pub fn init_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
