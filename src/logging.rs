//! Logger construction

use slog::{o, Drain, Level, Logger};

/// Asynchronous terminal logger that drops records below `level`
pub fn terminal(level: Level) -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!())
}

/// Logger that swallows everything, for tests and embedding
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::info;

    #[test]
    fn test_level_names_parse() {
        assert_eq!("debug".parse::<Level>().ok(), Some(Level::Debug));
        assert_eq!("warn".parse::<Level>().ok(), Some(Level::Warning));
    }

    #[test]
    fn test_discard_accepts_records() {
        let logger = discard().new(o!("role" => "worker"));
        info!(logger, "dropped"; "key" => 1);
    }
}
