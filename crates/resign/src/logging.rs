//! Process-wide verbosity.

use log::LevelFilter;

/// Log verbosity requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Debug,
}

impl Verbosity {
    /// Quiet beats debug when both are set.
    pub fn from_flags(debug: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if debug {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        }
    }

    pub fn level(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
        }
    }
}

/// Set the global maximum log level.
///
/// This is process state: concurrent invocations share the level of the
/// most recent call.
pub fn apply(verbosity: Verbosity) {
    log::set_max_level(verbosity.level());
}
