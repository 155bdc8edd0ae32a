//! Logging configuration for the advertising stack daemon.

use log::LevelFilter;
use syslog::{BasicLogger, Error, Facility, Formatter3164};

use log_panics;

/// API to modify log levels at runtime.
pub trait IAdvLogging {
    /// Check whether debug logging is enabled.
    fn is_debug_enabled(&self) -> bool;

    /// Change whether debug logging is enabled.
    fn set_debug_logging(&mut self, enabled: bool);
}

/// Logging related implementation.
pub struct AdvLogging {
    /// Should debug logs be emitted?
    is_debug: bool,

    /// Log to stderr?
    is_stderr: bool,

    /// Is logging already initialized?
    is_initialized: bool,
}

impl AdvLogging {
    pub fn new(is_debug: bool, log_output: &str) -> Self {
        let is_stderr = log_output == "stderr";
        Self { is_debug, is_stderr, is_initialized: false }
    }

    pub fn initialize(&mut self) -> Result<(), Error> {
        let level = if self.is_debug { LevelFilter::Debug } else { LevelFilter::Info };

        if self.is_stderr {
            env_logger::Builder::new().filter(None, level).parse_default_env().try_init().ok();
        } else {
            let formatter = Formatter3164 {
                facility: Facility::LOG_USER,
                hostname: None,
                process: "btadvd".into(),
                pid: 0,
            };

            let logger = syslog::unix(formatter)?;
            let _ = log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| log::set_max_level(level));
            log_panics::init();
        }

        self.is_initialized = true;
        Ok(())
    }
}

impl IAdvLogging for AdvLogging {
    fn is_debug_enabled(&self) -> bool {
        self.is_initialized && self.is_debug
    }

    fn set_debug_logging(&mut self, enabled: bool) {
        if !self.is_initialized {
            return;
        }

        self.is_debug = enabled;

        let level = if self.is_debug { LevelFilter::Debug } else { LevelFilter::Info };
        log::set_max_level(level);

        log::info!("Setting debug logging to {}", self.is_debug);
    }
}
