//! Status and progress reporting under a single verbosity switch.
//!
//! - [`VerbosityLevel::Quiet`] → no text logs below warn; a live spinner carries status
//!   messages and [`Notifier::create_progress_bar`] renders per-layer bars.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → plain
//!   `log` records, with [`Notifier::progress`] emitting periodic counts instead of bars.
//!
//! [`init_logging`] installs the global `env_logger` at the level matching the switch;
//! library modules log through the `log` facade directly.

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner and bars, warnings only
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Installs the global logger. `RUST_LOG` still takes precedence per module.
pub fn init_logging(verbosity: VerbosityLevel) {
    let _ = env_logger::Builder::from_env(Env::default())
        .filter_level(verbosity.to_log_level())
        .try_init();
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi_progress: Option<Arc<MultiProgress>>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(Arc::new(MultiProgress::new()))
        } else {
            None
        };

        Self {
            verbosity,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    /// A notifier that draws nothing; logs still flow through `log` at info level and up.
    pub fn silent() -> Self {
        Self {
            verbosity: VerbosityLevel::Info,
            multi_progress: None,
            active_spinner: RefCell::new(None),
        }
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                // Lazy initialize spinner on first info call
                if self.active_spinner.borrow().is_none() {
                    if let Some(multi_progress) = &self.multi_progress {
                        let spinner = multi_progress.add(ProgressBar::new_spinner());
                        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                            spinner.set_style(style);
                        }
                        spinner.enable_steady_tick(Duration::from_millis(100));

                        *self.active_spinner.borrow_mut() = Some(spinner);
                    }
                }

                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => log::info!("{}", message),
        }
    }

    pub fn warn(&self, message: &str) {
        if let Some(spinner) = self.active_spinner.borrow().as_ref() {
            spinner.suspend(|| log::warn!("{}", message));
        } else {
            log::warn!("{}", message);
        }
    }

    /// A bar for `length` steps in Quiet mode; `None` otherwise.
    /// The returned bar is `Send + Sync` and may be ticked from worker threads.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        if self.verbosity == VerbosityLevel::Quiet {
            if let Some(multi_progress) = &self.multi_progress {
                let progress_bar = multi_progress.add(ProgressBar::new(length));
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
                ) {
                    progress_bar.set_style(style.progress_chars("=> "));
                }
                progress_bar.set_message(message.to_string());
                return Some(progress_bar);
            }
        }
        None
    }

    pub fn progress(&self, current: u64, total: u64, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet && (current % 100 == 0 || current == total) {
            self.info(&format!("{}: {}/{}", message, current, total));
        }
    }

    /// Clears the spinner, if one was started.
    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.finish();
    }
}
