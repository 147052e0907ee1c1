//! Logging Module
//!
//! Structured logging for the training stages using the `tracing` crate.
//! `RUST_LOG` overrides the configured level when it is set.

use std::time::Instant;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Debug-level output with module paths, used by `--verbose`
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::default()
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name, falling back to `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Initialize the global subscriber
///
/// Returns an error message if a global subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

/// Epoch-level progress logger for one training stage
pub struct StageLogger {
    stage: &'static str,
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    stage_start: Instant,
}

impl StageLogger {
    pub fn new(stage: &'static str, total_epochs: usize) -> Self {
        tracing::info!("[{}] starting ({} epochs)", stage, total_epochs);
        Self {
            stage,
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            stage_start: Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::info!("[{}] epoch {}/{}", self.stage, epoch + 1, self.total_epochs);
    }

    /// Log end of an epoch with its loss and validation score
    pub fn end_epoch(&self, train_loss: f64, val_score: f64, learning_rate: f64) {
        let remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch = self.stage_start.elapsed().as_secs_f64() / (self.epoch + 1) as f64;

        tracing::info!(
            "[{}] epoch {}/{} done in {:.1}s | loss {:.4} | val {:.2}% | lr {:.6} | eta {:.0}s",
            self.stage,
            self.epoch + 1,
            self.total_epochs,
            self.epoch_start.elapsed().as_secs_f64(),
            train_loss,
            val_score * 100.0,
            learning_rate,
            remaining as f64 * avg_epoch
        );
    }

    /// Log stage completion
    pub fn finish(&self, best_score: f64, best_epoch: usize) {
        tracing::info!(
            "[{}] complete in {} | best {:.2}% at epoch {}",
            self.stage,
            super::format_duration(self.stage_start.elapsed().as_secs_f64()),
            best_score * 100.0,
            best_epoch + 1
        );
    }
}
