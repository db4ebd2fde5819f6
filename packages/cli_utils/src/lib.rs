#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal plumbing for the `spill_chips` binary.
//!
//! [`init_logger`] installs `pretty_env_logger` behind
//! `indicatif-log-bridge` so log lines do not tear through progress bars,
//! and [`IndicatifProgress`] renders dispatch progress.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use spill_chips_dispatch::progress::ProgressCallback;

pub use indicatif::MultiProgress;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// An `indicatif` [`ProgressBar`] driven through [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Applied once the total is known.
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    /// A spinner that turns into a download bar with ETA on
    /// [`ProgressCallback::set_total`].
    #[must_use]
    pub fn downloads_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.cyan/dim} {pos}/{len} chips [{elapsed_precise} / {eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self { bar, bar_style })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.bar_style.clone());
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Installs the global logger and returns the [`MultiProgress`] every
/// progress bar must be added to.
///
/// `RUST_LOG` takes precedence; otherwise `default_filter` applies (e.g.
/// `"debug"` when the user asked for verbose output).
#[must_use]
pub fn init_logger(default_filter: &str) -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) if !filters.is_empty() => builder.parse_filters(&filters),
        _ => builder.parse_filters(default_filter),
    };
    let logger = builder.build();
    let level = logger.filter();

    // Fails only if a logger is already installed.
    let _ = indicatif_log_bridge::LogWrapper::new(multi.clone(), logger).try_init();
    log::set_max_level(level);

    multi
}
