//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Environment variable holding the log filter. `RUST_LOG` is consulted when it is unset.
const LOG_ENV: &str = "BUCKETFS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    /// Compact output with progress spinners for in-flight spans.
    Pretty,
    /// Plain `fmt` output with span enter/close events.
    Plain,
}

pub struct Trc {
    style: Style,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        match EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env()) {
            // An explicit filter means someone is debugging; spinners only get in the way.
            Ok(env_filter) => Self {
                style: Style::Plain,
                env_filter,
            },
            Err(_) => Self {
                style: Style::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Force plain output, e.g. when stdout is piped.
    #[must_use]
    pub fn plain(mut self, plain: bool) -> Self {
        if plain {
            self.style = Style::Plain;
        }
        self
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.style {
            Style::Plain => self.init_plain(),
            Style::Pretty => self.init_pretty(),
        }
    }

    fn init_plain(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .finish()
            .try_init()
    }

    fn init_pretty(self) -> Result<(), TryInitError> {
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}
