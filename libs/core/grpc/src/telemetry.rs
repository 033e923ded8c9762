//! Logging setup: the process-wide subscriber and the per-server call logger.

use std::env;
use std::fmt;

use tracing::{Dispatch, Level, debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Application environment (dev = local/kind, prod = full k8s)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Install color-eyre with file:line locations and no env section.
///
/// Safe to call multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize the global subscriber.
///
/// - **Production** (`APP_ENV=production`): flattened JSON, no targets.
/// - **Development** (default): pretty output.
///
/// `RUST_LOG` overrides the default filter (`warn` in production, `debug`
/// otherwise). Both include `tracing_error::ErrorLayer` so errors carry span
/// traces. Calling this more than once is harmless.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new("debug")
        }
    });

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => info!("Tracing initialized. Environment: {:?}", environment),
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }
}

/// Structured logger handed to the call chain.
///
/// Wraps a [`tracing::Dispatch`], so cloning is cheap and every clone writes
/// to the same subscriber. Call logs go to this dispatcher regardless of what
/// the global default is.
#[derive(Clone)]
pub struct CallLogger {
    dispatch: Dispatch,
}

impl CallLogger {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Use whatever subscriber is the default at the time of the call.
    pub fn current() -> Self {
        Self::new(tracing::dispatcher::get_default(Dispatch::clone))
    }

    /// Flattened JSON to stdout at debug level. Substituted when no logger is
    /// supplied.
    pub fn example() -> Self {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_max_level(Level::DEBUG)
            .finish();
        Self::new(Dispatch::new(subscriber))
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub(crate) fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl fmt::Debug for CallLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLogger").finish_non_exhaustive()
    }
}

impl From<Dispatch> for CallLogger {
    fn from(dispatch: Dispatch) -> Self {
        Self::new(dispatch)
    }
}
