// log_sink.rs
// Purpose: process-wide tracing setup for the serving and control-loop runtime

use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{LoopError, LoopResult};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when present.
pub fn init_tracing(level: &str, json: bool) -> LoopResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("sentiment_loop={level},tower_http=warn")))
        .map_err(|e| LoopError::config(format!("invalid log filter: {e}")))?;

    let builder = fmt().with_env_filter(filter).with_target(true);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.compact().try_init()
    };

    result.map_err(|e| LoopError::internal(format!("tracing already initialised: {e}")))
}
