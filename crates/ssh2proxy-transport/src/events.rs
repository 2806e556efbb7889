//! Hook for forwarding transport lifecycle events to a diagnostic channel

use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn, Level};

/// Receives human-readable event lines (reconnects, pool churn, ...)
///
/// `record` is called from async tasks and must never block.
pub trait EventSink: Send + Sync + Debug {
    fn record(&self, level: Level, message: &str);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _level: Level, _message: &str) {}
}

pub type SharedSink = Arc<dyn EventSink>;

/// Log through `tracing` and forward the same line to `sink`
pub fn emit(sink: &dyn EventSink, level: Level, message: &str) {
    if level == Level::ERROR {
        error!("{}", message);
    } else if level == Level::WARN {
        warn!("{}", message);
    } else if level == Level::INFO {
        info!("{}", message);
    } else if level == Level::DEBUG {
        debug!("{}", message);
    } else {
        trace!("{}", message);
    }
    sink.record(level, message);
}
