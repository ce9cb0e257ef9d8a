//! Per-build log fanout.
//!
//! One `tracing` layer duplicates every DEBUG-and-up event that carries a
//! `build` field into that build's log file. The executor opens a sink at
//! build start and closes it before uploading the log artifact.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chef_common::{Error, Result};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Registry of open per-build log files.
#[derive(Default)]
pub struct BuildLogFanout {
    sinks: Mutex<HashMap<String, BufWriter<File>>>,
}

impl BuildLogFanout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the log file for `build_id` and route its events there.
    pub fn open(&self, build_id: &str, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut sinks = self
            .sinks
            .lock()
            .map_err(|_| Error::internal("log fanout mutex poisoned"))?;
        sinks.insert(build_id.to_string(), BufWriter::new(file));
        Ok(())
    }

    /// Flush and drop the sink. Safe to call for unknown ids.
    pub fn close(&self, build_id: &str) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(mut sink) = sinks.remove(build_id) {
                let _ = sink.flush();
            }
        }
    }

    /// Append one raw line, e.g. captured step output.
    pub fn write_raw(&self, build_id: &str, line: &str) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(sink) = sinks.get_mut(build_id) {
                let _ = writeln!(sink, "{line}");
            }
        }
    }

    fn write_event(&self, build_id: &str, level: &Level, target: &str, message: &str) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(sink) = sinks.get_mut(build_id) {
                let _ = writeln!(
                    sink,
                    "{}.{:03} {level:>5} {target}: {message}",
                    stamp.as_secs(),
                    stamp.subsec_millis()
                );
            }
        }
    }

    pub fn open_sinks(&self) -> usize {
        self.sinks.lock().map(|sinks| sinks.len()).unwrap_or(0)
    }
}

/// The subscriber layer side of the fanout.
pub struct BuildLogLayer {
    fanout: Arc<BuildLogFanout>,
}

impl BuildLogLayer {
    pub fn new(fanout: Arc<BuildLogFanout>) -> Self {
        Self { fanout }
    }
}

impl<S: Subscriber> Layer<S> for BuildLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // DEBUG and up; TRACE stays out of build logs.
        if *event.metadata().level() == Level::TRACE {
            return;
        }
        let mut visitor = BuildVisitor::default();
        event.record(&mut visitor);
        let Some(build) = visitor.build else {
            return;
        };
        let mut message = visitor.message;
        if !visitor.extra.is_empty() {
            let _ = write!(message, " [{}]", visitor.extra.join(", "));
        }
        self.fanout.write_event(
            &build,
            event.metadata().level(),
            event.metadata().target(),
            &message,
        );
    }
}

#[derive(Default)]
struct BuildVisitor {
    build: Option<String>,
    message: String,
    extra: Vec<String>,
}

impl BuildVisitor {
    fn record(&mut self, field: &Field, value: String) {
        match field.name() {
            "build" => self.build = Some(value.trim_matches('"').to_string()),
            "message" => self.message = value,
            name => self.extra.push(format!("{name}={value}")),
        }
    }
}

impl Visit for BuildVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_with_a_build_field_reach_the_sink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.log");
        let fanout = BuildLogFanout::new();
        fanout.open("b-1", &path).unwrap();

        let subscriber =
            tracing_subscriber::registry().with(BuildLogLayer::new(Arc::clone(&fanout)));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(build = "b-1", step = "configure", "step started");
            tracing::info!("no build field, stays out");
            tracing::info!(build = "b-2", "different build, no sink");
        });

        fanout.close("b-1");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("step started"));
        assert!(contents.contains("step=configure"));
        assert!(!contents.contains("stays out"));
        assert!(!contents.contains("different build"));
    }

    #[test]
    fn raw_lines_append_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.log");
        let fanout = BuildLogFanout::new();
        fanout.open("b-1", &path).unwrap();
        fanout.write_raw("b-1", "line one");
        fanout.write_raw("b-1", "line two");
        fanout.close("b-1");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[test]
    fn closing_an_unknown_sink_is_harmless() {
        let fanout = BuildLogFanout::new();
        fanout.close("ghost");
        fanout.write_raw("ghost", "dropped");
        assert_eq!(fanout.open_sinks(), 0);
    }
}
