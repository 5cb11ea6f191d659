#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber, span};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::registry::{self, LookupSpan};
use tracing_subscriber::{Layer, layer::Context};

use super::{SessionLog, TelemetrySink, set_telemetry_sink};

/// One captured log event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub fields: HashMap<String, String>,
}

#[derive(Default, Debug)]
pub struct CaptureStore {
    pub events: Mutex<Vec<CapturedEvent>>,
    pub spans: Mutex<HashMap<span::Id, HashMap<String, String>>>,
}

impl CaptureStore {
    /// Events at `warn` or more severe.
    pub fn faults(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level <= Level::WARN)
            .cloned()
            .collect()
    }

    /// Field values recorded on any span under `key`.
    pub fn span_values(&self, key: &str) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .values()
            .filter_map(|m| m.get(key).cloned())
            .collect()
    }
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<CaptureStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let mut map = HashMap::new();
        attrs.record(&mut MapVisitor { map: &mut map });
        self.store.spans.lock().unwrap().insert(id.clone(), map);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(map) = self.store.spans.lock().unwrap().get_mut(id) {
            values.record(&mut MapVisitor { map });
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut MapVisitor { map: &mut fields });
        self.store.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            fields,
        });
    }
}

/// Install a thread-local capturing subscriber; capture stops when the guard drops.
pub fn install_capture() -> (Arc<CaptureStore>, DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(CaptureStore::default());
    let layer = CaptureLayer {
        store: store.clone(),
    };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}

/// Process-wide sink that keeps every session log; shared by all tests.
#[derive(Default)]
pub struct MemorySink {
    pub logs: Mutex<Vec<SessionLog>>,
}

impl TelemetrySink for MemorySink {
    fn record_session(&self, log: SessionLog) {
        self.logs.lock().unwrap().push(log);
    }
}

static SINK: Lazy<Arc<MemorySink>> = Lazy::new(|| {
    let sink = Arc::new(MemorySink::default());
    set_telemetry_sink(sink.clone());
    sink
});

/// Enable capture on this thread and return the shared sink.
pub fn memory_sink() -> Arc<MemorySink> {
    super::test_set_capture_enabled(true);
    SINK.clone()
}

impl MemorySink {
    pub fn find(&self, session_id: &str) -> Option<SessionLog> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.session_id == session_id)
            .cloned()
    }
}
