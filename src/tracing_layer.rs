//! Tracing layer that forwards every event to a logger

use crate::logger::{Arg, Log, Logger};
use serde_json::{Map, Value};
use std::cell::Cell;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// A tracing layer that logs each event through a [`Logger`]
///
/// The tracing level maps to the level of the same name. Events at levels
/// the logger does not define are dropped. The `message` field becomes the
/// message and every other field becomes metadata, alongside `target`.
pub struct TracingBridge {
    logger: Logger,
}

impl TracingBridge {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

impl<S> Layer<S> for TracingBridge
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // diagnostics emitted while dispatching would loop back here
        if FORWARDING.with(Cell::get) {
            return;
        }

        let metadata = event.metadata();
        let level = level_name(metadata.level());
        if !self.logger.levels().iter().any(|l| l == level) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        visitor
            .fields
            .insert("target".to_string(), Value::from(metadata.target()));

        FORWARDING.with(|flag| flag.set(true));
        let result = self.logger.log(vec![
            Arg::from(level),
            Arg::Str(visitor.message),
            Arg::Value(Value::Object(visitor.fields)),
        ]);
        FORWARDING.with(|flag| flag.set(false));

        // Ignore errors in the layer; a closed logger just stops receiving
        let _ = result;
    }
}

/// Collects the message and the remaining fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }
}
