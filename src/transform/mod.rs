//! Transform units and composed stacks
//!
//! A unit is either a modifier (payload to payload) or a formatter (payload
//! to rendered string). Units are built from plain functions through
//! [`create_modifier`] / [`create_formatter`] and composed with [`combine`],
//! which always orders every modifier before every formatter while keeping
//! the relative order inside each group.

pub mod formats;
pub mod modifiers;
pub mod stacks;

use crate::error::TransformError;
use crate::payload::Payload;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type ModifierFn = dyn Fn(Payload, &Value) -> Result<Payload, TransformError> + Send + Sync;
type FormatterFn = dyn Fn(&Payload, &Value) -> Result<String, TransformError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Modifier,
    Formatter,
}

#[derive(Clone)]
enum UnitFn {
    Modifier(Arc<ModifierFn>),
    Formatter(Arc<FormatterFn>),
}

impl UnitFn {
    fn kind(&self) -> UnitKind {
        match self {
            UnitFn::Modifier(_) => UnitKind::Modifier,
            UnitFn::Formatter(_) => UnitKind::Formatter,
        }
    }
}

/// A wrapped function bound to its options.
#[derive(Clone)]
pub struct TransformUnit {
    name: Arc<str>,
    options: Arc<Value>,
    func: UnitFn,
}

impl TransformUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitKind {
        self.func.kind()
    }

    pub fn options(&self) -> &Value {
        &self.options
    }
}

impl fmt::Debug for TransformUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformUnit")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("options", &self.options)
            .finish()
    }
}

/// Produces units from a wrapped function, one per options value.
#[derive(Clone)]
pub struct UnitFactory {
    name: Arc<str>,
    func: UnitFn,
}

impl UnitFactory {
    /// Bind the function to `options`.
    pub fn with(&self, options: Value) -> TransformUnit {
        TransformUnit {
            name: self.name.clone(),
            options: Arc::new(options),
            func: self.func.clone(),
        }
    }

    /// Bind the function to empty options.
    pub fn unit(&self) -> TransformUnit {
        self.with(Value::Object(Default::default()))
    }

    pub fn kind(&self) -> UnitKind {
        self.func.kind()
    }
}

impl fmt::Debug for UnitFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitFactory")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Wrap a payload-rewriting function.
pub fn create_modifier<F>(name: impl Into<String>, f: F) -> UnitFactory
where
    F: Fn(Payload, &Value) -> Result<Payload, TransformError> + Send + Sync + 'static,
{
    UnitFactory {
        name: Arc::from(name.into()),
        func: UnitFn::Modifier(Arc::new(f)),
    }
}

/// Wrap a rendering function whose result becomes the payload output.
pub fn create_formatter<F>(name: impl Into<String>, f: F) -> UnitFactory
where
    F: Fn(&Payload, &Value) -> Result<String, TransformError> + Send + Sync + 'static,
{
    UnitFactory {
        name: Arc::from(name.into()),
        func: UnitFn::Formatter(Arc::new(f)),
    }
}

/// Anything [`combine`] accepts: a single unit or an already combined stack.
#[derive(Debug, Clone)]
pub enum Transform {
    Unit(TransformUnit),
    Stack(TransformStack),
}

impl From<TransformUnit> for Transform {
    fn from(unit: TransformUnit) -> Self {
        Transform::Unit(unit)
    }
}

impl From<TransformStack> for Transform {
    fn from(stack: TransformStack) -> Self {
        Transform::Stack(stack)
    }
}

impl From<&TransformStack> for Transform {
    fn from(stack: &TransformStack) -> Self {
        Transform::Stack(stack.clone())
    }
}

/// Result of running a stack over one payload.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub payload: Payload,
    /// `(unit name, error)` for the unit that aborted the fold, if any.
    pub errors: Vec<(String, TransformError)>,
}

impl TransformResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Ordered, flattened units: modifiers first, then formatters.
#[derive(Debug, Clone)]
pub struct TransformStack {
    units: Arc<[TransformUnit]>,
}

impl Default for TransformStack {
    fn default() -> Self {
        Self {
            units: Arc::from(Vec::new()),
        }
    }
}

/// Flatten nested stacks and partition units so every modifier runs
/// before any formatter.
pub fn combine<I, T>(items: I) -> TransformStack
where
    I: IntoIterator<Item = T>,
    T: Into<Transform>,
{
    let mut modifiers = Vec::new();
    let mut formatters = Vec::new();

    let mut push = |unit: &TransformUnit| match unit.kind() {
        UnitKind::Modifier => modifiers.push(unit.clone()),
        UnitKind::Formatter => formatters.push(unit.clone()),
    };

    for item in items {
        match item.into() {
            Transform::Unit(unit) => push(&unit),
            Transform::Stack(stack) => stack.units.iter().for_each(&mut push),
        }
    }

    modifiers.extend(formatters);
    TransformStack {
        units: modifiers.into(),
    }
}

impl TransformStack {
    pub fn units(&self) -> &[TransformUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Fold the stack over `payload`.
    ///
    /// The first unit that fails stops the fold; its error is recorded and
    /// nothing after it runs. Output is assigned exactly once at the end:
    /// the last formatter result, else the source error's stack, else the
    /// (possibly rewritten) message.
    pub fn apply(&self, payload: Payload) -> TransformResult {
        let mut working = payload;
        working.clear_output();
        let mut rendered: Option<String> = None;
        let mut errors = Vec::new();

        for unit in self.units.iter() {
            let applied = match &unit.func {
                UnitFn::Modifier(f) => f(working.clone(), &unit.options).map(|next| {
                    working = next;
                }),
                UnitFn::Formatter(f) => f(&working, &unit.options).map(|out| {
                    rendered = Some(out);
                }),
            };
            if let Err(err) = applied {
                errors.push((unit.name.to_string(), err));
                break;
            }
        }

        let output = rendered.unwrap_or_else(|| match working.err() {
            Some(err) => err.stack_or_message().to_string(),
            None => working.message.clone(),
        });
        working.set_output(output);

        TransformResult {
            payload: working,
            errors,
        }
    }
}
