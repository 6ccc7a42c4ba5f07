use std::collections::HashMap;
use std::sync::Arc;

use crate::attributes::AttributeHandler;
use crate::errors::EngineError;
use crate::value::{self, AnyValue, ValueKind};

/// Callback a variable uses to announce a value change or connectivity
/// transition: `(value, connected)`. Installed by the owning workspace.
pub type VariableNotifier = Arc<dyn Fn(&AnyValue, bool) + Send + Sync>;

/// Capability set of a workspace variable.
///
/// Implementations own one typed value and a "connected" flag and must emit a
/// notification on every value change and connectivity transition. `setup`
/// must tolerate being called twice.
pub trait Variable: Send {
    fn type_name(&self) -> &str;

    fn attributes(&self) -> &AttributeHandler;

    fn attributes_mut(&mut self) -> &mut AttributeHandler;

    fn setup(&mut self) -> Result<(), EngineError>;

    /// True when the variable is connected and holds a valid value.
    fn is_available(&self) -> bool;

    /// Retrieve (a copy of) the value at `path`; `""` addresses the whole
    /// value.
    fn get_value(&self, path: &str) -> Option<AnyValue>;

    fn set_value(&mut self, path: &str, new_value: AnyValue) -> bool;

    fn reset(&mut self);

    fn set_notifier(&mut self, notifier: VariableNotifier);
}

// ─── Local variable ───────────────────────────────────────────

const TYPE_ATTRIBUTE: &str = "type";
const VALUE_ATTRIBUTE: &str = "value";

/// In-memory variable initialised from `type`/`value` JSON attributes.
pub struct LocalVariable {
    attributes: AttributeHandler,
    declared_kind: Option<ValueKind>,
    current: Option<AnyValue>,
    notifier: Option<VariableNotifier>,
}

impl LocalVariable {
    pub const TYPE: &'static str = "Local";

    pub fn new() -> Self {
        let mut attributes = AttributeHandler::new();
        attributes.add_definition(TYPE_ATTRIBUTE, ValueKind::String);
        attributes.add_definition(VALUE_ATTRIBUTE, ValueKind::Any);
        LocalVariable {
            attributes,
            declared_kind: None,
            current: None,
            notifier: None,
        }
    }

    pub fn boxed() -> Box<dyn Variable> {
        Box::new(LocalVariable::new())
    }

    fn notify(&self, value: &AnyValue, connected: bool) {
        if let Some(notifier) = &self.notifier {
            notifier(value, connected);
        }
    }
}

impl Default for LocalVariable {
    fn default() -> Self {
        LocalVariable::new()
    }
}

impl Variable for LocalVariable {
    fn type_name(&self) -> &str {
        LocalVariable::TYPE
    }

    fn attributes(&self) -> &AttributeHandler {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut AttributeHandler {
        &mut self.attributes
    }

    fn setup(&mut self) -> Result<(), EngineError> {
        let name = self
            .attributes
            .attribute_string(crate::attributes::NAME_ATTRIBUTE)
            .unwrap_or(LocalVariable::TYPE)
            .to_string();
        let fail = |details: String| EngineError::VariableSetup {
            name: name.clone(),
            details,
        };
        self.declared_kind = match self.attributes.attribute_string(TYPE_ATTRIBUTE) {
            Some(type_name) => Some(
                ValueKind::from_type_name(type_name)
                    .ok_or_else(|| fail(format!("unknown type '{type_name}'")))?,
            ),
            None => None,
        };
        let initial = match self.attributes.attribute_string(VALUE_ATTRIBUTE) {
            Some(repr) => {
                let parsed: AnyValue = serde_json::from_str(repr)
                    .map_err(|e| fail(format!("could not parse value '{repr}': {e}")))?;
                if let Some(kind) = self.declared_kind {
                    if !kind.matches(&parsed) {
                        return Err(fail(format!("value '{repr}' is not of kind {kind:?}")));
                    }
                }
                Some(parsed)
            }
            // A declared type without a value starts as that type's default.
            None => self.declared_kind.map(|kind| match kind {
                ValueKind::Bool => AnyValue::Bool(false),
                ValueKind::Integer => AnyValue::from(0i64),
                ValueKind::UnsignedInteger => AnyValue::from(0u64),
                ValueKind::Float => AnyValue::from(0.0f64),
                ValueKind::String => AnyValue::String(String::new()),
                ValueKind::Any => AnyValue::Null,
            }),
        };
        self.current = initial;
        if let Some(value) = self.current.clone() {
            self.notify(&value, true);
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.current.is_some()
    }

    fn get_value(&self, path: &str) -> Option<AnyValue> {
        let current = self.current.as_ref()?;
        value::lookup(current, path).cloned()
    }

    fn set_value(&mut self, path: &str, new_value: AnyValue) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if path.is_empty() {
            if let Some(kind) = self.declared_kind {
                if !kind.matches(&new_value) {
                    return false;
                }
            }
            *current = new_value;
        } else if !value::assign(current, path, new_value) {
            return false;
        }
        let snapshot = current.clone();
        self.notify(&snapshot, true);
        true
    }

    fn reset(&mut self) {
        self.current = None;
        self.notify(&AnyValue::Null, false);
    }

    fn set_notifier(&mut self, notifier: VariableNotifier) {
        self.notifier = Some(notifier);
    }
}

// ─── Variable registry ────────────────────────────────────────

pub type VariableConstructor = fn() -> Box<dyn Variable>;

/// Name → constructor registry for variable kinds. Concrete implementations
/// beyond `Local` (file, network, PVA) register here at startup.
pub struct VariableRegistry {
    constructors: HashMap<String, VariableConstructor>,
}

impl VariableRegistry {
    pub fn empty() -> Self {
        VariableRegistry {
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = VariableRegistry::empty();
        registry.register(LocalVariable::TYPE, LocalVariable::boxed);
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, constructor: VariableConstructor) -> bool {
        self.constructors
            .insert(type_name.into(), constructor)
            .is_none()
    }

    pub fn create(&self, type_name: &str) -> Option<Box<dyn Variable>> {
        self.constructors.get(type_name).map(|ctor| ctor())
    }

    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for VariableRegistry {
    fn default() -> Self {
        VariableRegistry::with_defaults()
    }
}
