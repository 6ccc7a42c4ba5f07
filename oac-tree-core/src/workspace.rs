use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::constants::TIMING_ACCURACY;
use crate::errors::EngineError;
use crate::value::{self, AnyValue};
use crate::variable::{Variable, VariableNotifier};

/// Opaque handle identifying the owner of a set of registered callbacks, so
/// they can be bulk-deregistered through a scoped guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type VariableCallback = Arc<dyn Fn(&AnyValue, bool) + Send + Sync>;
type GenericCallback = Arc<dyn Fn(&str, &AnyValue, bool) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    per_variable: Vec<(String, ListenerHandle, VariableCallback)>,
    generic: Vec<(ListenerHandle, GenericCallback)>,
}

/// Callback dispatch bus. The bus-wide mutex is held only during
/// registration and deregistration; dispatch runs on a snapshot so callbacks
/// never execute under the lock.
#[derive(Default)]
struct CallbackBus {
    inner: Mutex<BusInner>,
}

impl CallbackBus {
    fn notify(&self, name: &str, value: &AnyValue, connected: bool) {
        let (matching, generic) = {
            let inner = self.inner.lock().unwrap();
            let matching: Vec<VariableCallback> = inner
                .per_variable
                .iter()
                .filter(|(var, _, _)| var == name)
                .map(|(_, _, cb)| cb.clone())
                .collect();
            let generic: Vec<GenericCallback> =
                inner.generic.iter().map(|(_, cb)| cb.clone()).collect();
            (matching, generic)
        };
        for callback in matching {
            callback(value, connected);
        }
        for callback in generic {
            callback(name, value, connected);
        }
    }

    fn remove_listener(&self, listener: ListenerHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.per_variable.retain(|(_, l, _)| *l != listener);
        inner.generic.retain(|(l, _)| *l != listener);
    }
}

/// Removes every callback registered under its listener handle on drop.
///
/// Instructions hold one of these across an activation so no stale callbacks
/// survive a halt or reset.
pub struct CallbackGuard {
    bus: Arc<CallbackBus>,
    listener: ListenerHandle,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.bus.remove_listener(self.listener);
    }
}

struct VariableSlot {
    name: String,
    variable: Mutex<Box<dyn Variable>>,
}

/// Named, typed, observable value store a procedure reads and writes.
///
/// Variable names are unique; setup runs in registration order and teardown
/// in reverse. Value access goes through per-variable locks.
pub struct Workspace {
    slots: Vec<VariableSlot>,
    index: HashMap<String, usize>,
    bus: Arc<CallbackBus>,
    next_listener: AtomicU64,
}

impl Workspace {
    pub fn new() -> Self {
        Workspace {
            slots: Vec::new(),
            index: HashMap::new(),
            bus: Arc::new(CallbackBus::default()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Register a variable under a unique name. The workspace installs the
    /// notifier that feeds the callback bus before any setup runs.
    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        mut variable: Box<dyn Variable>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(EngineError::InvalidOperation(format!(
                "workspace already contains a variable named '{name}'"
            )));
        }
        let bus = self.bus.clone();
        let notify_name = name.clone();
        let notifier: VariableNotifier = Arc::new(move |value, connected| {
            bus.notify(&notify_name, value, connected);
        });
        variable.set_notifier(notifier);
        self.index.insert(name.clone(), self.slots.len());
        self.slots.push(VariableSlot {
            name,
            variable: Mutex::new(variable),
        });
        Ok(())
    }

    /// Set up all variables in registration order. Idempotent.
    pub fn setup(&self) -> Result<(), EngineError> {
        for slot in &self.slots {
            slot.variable.lock().unwrap().setup()?;
        }
        Ok(())
    }

    /// Tear down all variables in reverse registration order.
    pub fn teardown(&self) {
        for slot in self.slots.iter().rev() {
            slot.variable.lock().unwrap().reset();
        }
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn variable_count(&self) -> usize {
        self.slots.len()
    }

    pub fn variable_type(&self, name: &str) -> Option<String> {
        let slot = &self.slots[*self.index.get(name)?];
        Some(slot.variable.lock().unwrap().type_name().to_string())
    }

    /// Raw string attributes of a variable, for info snapshots.
    pub fn variable_attributes(&self, name: &str) -> Option<Vec<(String, String)>> {
        let slot = &self.slots[*self.index.get(name)?];
        Some(
            slot.variable
                .lock()
                .unwrap()
                .attributes()
                .string_attributes()
                .to_vec(),
        )
    }

    pub fn is_available(&self, name: &str) -> bool {
        match self.index.get(name) {
            Some(idx) => self.slots[*idx].variable.lock().unwrap().is_available(),
            None => false,
        }
    }

    /// Read `name[.path]`, returning a copy of the addressed value.
    pub fn get_value(&self, address: &str) -> Option<AnyValue> {
        let (name, path) = value::split_address(address);
        let slot = &self.slots[*self.index.get(name)?];
        let variable = slot.variable.lock().unwrap();
        variable.get_value(path)
    }

    /// Write `new_value` at `name[.path]`; observers are notified by the
    /// variable on success.
    pub fn set_value(&self, address: &str, new_value: AnyValue) -> bool {
        let (name, path) = value::split_address(address);
        let Some(idx) = self.index.get(name) else {
            return false;
        };
        let mut variable = self.slots[*idx].variable.lock().unwrap();
        variable.set_value(path, new_value)
    }

    /// Reset the named variable and set it up again from its attributes.
    pub fn reset_variable(&self, name: &str) -> bool {
        let Some(idx) = self.index.get(name) else {
            return false;
        };
        let mut variable = self.slots[*idx].variable.lock().unwrap();
        variable.reset();
        variable.setup().is_ok()
    }

    /// Block until `name` is connected with a valid value or the deadline
    /// elapses. Polls in short slices so the caller's halt flag stays
    /// responsive.
    pub async fn wait_for_variable(&self, name: &str, timeout: Duration, halt: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_available(name) && self.get_value(name).is_some() {
                return true;
            }
            if halt.load(Ordering::Relaxed) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(TIMING_ACCURACY)).await;
        }
    }

    pub fn new_listener(&self) -> ListenerHandle {
        ListenerHandle(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a per-variable callback `(value, connected)` under a listener.
    pub fn register_callback(
        &self,
        variable_name: impl Into<String>,
        callback: impl Fn(&AnyValue, bool) + Send + Sync + 'static,
        listener: ListenerHandle,
    ) {
        let mut inner = self.bus.inner.lock().unwrap();
        inner
            .per_variable
            .push((variable_name.into(), listener, Arc::new(callback)));
    }

    /// Register a callback `(name, value, connected)` for any variable change.
    pub fn register_generic_callback(
        &self,
        callback: impl Fn(&str, &AnyValue, bool) + Send + Sync + 'static,
        listener: ListenerHandle,
    ) {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.generic.push((listener, Arc::new(callback)));
    }

    /// Scoped guard removing every callback of `listener` on drop.
    pub fn callback_guard(&self, listener: ListenerHandle) -> CallbackGuard {
        CallbackGuard {
            bus: self.bus.clone(),
            listener,
        }
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Workspace::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::LocalVariable;
    use serde_json::json;

    fn local(attrs: &[(&str, &str)]) -> Box<dyn Variable> {
        let mut var = LocalVariable::new();
        for (name, value) in attrs {
            var.attributes_mut().add_string_attribute(*name, *value);
        }
        Box::new(var)
    }

    fn workspace_with_x() -> Workspace {
        let mut ws = Workspace::new();
        ws.add_variable("x", local(&[("type", "int32"), ("value", "7")]))
            .unwrap();
        ws.setup().unwrap();
        ws
    }

    #[test]
    fn names_are_unique() {
        let mut ws = Workspace::new();
        ws.add_variable("x", local(&[])).unwrap();
        assert!(ws.add_variable("x", local(&[])).is_err());
    }

    #[test]
    fn get_and_set_address_whole_and_fields() {
        let mut ws = Workspace::new();
        ws.add_variable("s", local(&[("value", r#"{"a":{"b":1}}"#)]))
            .unwrap();
        ws.setup().unwrap();
        assert_eq!(ws.get_value("s.a.b"), Some(json!(1)));
        assert!(ws.set_value("s.a.b", json!(5)));
        assert_eq!(ws.get_value("s.a.b"), Some(json!(5)));
        assert_eq!(ws.get_value("unknown"), None);
        assert!(!ws.set_value("unknown", json!(0)));
    }

    #[test]
    fn per_variable_callbacks_fire_on_change() {
        let ws = workspace_with_x();
        let seen: Arc<Mutex<Vec<AnyValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = ws.new_listener();
        ws.register_callback(
            "x",
            move |value, _connected| sink.lock().unwrap().push(value.clone()),
            listener,
        );
        let _guard = ws.callback_guard(listener);
        ws.set_value("x", json!(8));
        assert_eq!(*seen.lock().unwrap(), vec![json!(8)]);
    }

    #[test]
    fn generic_callbacks_see_all_variables() {
        let mut ws = Workspace::new();
        ws.add_variable("a", local(&[("type", "int32"), ("value", "0")]))
            .unwrap();
        ws.add_variable("b", local(&[("type", "int32"), ("value", "0")]))
            .unwrap();
        ws.setup().unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = ws.new_listener();
        ws.register_generic_callback(
            move |name, _value, _connected| sink.lock().unwrap().push(name.to_string()),
            listener,
        );
        ws.set_value("a", json!(1));
        ws.set_value("b", json!(2));
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dropping_the_guard_removes_callbacks() {
        let ws = workspace_with_x();
        let seen: Arc<Mutex<Vec<AnyValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = ws.new_listener();
        ws.register_callback(
            "x",
            move |value, _| sink.lock().unwrap().push(value.clone()),
            listener,
        );
        let guard = ws.callback_guard(listener);
        ws.set_value("x", json!(1));
        drop(guard);
        ws.set_value("x", json!(2));
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
    }

    #[test]
    fn reset_variable_reinitialises_from_attributes() {
        let ws = workspace_with_x();
        ws.set_value("x", json!(99));
        assert!(ws.reset_variable("x"));
        assert_eq!(ws.get_value("x"), Some(json!(7)));
        assert!(!ws.reset_variable("missing"));
    }

    #[tokio::test]
    async fn wait_for_variable_times_out_and_succeeds() {
        let ws = workspace_with_x();
        let halt = AtomicBool::new(false);
        assert!(
            ws.wait_for_variable("x", Duration::from_millis(50), &halt)
                .await
        );
        assert!(
            !ws.wait_for_variable("missing", Duration::from_millis(50), &halt)
                .await
        );
    }

    #[test]
    fn teardown_runs_in_reverse_order() {
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut ws = Workspace::new();
        for name in ["first", "second"] {
            ws.add_variable(name, local(&[("type", "int32"), ("value", "0")]))
                .unwrap();
        }
        ws.setup().unwrap();
        let sink = order.clone();
        let listener = ws.new_listener();
        ws.register_generic_callback(
            move |name, _value, connected| {
                if !connected {
                    sink.lock().unwrap().push(name.to_string());
                }
            },
            listener,
        );
        ws.teardown();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["second".to_string(), "first".to_string()]
        );
    }
}
