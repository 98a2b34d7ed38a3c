// ── Simulated backend ──
//
// In-memory systems and module instances that stand in for real hardware.
// Tests and demo mode build them explicitly; the mock transport answers
// control-channel commands against them.

mod transport;

pub use transport::{MockConnector, MockTransport};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use ctrlwire_api::ErrorCode;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Named variables of one module instance.
pub type Variables = Map<String, Value>;

/// A callable on a simulated module. Receives the instance's variables and
/// the call arguments; an `Err` becomes a `REQUEST_FAILED` response.
pub type MethodHandler = Arc<dyn Fn(&mut Variables, Vec<Value>) -> Result<Value, String> + Send + Sync>;

/// One variable mutation, as seen by bound subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub name: String,
    pub value: Value,
}

// ── Modules ─────────────────────────────────────────────────────────

pub struct SimulatedModule {
    class_name: String,
    variables: Mutex<Variables>,
    methods: HashMap<String, MethodHandler>,
    changes: broadcast::Sender<VariableChange>,
}

impl fmt::Debug for SimulatedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("SimulatedModule")
            .field("class_name", &self.class_name)
            .field("methods", &methods)
            .finish_non_exhaustive()
    }
}

impl SimulatedModule {
    pub fn builder(class_name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            class_name: class_name.into(),
            variables: Variables::new(),
            methods: HashMap::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Variables> {
        self.variables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of `name`, or `null` if never set.
    pub fn get(&self, name: &str) -> Value {
        self.lock().get(name).cloned().unwrap_or(Value::Null)
    }

    /// Set a variable and notify bound subscribers.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let mut variables = self.lock();
        variables.insert(name.clone(), value.clone());
        let _ = self.changes.send(VariableChange { name, value });
    }

    /// Invoke method `name`. Every variable the method changed is
    /// broadcast afterwards.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        let handler = self
            .methods
            .get(name)
            .ok_or_else(|| format!("{} has no method {name}", self.class_name))?;

        let mut variables = self.lock();
        let before = variables.clone();
        let result = handler(&mut *variables, args);
        for (key, value) in variables.iter() {
            if before.get(key) != Some(value) {
                let _ = self.changes.send(VariableChange {
                    name: key.clone(),
                    value: value.clone(),
                });
            }
        }
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VariableChange> {
        self.changes.subscribe()
    }
}

/// Builder for [`SimulatedModule`].
pub struct ModuleBuilder {
    class_name: String,
    variables: Variables,
    methods: HashMap<String, MethodHandler>,
}

impl ModuleBuilder {
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Variables, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<SimulatedModule> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(SimulatedModule {
            class_name: self.class_name,
            variables: Mutex::new(self.variables),
            methods: self.methods,
            changes,
        })
    }
}

// ── Systems ─────────────────────────────────────────────────────────

/// Module name → instances, addressed 1-based.
#[derive(Debug, Default)]
pub struct SimulatedSystem {
    modules: HashMap<String, Vec<Arc<SimulatedModule>>>,
}

impl SimulatedSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instance of `name`; returns its 1-based index.
    pub fn add_module(&mut self, name: impl Into<String>, module: Arc<SimulatedModule>) -> u32 {
        let instances = self.modules.entry(name.into()).or_default();
        instances.push(module);
        u32::try_from(instances.len()).unwrap_or(u32::MAX)
    }

    pub fn with_module(mut self, name: impl Into<String>, module: Arc<SimulatedModule>) -> Self {
        self.add_module(name, module);
        self
    }

    pub fn module(&self, name: &str, index: u32) -> Option<Arc<SimulatedModule>> {
        let slot = usize::try_from(index.checked_sub(1)?).ok()?;
        self.modules.get(name)?.get(slot).cloned()
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// Registry of simulated systems keyed by system id.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    systems: DashMap<String, Arc<SimulatedSystem>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, system_id: impl Into<String>, system: SimulatedSystem) {
        self.systems.insert(system_id.into(), Arc::new(system));
    }

    pub fn remove(&self, system_id: &str) -> bool {
        self.systems.remove(system_id).is_some()
    }

    pub fn system_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.systems.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Resolve a module instance the way a live server would.
    pub fn module(&self, system_id: &str, name: &str, index: u32) -> Result<Arc<SimulatedModule>, ErrorCode> {
        let system = self
            .systems
            .get(system_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ErrorCode::SystemNotFound)?;
        system.module(name, index).ok_or(ErrorCode::ModuleNotFound)
    }
}

/// A light with `power` and `level`, plus `power(bool)`, `toggle()` and
/// `level(n)` methods. Used by demo mode and tests.
pub fn demo_light() -> Arc<SimulatedModule> {
    SimulatedModule::builder("Lighting::Dimmer")
        .variable("power", Value::Bool(false))
        .variable("level", Value::from(0))
        .method("power", |vars, args| {
            let on = args.first().and_then(Value::as_bool).ok_or("power expects a boolean")?;
            vars.insert("power".into(), Value::Bool(on));
            Ok(Value::Bool(on))
        })
        .method("toggle", |vars, _| {
            let on = !vars.get("power").and_then(Value::as_bool).unwrap_or(false);
            vars.insert("power".into(), Value::Bool(on));
            Ok(Value::Bool(on))
        })
        .method("level", |vars, args| {
            let level = args
                .first()
                .and_then(Value::as_u64)
                .filter(|level| *level <= 100)
                .ok_or("level expects 0-100")?;
            vars.insert("level".into(), Value::from(level));
            Ok(Value::from(level))
        })
        .build()
}
