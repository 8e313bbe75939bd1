//! Bridge between a host application's object graph and embedded Lua scripts
//!
//! This crate owns the Lua runtime, marshals values and object handles in both
//! directions, stores script callbacks per event and dispatches host events to
//! them. Hosts describe what they expose through [`ScriptHost`].

use mlua::{Lua, Value};

pub mod binding;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod marshal;
pub mod object_store;
pub mod reload;
pub mod scanner;
pub mod timer;
pub mod types;

pub use mlua;

pub use binding::{BindingKey, BindingRegistry, BindingSnapshot, DefinitionCatalog, EventCategory};
pub use bridge::{Bindings, Bridge, BridgeStatus, DispatchOutcome, ReloadSnapshot, RunReport};
pub use config::BridgeConfig;
pub use discovery::{ScriptCollection, ScriptKind, ScriptUnit};
pub use error::{ArgumentError, BridgeError, RegistrationError, Result};
pub use marshal::{check, check_enum, check_native, check_object, check_opt, Check, Push, PushMulti, ScriptEnum};
pub use object_store::ObjectHandle;
pub use reload::{spawn_reload_signal, ReloadHandle};
pub use scanner::{ScanResult, ScriptScanner};
pub use timer::{TimedEventId, TimedEventManager};
pub use types::{NativeObject, ScriptObject, TypeDescriptor, TypeRegistry, TypeTag};

/// What a host application plugs into the bridge
///
/// `install` runs once per runtime, so it runs again after every reload. The
/// lifecycle hooks all default to doing nothing.
pub trait ScriptHost: DefinitionCatalog {
    /// Register types, methods, globals and event functions in a fresh runtime
    fn install(&self, bindings: &mut Bindings<'_>) -> mlua::Result<()>;

    /// Load a native extension unit (`.dll` / `.so`).
    ///
    /// The returned value is stored in the module cache under the unit name.
    fn load_native(&self, _lua: &Lua, unit: &ScriptUnit) -> mlua::Result<Value> {
        Err(mlua::Error::RuntimeError(format!(
            "native extension `{}` is not supported by this host",
            unit.path.display()
        )))
    }

    /// All scripts have run
    fn on_state_open(&self, _bridge: &Bridge) {}

    /// The runtime is about to be destroyed
    fn on_state_close(&self, _bridge: &Bridge) {}

    /// A reload is starting; the old runtime is still alive
    fn on_reload_started(&self) {}

    /// A reload finished and scripts have run again
    fn on_reload(&self, _bridge: &Bridge) {}
}
