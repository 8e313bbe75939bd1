//! The scripting bridge and its lifecycle
//!
//! A [`Bridge`] owns at most one Lua runtime at a time. It moves through
//! `Uninitialized -> Initialized -> (Reloading -> Initialized)* -> Uninitialized`;
//! initializing twice or tearing down a bridge that was never initialized is a
//! host bug and panics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, MultiValue, Table, Value};
use tracing::{debug, error, info, warn};

use crate::binding::{BindingKey, BindingRegistry, BindingSnapshot, Claim, EventCategory};
use crate::config::BridgeConfig;
use crate::discovery::{self, ScriptCollection, ScriptKind, ScriptUnit};
use crate::dispatch::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::marshal::{check, check_enum, check_opt, PushMulti};
use crate::object_store;
use crate::reload::ReloadHandle;
use crate::timer::{PortableTimer, TimedEventId, TimedEventManager};
use crate::types::{NativeObject, TypeDescriptor, TypeRegistry, TypeTag};
use crate::ScriptHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Uninitialized,
    Initialized,
    Reloading,
}

/// What happened while running the discovered scripts
#[derive(Debug, Default)]
pub struct RunReport {
    pub executed: usize,
    /// Units already present in the module cache
    pub skipped: usize,
    /// Failures that were logged, in load order
    pub errors: Vec<BridgeError>,
}

impl RunReport {
    pub fn conflicts(&self) -> impl Iterator<Item = &BridgeError> {
        self.errors
            .iter()
            .filter(|err| matches!(err, BridgeError::NameConflict { .. }))
    }

    pub fn load_failures(&self) -> impl Iterator<Item = &BridgeError> {
        self.errors
            .iter()
            .filter(|err| matches!(err, BridgeError::Load { .. }))
    }
}

/// Result of dispatching one event
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Callbacks that were called
    pub invoked: usize,
    /// Callbacks that raised or could not be called
    pub failed: usize,
    /// Return values of the successful calls, in call order
    pub results: Vec<MultiValue>,
}

/// Registrations and timed events carried from one runtime to the next
#[derive(Debug, Default)]
pub struct ReloadSnapshot {
    pub bindings: BindingSnapshot,
    pub timers: Vec<PortableTimer>,
}

/// Context handed to [`ScriptHost::install`] while a runtime is built
pub struct Bindings<'a> {
    lua: &'a Lua,
    registry: &'a Arc<BindingRegistry>,
    host: &'a Rc<dyn ScriptHost>,
}

impl<'a> Bindings<'a> {
    pub fn lua(&self) -> &'a Lua {
        self.lua
    }

    /// Make a native type known to scripts
    pub fn register_type(&mut self, descriptor: &'static TypeDescriptor) -> TypeTag {
        match self.lua.app_data_mut::<TypeRegistry>() {
            Some(mut types) => types.register(descriptor),
            None => TypeTag::of(descriptor),
        }
    }

    /// Attach a method to handles of `tag` and of every subtype
    pub fn add_method<A, R, F>(&mut self, tag: TypeTag, name: &str, func: F) -> mlua::Result<()>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + 'static,
    {
        let func = self.lua.create_function(func)?;
        object_store::add_method(self.lua, tag, name, func)
    }

    /// Define a global function
    pub fn set_function<A, R, F>(&mut self, name: &str, func: F) -> mlua::Result<()>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + 'static,
    {
        let func = self.lua.create_function(func)?;
        self.lua.globals().set(name, func)
    }

    /// Expose a global `name` that lets scripts bind callbacks to `E`.
    ///
    /// Global categories take `(event, fn[, shots])`, entry-keyed ones
    /// `(entry, event, fn[, shots])`. The function returns whether the binding
    /// was stored.
    pub fn expose_events<E: EventCategory>(&mut self, name: &str) -> mlua::Result<()> {
        let registry = Arc::clone(self.registry);
        let host = Rc::clone(self.host);

        let func = self.lua.create_function(move |lua, args: MultiValue| {
            let args = args.into_vec();
            let mut narg = 1;
            let entry = match E::DEFINITION {
                Some(_) => {
                    narg += 1;
                    Some(check::<u32>(lua, &args, 1)?)
                }
                None => None,
            };
            let nil = Value::Nil;
            let event = check_enum::<E>(lua, args.get(narg - 1).unwrap_or(&nil), narg)?;
            let func = check::<Function>(lua, &args, narg + 1)?;
            let shots = check_opt::<u32>(lua, &args, narg + 2, 0)?;

            Ok(registry
                .register(lua, &*host, entry, event, func, shots)
                .is_ok())
        })?;

        self.lua.globals().set(name, func)
    }
}

struct Runtime {
    lua: Lua,
    bindings: Arc<BindingRegistry>,
    timers: Rc<RefCell<TimedEventManager>>,
}

impl Runtime {
    fn create(host: &Rc<dyn ScriptHost>, search_path: &str, reload: &ReloadHandle) -> Result<Self> {
        // SAFETY: opens the complete standard library, `debug` and C module
        // loading included. Script trees are trusted host content, and binary
        // chunks are needed to carry callbacks across a reload.
        let lua = unsafe { Lua::unsafe_new() };
        lua.set_app_data(TypeRegistry::new());
        object_store::create(&lua)?;

        let bindings = Arc::new(BindingRegistry::new());
        let timers = Rc::new(RefCell::new(TimedEventManager::new()));
        install_timed_events(&lua, &timers)?;
        install_reload_request(&lua, reload)?;

        host.install(&mut Bindings {
            lua: &lua,
            registry: &bindings,
            host,
        })?;

        apply_search_path(&lua, search_path)?;

        Ok(Self {
            lua,
            bindings,
            timers,
        })
    }

    fn teardown(self) {
        let Runtime {
            lua,
            bindings,
            timers,
        } = self;

        match object_store::invalidate_all(&lua) {
            Ok(count) => debug!(target: "scripting", "Invalidated {} object handles", count),
            Err(e) => error!(target: "scripting", "Failed to invalidate object handles: {}", e),
        }
        timers.borrow_mut().clear();
        drop(timers);
        drop(bindings);
        drop(lua);
    }
}

fn install_timed_events(lua: &Lua, timers: &Rc<RefCell<TimedEventManager>>) -> mlua::Result<()> {
    let globals = lua.globals();

    let manager = Rc::clone(timers);
    let create = lua.create_function(move |lua, args: MultiValue| {
        let args = args.into_vec();
        let func = check::<Function>(lua, &args, 1)?;
        let delay = check::<u32>(lua, &args, 2)?;
        let repeats = check::<u32>(lua, &args, 3)?;
        let callback = lua.create_registry_value(func)?;
        let id = manager
            .borrow_mut()
            .schedule(callback, Duration::from_millis(delay.into()), repeats);
        Ok(id)
    })?;
    globals.set("CreateLuaEvent", create)?;

    let manager = Rc::clone(timers);
    let remove = lua.create_function(move |lua, args: MultiValue| {
        let id: TimedEventId = check(lua, &args.into_vec(), 1)?;
        Ok(manager.borrow_mut().cancel(id))
    })?;
    globals.set("RemoveEventById", remove)?;

    let manager = Rc::clone(timers);
    let clear = lua.create_function(move |_, ()| Ok(manager.borrow_mut().clear()))?;
    globals.set("RemoveEvents", clear)
}

fn install_reload_request(lua: &Lua, reload: &ReloadHandle) -> mlua::Result<()> {
    let reload = reload.clone();
    let request = lua.create_function(move |_, ()| {
        info!(target: "scripting", "Script requested a reload");
        reload.request();
        Ok(())
    })?;
    lua.globals().set("ReloadScripts", request)
}

fn apply_search_path(lua: &Lua, search_path: &str) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    package.set("path", search_path)?;
    package.set("cpath", "")
}

pub struct Bridge {
    config: BridgeConfig,
    host: Rc<dyn ScriptHost>,
    runtime: Option<Runtime>,
    reloading: bool,
    scripts: ScriptCollection,
    search_path: String,
    dispatcher: Dispatcher,
    reload: ReloadHandle,
}

impl Bridge {
    pub fn new(config: BridgeConfig, host: Rc<dyn ScriptHost>) -> Self {
        Self {
            config,
            host,
            runtime: None,
            reloading: false,
            scripts: ScriptCollection::default(),
            search_path: String::new(),
            dispatcher: Dispatcher::new(),
            reload: ReloadHandle::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn status(&self) -> BridgeStatus {
        if self.reloading {
            BridgeStatus::Reloading
        } else if self.runtime.is_some() {
            BridgeStatus::Initialized
        } else {
            BridgeStatus::Uninitialized
        }
    }

    /// The live runtime, if initialized
    pub fn lua(&self) -> Option<&Lua> {
        self.runtime.as_ref().map(|runtime| &runtime.lua)
    }

    pub fn scripts(&self) -> &ScriptCollection {
        &self.scripts
    }

    /// The module search path installed in the current runtime
    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    /// Callback nesting depth; nonzero while a script callback is running
    pub fn depth(&self) -> u32 {
        self.dispatcher.depth()
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(BridgeError::NotInitialized)
    }

    /// Discover scripts and build a fresh runtime.
    ///
    /// # Panics
    ///
    /// If the bridge is already initialized.
    pub fn initialize(&mut self) -> Result<()> {
        assert!(
            self.runtime.is_none(),
            "scripting bridge is already initialized"
        );
        let started = Instant::now();

        self.scripts.clear();
        let root = self.config.script_root();
        info!(target: "scripting", "Searching scripts from `{}`", root.display());

        let discovered = discovery::discover(&root);
        self.scripts = discovered.scripts;
        self.search_path = discovered.search_path;

        self.runtime = Some(Runtime::create(
            &self.host,
            &self.search_path,
            &self.reload,
        )?);

        debug!(
            target: "scripting",
            "Found {} scripts in {} ms",
            self.scripts.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Execute every discovered unit: extensions first, each group by path.
    ///
    /// Failures are logged and collected; one broken script never stops the
    /// rest from loading.
    pub fn run_scripts(&self) -> Result<RunReport> {
        let runtime = self.runtime()?;
        let lua = &runtime.lua;
        let started = Instant::now();

        let loaded: Table = lua.globals().get::<Table>("package")?.get("loaded")?;
        let mut accepted: HashMap<&str, &Path> = HashMap::new();
        let mut report = RunReport::default();

        for unit in self.scripts.load_order() {
            if let Some(existing) = accepted.get(unit.name.as_str()) {
                let err = BridgeError::NameConflict {
                    name: unit.name.clone(),
                    path: unit.path.clone(),
                    existing: existing.to_path_buf(),
                };
                error!(target: "scripting", "{}", err);
                report.errors.push(err);
                continue;
            }
            accepted.insert(&unit.name, &unit.path);

            if !loaded.get::<Value>(unit.name.as_str())?.is_nil() {
                debug!(target: "scripting", "`{}` was already loaded or required", unit.path.display());
                report.skipped += 1;
                continue;
            }

            match self.execute_unit(lua, unit) {
                Ok(result) => {
                    let result = match result {
                        Value::Nil | Value::Boolean(false) => Value::Boolean(true),
                        other => other,
                    };
                    loaded.set(unit.name.as_str(), result)?;
                    debug!(target: "scripting", "Loaded script `{}`", unit.path.display());
                    report.executed += 1;
                }
                Err(source) => {
                    let err = BridgeError::Load {
                        path: unit.path.clone(),
                        source,
                    };
                    error!(target: "scripting", "{}", err);
                    report.errors.push(err);
                }
            }
        }

        let bindings = runtime.bindings.retire_replaced(lua);
        let timers = runtime.timers.borrow_mut().retire_replaced(lua);
        if bindings + timers > 0 {
            debug!(
                target: "scripting",
                "Scripts registered {} carried bindings and {} carried timed events again",
                bindings,
                timers
            );
        }

        info!(
            target: "scripting",
            "Executed {} Lua scripts in {} ms",
            report.executed,
            started.elapsed().as_millis()
        );

        self.host.on_state_open(self);
        Ok(report)
    }

    fn execute_unit(&self, lua: &Lua, unit: &ScriptUnit) -> mlua::Result<Value> {
        match unit.kind {
            ScriptKind::Native => self.host.load_native(lua, unit),
            ScriptKind::Lua | ScriptKind::Extension => {
                let source = std::fs::read(&unit.path).map_err(mlua::Error::external)?;
                lua.load(source)
                    .set_name(format!("@{}", unit.path.display()))
                    .call::<Value>(())
            }
        }
    }

    /// Invalidate all handles and destroy the runtime.
    ///
    /// # Panics
    ///
    /// If the bridge is not initialized.
    pub fn uninitialize(&mut self) {
        assert!(self.runtime.is_some(), "scripting bridge is not initialized");
        self.host.on_state_close(self);

        if let Some(runtime) = self.runtime.take() {
            runtime.teardown();
        }
        self.scripts.clear();
    }

    /// Capture registrations and timed events from the live runtime
    pub fn snapshot(&self) -> Result<ReloadSnapshot> {
        let runtime = self.runtime()?;
        Ok(ReloadSnapshot {
            bindings: runtime.bindings.snapshot(&runtime.lua),
            timers: runtime.timers.borrow().snapshot(&runtime.lua),
        })
    }

    fn restore(&self, snapshot: ReloadSnapshot) -> Result<()> {
        let runtime = self.runtime()?;
        let dropped = snapshot.bindings.dropped();
        let bindings = runtime.bindings.merge(&runtime.lua, snapshot.bindings);
        let timers = runtime
            .timers
            .borrow_mut()
            .restore(&runtime.lua, snapshot.timers);
        debug!(
            target: "scripting",
            "Restored {} bindings and {} timed events ({} bindings dropped)",
            bindings,
            timers,
            dropped
        );
        Ok(())
    }

    /// Rebuild the runtime from the script tree, keeping script registrations.
    ///
    /// The bridge ends up initialized whatever individual scripts do; only a
    /// failure to build the runtime itself is returned as an error.
    pub fn reload(&mut self) -> Result<RunReport> {
        let snapshot = self.snapshot()?;
        info!(target: "scripting", "Reloading scripts");
        self.host.on_reload_started();

        self.reloading = true;
        let report = self.rebuild(snapshot);
        self.reloading = false;

        let report = report?;
        self.host.on_reload(self);
        Ok(report)
    }

    fn rebuild(&mut self, snapshot: ReloadSnapshot) -> Result<RunReport> {
        self.uninitialize();
        self.initialize()?;
        self.restore(snapshot)?;
        self.run_scripts()
    }

    /// Ask for a reload at the next [`Bridge::process_pending_reload`]
    pub fn request_reload(&self) {
        self.reload.request();
    }

    /// A handle that signal handlers or watchers can use to request a reload
    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Reload if one was requested and no callback is running
    pub fn process_pending_reload(&mut self) -> Option<Result<RunReport>> {
        if self.dispatcher.depth() > 0 || !self.reload.is_requested() {
            return None;
        }
        self.reload.take();
        Some(self.reload())
    }

    /// Bind `func` to `event` (and `entry` for entry-keyed categories).
    ///
    /// `shots` limits how many times the callback fires; 0 is unlimited.
    pub fn register<E: EventCategory>(
        &self,
        entry: Option<u32>,
        event: E,
        func: Function,
        shots: u32,
    ) -> Result<u64> {
        let runtime = self.runtime()?;
        runtime
            .bindings
            .register(&runtime.lua, &*self.host, entry, event, func, shots)
    }

    /// Remove bindings of `E`, narrowed by `entry` and `event` when given
    pub fn clear<E: EventCategory>(&self, entry: Option<u32>, event: Option<E>) -> usize {
        let Some(runtime) = self.runtime.as_ref() else {
            return 0;
        };
        let entry = E::DEFINITION.and(entry);
        let removed = runtime
            .bindings
            .clear(E::CATEGORY, entry, event.map(Into::into));
        runtime.lua.expire_registry_values();
        removed
    }

    pub fn has_bindings<E: EventCategory>(&self, entry: Option<u32>, event: E) -> bool {
        self.runtime.as_ref().is_some_and(|runtime| {
            runtime
                .bindings
                .has_bindings(E::CATEGORY, BindingKey::new(entry, event))
        })
    }

    /// Number of stored bindings across all categories
    pub fn binding_count(&self) -> usize {
        self.runtime
            .as_ref()
            .map_or(0, |runtime| runtime.bindings.len())
    }

    /// Call every live callback bound to `event`.
    ///
    /// `args` builds the arguments afresh for each callback. Limited callbacks
    /// spend a shot per call and are removed once they run out.
    pub fn dispatch<E, A>(&self, entry: Option<u32>, event: E, args: A) -> DispatchOutcome
    where
        E: EventCategory,
        A: Fn(&Lua) -> mlua::Result<MultiValue>,
    {
        let mut outcome = DispatchOutcome::default();
        let Some(runtime) = self.runtime.as_ref() else {
            return outcome;
        };

        let key = BindingKey::new(entry, event);
        let mut retired = Vec::new();

        for binding in runtime.bindings.lookup(E::CATEGORY, key) {
            match binding.claim() {
                Claim::Spent => continue,
                Claim::FireAndRetire => retired.push(binding.id()),
                Claim::Fire => {}
            }

            let args = match args(&runtime.lua) {
                Ok(args) => args,
                Err(e) => {
                    error!(target: "scripting", "Failed to push {} arguments: {}", E::CATEGORY, e);
                    outcome.failed += 1;
                    continue;
                }
            };

            outcome.invoked += 1;
            match self
                .dispatcher
                .execute(&runtime.lua, binding.callback(), args, None)
            {
                Ok(results) => outcome.results.push(results),
                Err(_) => outcome.failed += 1,
            }
        }

        if !retired.is_empty() {
            runtime.bindings.retire(E::CATEGORY, key, &retired);
            runtime.lua.expire_registry_values();
        }
        outcome
    }

    /// Convenience over [`Bridge::dispatch`] for arguments that can be pushed as a tuple
    pub fn dispatch_with<E, T>(&self, entry: Option<u32>, event: E, args: T) -> DispatchOutcome
    where
        E: EventCategory,
        T: PushMulti + Clone,
    {
        self.dispatch(entry, event, |lua| args.clone().push_multi(lua))
    }

    /// Advance timed events by `diff` and run the ones that came due.
    ///
    /// Returns the number of events fired. An event cancelled by a callback
    /// that ran earlier in the same update is skipped.
    pub fn update(&self, diff: Duration) -> usize {
        let Some(runtime) = self.runtime.as_ref() else {
            return 0;
        };

        let due = runtime.timers.borrow_mut().tick(diff);
        let mut fired = 0;
        for event in &due {
            if !runtime.timers.borrow_mut().take_due(event.id) {
                debug!(target: "scripting", "Timed event {} was cancelled before it ran", event.id);
                continue;
            }
            fired += 1;
            let args = match (event.id, event.delay_ms, event.remaining).push_multi(&runtime.lua) {
                Ok(args) => args,
                Err(e) => {
                    warn!(target: "scripting", "Failed to push timed event {} arguments: {}", event.id, e);
                    continue;
                }
            };
            let _ = self
                .dispatcher
                .execute(&runtime.lua, &event.callback, args, Some(0));
        }

        if !due.is_empty() {
            runtime.lua.expire_registry_values();
        }
        fired
    }

    /// Pending timed events
    pub fn timed_event_count(&self) -> usize {
        self.runtime
            .as_ref()
            .map_or(0, |runtime| runtime.timers.borrow().active_count())
    }

    /// Invalidate the handles of a native object that is going away
    pub fn invalidate_object(&self, object: &dyn NativeObject) -> usize {
        let Some(runtime) = self.runtime.as_ref() else {
            return 0;
        };
        object_store::invalidate_object(&runtime.lua, object).unwrap_or_else(|e| {
            error!(target: "scripting", "Failed to invalidate object handles: {}", e);
            0
        })
    }

    pub fn script_root(&self) -> PathBuf {
        self.config.script_root()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.teardown();
        }
    }
}
