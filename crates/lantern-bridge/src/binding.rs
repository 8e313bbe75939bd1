//! Event bindings registered by scripts
//!
//! Bindings are grouped per event category, then by `(entry, event)` key. Each
//! key holds its callbacks in registration order. Lookups take the read lock
//! and hand out shared entries so callbacks can register or clear bindings
//! while a dispatch is in progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{ChunkMode, Function, Lua, RegistryKey, Table, Value};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, RegistrationError, Result};
use crate::marshal::ScriptEnum;

/// An enumeration of events scripts can bind to
pub trait EventCategory: ScriptEnum {
    /// Category name used in logs and as the registry key
    const CATEGORY: &'static str;

    /// Definition kind entry ids are validated against.
    ///
    /// `None` marks a global category whose bindings ignore the entry id.
    const DEFINITION: Option<&'static str> = None;
}

/// The host's catalog of definitions that entry-keyed bindings refer to
pub trait DefinitionCatalog {
    fn has_definition(&self, kind: &'static str, id: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub entry: Option<u32>,
    pub event: i32,
}

impl BindingKey {
    /// Key for `event`; the entry id is dropped for global categories
    pub fn new<E: EventCategory>(entry: Option<u32>, event: E) -> Self {
        Self {
            entry: E::DEFINITION.and(entry),
            event: event.into(),
        }
    }
}

pub(crate) enum Claim {
    Fire,
    FireAndRetire,
    Spent,
}

/// One registered callback
#[derive(Debug)]
pub struct CallbackEntry {
    id: u64,
    callback: RegistryKey,
    shots: u32,
    remaining: AtomicU32,
    /// Chunk this callback was restored from, for entries carried over a reload
    carried: Option<Vec<u8>>,
}

impl CallbackEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn callback(&self) -> &RegistryKey {
        &self.callback
    }

    /// Shots granted at registration, 0 for unlimited
    pub fn shots(&self) -> u32 {
        self.shots
    }

    /// Shots left, 0 for unlimited
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    fn is_spent(&self) -> bool {
        self.shots != 0 && self.remaining() == 0
    }

    pub fn is_carried(&self) -> bool {
        self.carried.is_some()
    }

    /// Take one shot before invoking.
    ///
    /// Claiming up front keeps a callback that re-triggers its own event from
    /// firing more often than its shot count allows.
    pub(crate) fn claim(&self) -> Claim {
        if self.shots == 0 {
            return Claim::Fire;
        }
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => Claim::FireAndRetire,
            Ok(_) => Claim::Fire,
            Err(_) => Claim::Spent,
        }
    }
}

/// A callback carried across a runtime rebuild as a compiled chunk
#[derive(Debug, Clone)]
pub struct PortableCallback {
    pub category: &'static str,
    pub key: BindingKey,
    pub chunk: Vec<u8>,
    pub shots: u32,
    pub remaining: u32,
}

/// Registry contents captured before a reload
#[derive(Debug, Default)]
pub struct BindingSnapshot {
    callbacks: Vec<PortableCallback>,
    dropped: usize,
}

impl BindingSnapshot {
    pub fn callbacks(&self) -> &[PortableCallback] {
        &self.callbacks
    }

    /// Callbacks that could not be captured
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

type BindingTable = HashMap<BindingKey, Vec<Arc<CallbackEntry>>>;

#[derive(Debug, Default)]
pub struct BindingRegistry {
    tables: RwLock<HashMap<&'static str, BindingTable>>,
    next_id: AtomicU64,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store `func` for `event`.
    ///
    /// Entry-keyed categories reject ids the catalog does not know; the
    /// failure is logged and nothing is stored.
    pub fn register<E, C>(
        &self,
        lua: &Lua,
        catalog: &C,
        entry: Option<u32>,
        event: E,
        func: Function,
        shots: u32,
    ) -> Result<u64>
    where
        E: EventCategory,
        C: DefinitionCatalog + ?Sized,
    {
        let key = BindingKey::new(entry, event);

        if let Some(kind) = E::DEFINITION {
            let source = match key.entry {
                None => Some(RegistrationError::MissingEntry {
                    category: E::CATEGORY,
                }),
                Some(id) if !catalog.has_definition(kind, id) => {
                    Some(RegistrationError::UnknownDefinition { kind, id })
                }
                Some(_) => None,
            };
            if let Some(source) = source {
                let err = BridgeError::Registration {
                    category: E::CATEGORY,
                    source,
                };
                error!(target: "scripting", "{}", err);
                return Err(err);
            }
        }

        let callback = lua.create_registry_value(func)?;
        let id = self.insert(E::CATEGORY, key, callback, shots);
        debug!(
            target: "scripting",
            "Registered {} binding {} for event {} (entry: {:?}, shots: {})",
            E::CATEGORY,
            id,
            key.event,
            key.entry,
            shots
        );
        Ok(id)
    }

    /// Append a callback under `key`; returns its id
    pub fn insert(
        &self,
        category: &'static str,
        key: BindingKey,
        callback: RegistryKey,
        shots: u32,
    ) -> u64 {
        self.insert_entry(category, key, callback, shots, shots, None)
    }

    fn insert_entry(
        &self,
        category: &'static str,
        key: BindingKey,
        callback: RegistryKey,
        shots: u32,
        remaining: u32,
        carried: Option<Vec<u8>>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(CallbackEntry {
            id,
            callback,
            shots,
            remaining: AtomicU32::new(remaining),
            carried,
        });
        self.tables
            .write()
            .entry(category)
            .or_default()
            .entry(key)
            .or_default()
            .push(entry);
        id
    }

    /// Live callbacks for `key`, in registration order
    pub fn lookup(&self, category: &'static str, key: BindingKey) -> Vec<Arc<CallbackEntry>> {
        let tables = self.tables.read();
        tables
            .get(category)
            .and_then(|table| table.get(&key))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| !entry.is_spent())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_bindings(&self, category: &'static str, key: BindingKey) -> bool {
        let tables = self.tables.read();
        tables
            .get(category)
            .and_then(|table| table.get(&key))
            .is_some_and(|entries| entries.iter().any(|entry| !entry.is_spent()))
    }

    /// Remove the given callbacks from `key`; returns how many were removed
    pub fn retire(&self, category: &'static str, key: BindingKey, ids: &[u64]) -> usize {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(category) else {
            return 0;
        };
        let Some(entries) = table.get_mut(&key) else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|entry| !ids.contains(&entry.id));
        let removed = before - entries.len();
        if entries.is_empty() {
            table.remove(&key);
        }
        removed
    }

    /// Drop callbacks matching `entry` and `event`; `None` matches anything.
    ///
    /// Returns how many callbacks were removed.
    pub fn clear(&self, category: &'static str, entry: Option<u32>, event: Option<i32>) -> usize {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(category) else {
            return 0;
        };

        let mut removed = 0;
        table.retain(|key, entries| {
            let matches = entry.map_or(true, |id| key.entry == Some(id))
                && event.map_or(true, |event| key.event == event);
            if matches {
                removed += entries.len();
            }
            !matches
        });
        removed
    }

    /// Number of stored callbacks across all categories
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .values()
            .flat_map(|table| table.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture every live callback as a compiled chunk.
    ///
    /// Only script functions survive: native functions have no bytecode and
    /// are dropped with a warning. Upvalues are not carried over.
    pub fn snapshot(&self, lua: &Lua) -> BindingSnapshot {
        let tables = self.tables.read();
        let mut snapshot = BindingSnapshot::default();
        let mut captured = Vec::new();

        for (&category, table) in tables.iter() {
            for (key, entries) in table {
                for entry in entries.iter().filter(|entry| !entry.is_spent()) {
                    let chunk = match lua.registry_value::<Function>(&entry.callback) {
                        Ok(func) => func.dump(false),
                        Err(e) => {
                            warn!(target: "scripting", "Dropping {} binding {}: {}", category, entry.id, e);
                            snapshot.dropped += 1;
                            continue;
                        }
                    };
                    if chunk.is_empty() {
                        warn!(
                            target: "scripting",
                            "Dropping {} binding {}: native functions cannot be carried across a reload",
                            category,
                            entry.id
                        );
                        snapshot.dropped += 1;
                        continue;
                    }
                    captured.push((
                        entry.id,
                        PortableCallback {
                            category,
                            key: *key,
                            chunk,
                            shots: entry.shots,
                            remaining: entry.remaining(),
                        },
                    ));
                }
            }
        }

        captured.sort_by_key(|(id, _)| *id);
        snapshot.callbacks = captured.into_iter().map(|(_, callback)| callback).collect();
        snapshot
    }

    /// Load a snapshot into this registry, keeping the captured shot counts.
    ///
    /// Returns the number of callbacks restored.
    pub fn merge(&self, lua: &Lua, snapshot: BindingSnapshot) -> usize {
        let mut restored = 0;
        for callback in snapshot.callbacks {
            let func = load_portable(lua, callback.chunk.clone(), callback.category);
            let key = match func.and_then(|func| lua.create_registry_value(func)) {
                Ok(key) => key,
                Err(e) => {
                    warn!(target: "scripting", "Failed to restore {} binding: {}", callback.category, e);
                    continue;
                }
            };
            self.insert_entry(
                callback.category,
                callback.key,
                key,
                callback.shots,
                callback.remaining,
                Some(callback.chunk),
            );
            restored += 1;
        }
        restored
    }

    /// Drop carried callbacks that the scripts registered again.
    ///
    /// A fresh callback replaces a carried one when both sit under the same key
    /// and dump to the same chunk. The fresh callback inherits the carried
    /// shot count when both were registered with the same shots. Returns how
    /// many carried callbacks were dropped.
    pub fn retire_replaced(&self, lua: &Lua) -> usize {
        let mut tables = self.tables.write();
        let mut retired = 0;

        for (&category, table) in tables.iter_mut() {
            for entries in table.values_mut() {
                if !entries.iter().any(|entry| entry.is_carried()) {
                    continue;
                }

                let mut fresh: Vec<(&Arc<CallbackEntry>, Vec<u8>)> = entries
                    .iter()
                    .filter(|entry| !entry.is_carried())
                    .filter_map(|entry| {
                        let func = lua.registry_value::<Function>(&entry.callback).ok()?;
                        Some((entry, func.dump(false)))
                    })
                    .collect();

                let mut replaced = Vec::new();
                for entry in entries.iter() {
                    let Some(chunk) = &entry.carried else {
                        continue;
                    };
                    let Some(pos) = fresh.iter().position(|(_, dumped)| dumped == chunk) else {
                        continue;
                    };
                    let (successor, _) = fresh.swap_remove(pos);
                    if successor.shots == entry.shots {
                        successor
                            .remaining
                            .store(entry.remaining(), Ordering::Release);
                    }
                    replaced.push(entry.id);
                }

                entries.retain(|entry| !replaced.contains(&entry.id));
                retired += replaced.len();
                if !replaced.is_empty() {
                    debug!(target: "scripting", "Replaced {} carried {} bindings", replaced.len(), category);
                }
            }
            table.retain(|_, entries| !entries.is_empty());
        }
        retired
    }
}

/// Load a dumped script function into `lua`.
///
/// The binary loader stores the globals table in the first upvalue whatever
/// its name. `_ENV` is pointed at the new globals and every other upvalue
/// starts out nil.
pub(crate) fn load_portable(lua: &Lua, chunk: Vec<u8>, name: &str) -> mlua::Result<Function> {
    let func = lua
        .load(chunk)
        .set_name(format!("={}", name))
        .set_mode(ChunkMode::Binary)
        .into_function()?;

    let debug: Table = lua.globals().get("debug")?;
    let getupvalue: Function = debug.get("getupvalue")?;
    let setupvalue: Function = debug.get("setupvalue")?;

    let mut index = 1;
    loop {
        let (upvalue, _): (Option<String>, Value) = getupvalue.call((func.clone(), index))?;
        let Some(upvalue) = upvalue else {
            break;
        };
        let value = if upvalue == "_ENV" {
            Value::Table(lua.globals())
        } else {
            Value::Nil
        };
        setupvalue.call::<()>((func.clone(), index, value))?;
        index += 1;
    }
    Ok(func)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ServerEvent {
        Startup = 1,
        Shutdown = 2,
    }

    impl TryFrom<i32> for ServerEvent {
        type Error = ();

        fn try_from(value: i32) -> std::result::Result<Self, ()> {
            match value {
                1 => Ok(ServerEvent::Startup),
                2 => Ok(ServerEvent::Shutdown),
                _ => Err(()),
            }
        }
    }

    impl From<ServerEvent> for i32 {
        fn from(value: ServerEvent) -> Self {
            value as i32
        }
    }

    impl ScriptEnum for ServerEvent {
        const NAME: &'static str = "ServerEvent";
        const FIRST: i32 = 1;
        const COUNT: i32 = 3;
    }

    impl EventCategory for ServerEvent {
        const CATEGORY: &'static str = "ServerEvents";
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CreatureEvent {
        Spawn = 1,
    }

    impl TryFrom<i32> for CreatureEvent {
        type Error = ();

        fn try_from(value: i32) -> std::result::Result<Self, ()> {
            match value {
                1 => Ok(CreatureEvent::Spawn),
                _ => Err(()),
            }
        }
    }

    impl From<CreatureEvent> for i32 {
        fn from(value: CreatureEvent) -> Self {
            value as i32
        }
    }

    impl ScriptEnum for CreatureEvent {
        const NAME: &'static str = "CreatureEvent";
        const FIRST: i32 = 1;
        const COUNT: i32 = 2;
    }

    impl EventCategory for CreatureEvent {
        const CATEGORY: &'static str = "CreatureEvents";
        const DEFINITION: Option<&'static str> = Some("creature");
    }

    struct Catalog(Vec<u32>);

    impl DefinitionCatalog for Catalog {
        fn has_definition(&self, kind: &'static str, id: u32) -> bool {
            kind == "creature" && self.0.contains(&id)
        }
    }

    fn script_fn(lua: &Lua) -> Function {
        lua.load("return function() end").eval().unwrap()
    }

    #[test]
    fn test_global_category_ignores_entry() {
        assert_eq!(
            BindingKey::new(Some(5), ServerEvent::Startup),
            BindingKey::new(None, ServerEvent::Startup)
        );
        assert_ne!(
            BindingKey::new(Some(5), CreatureEvent::Spawn),
            BindingKey::new(Some(6), CreatureEvent::Spawn)
        );
    }

    #[test]
    fn test_registration_order_and_no_dedup() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![]);
        let func = script_fn(&lua);

        let first = registry
            .register(&lua, &catalog, None, ServerEvent::Startup, func.clone(), 0)
            .unwrap();
        let second = registry
            .register(&lua, &catalog, None, ServerEvent::Startup, func, 0)
            .unwrap();

        let found = registry.lookup("ServerEvents", BindingKey::new(None, ServerEvent::Startup));
        let ids: Vec<u64> = found.iter().map(|entry| entry.id()).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(registry
            .lookup("ServerEvents", BindingKey::new(None, ServerEvent::Shutdown))
            .is_empty());
    }

    #[test]
    fn test_unknown_definition_rejected() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![100]);

        let err = registry
            .register(&lua, &catalog, Some(42), CreatureEvent::Spawn, script_fn(&lua), 0)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "CreatureEvents: couldn't find a creature with (ID: 42)"
        );
        assert!(!registry.has_bindings("CreatureEvents", BindingKey::new(Some(42), CreatureEvent::Spawn)));
        assert!(registry.is_empty());

        registry
            .register(&lua, &catalog, Some(100), CreatureEvent::Spawn, script_fn(&lua), 0)
            .unwrap();
        assert!(registry.has_bindings("CreatureEvents", BindingKey::new(Some(100), CreatureEvent::Spawn)));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        let result = registry.register(
            &lua,
            &Catalog(vec![1]),
            None,
            CreatureEvent::Spawn,
            script_fn(&lua),
            0,
        );
        assert!(matches!(
            result,
            Err(BridgeError::Registration {
                source: RegistrationError::MissingEntry { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_claim_counts_down() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        registry
            .register(&lua, &Catalog(vec![]), None, ServerEvent::Startup, script_fn(&lua), 2)
            .unwrap();
        let key = BindingKey::new(None, ServerEvent::Startup);

        let entry = registry.lookup("ServerEvents", key).remove(0);
        assert!(matches!(entry.claim(), Claim::Fire));
        assert!(matches!(entry.claim(), Claim::FireAndRetire));
        assert!(matches!(entry.claim(), Claim::Spent));
        assert!(registry.lookup("ServerEvents", key).is_empty());

        assert_eq!(registry.retire("ServerEvents", key, &[entry.id()]), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![]);
        for event in [ServerEvent::Startup, ServerEvent::Startup, ServerEvent::Shutdown] {
            registry
                .register(&lua, &catalog, None, event, script_fn(&lua), 0)
                .unwrap();
        }

        assert_eq!(registry.clear("ServerEvents", None, Some(ServerEvent::Startup.into())), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.clear("ServerEvents", None, None), 1);
        assert_eq!(registry.clear("Unknown", None, None), 0);
    }

    #[test]
    fn test_clear_by_entry() {
        let lua = Lua::new();
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![1, 2]);
        for entry in [1, 1, 2] {
            registry
                .register(&lua, &catalog, Some(entry), CreatureEvent::Spawn, script_fn(&lua), 0)
                .unwrap();
        }

        assert_eq!(registry.clear("CreatureEvents", Some(1), None), 2);
        assert!(registry.has_bindings("CreatureEvents", BindingKey::new(Some(2), CreatureEvent::Spawn)));
    }

    #[test]
    fn test_snapshot_merge_into_new_runtime() {
        let old = unsafe { Lua::unsafe_new() };
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![]);
        let key = BindingKey::new(None, ServerEvent::Startup);

        let script: Function = old
            .load("return function() fired = (fired or 0) + 1 end")
            .eval()
            .unwrap();
        registry
            .register(&old, &catalog, None, ServerEvent::Startup, script, 3)
            .unwrap();
        let native = old.create_function(|_, ()| Ok(())).unwrap();
        registry
            .register(&old, &catalog, None, ServerEvent::Startup, native, 0)
            .unwrap();
        let _ = registry.lookup("ServerEvents", key)[0].claim();

        let snapshot = registry.snapshot(&old);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.dropped(), 1);
        assert_eq!(snapshot.callbacks()[0].remaining, 2);
        drop(registry);
        drop(old);

        let new = unsafe { Lua::unsafe_new() };
        let rebuilt = BindingRegistry::new();
        assert_eq!(rebuilt.merge(&new, snapshot), 1);

        let entries = rebuilt.lookup("ServerEvents", key);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].shots(), 3);
        assert_eq!(entries[0].remaining(), 2);

        let func: Function = new.registry_value(entries[0].callback()).unwrap();
        func.call::<()>(()).unwrap();
        assert_eq!(new.globals().get::<i64>("fired").unwrap(), 1);
    }

    fn carry(old: &Lua, registry: &BindingRegistry) -> (Lua, BindingRegistry) {
        let snapshot = registry.snapshot(old);
        let new = unsafe { Lua::unsafe_new() };
        let rebuilt = BindingRegistry::new();
        rebuilt.merge(&new, snapshot);
        (new, rebuilt)
    }

    #[test]
    fn test_merged_closure_gets_fresh_upvalues() {
        let old = unsafe { Lua::unsafe_new() };
        let registry = BindingRegistry::new();
        let script: Function = old
            .load(
                r#"
                local state = { n = 0 }
                return function()
                    state = state or {}
                    fired = true
                end
                "#,
            )
            .eval()
            .unwrap();
        registry
            .register(&old, &Catalog(vec![]), None, ServerEvent::Startup, script, 0)
            .unwrap();

        let (new, rebuilt) = carry(&old, &registry);
        let entry = rebuilt
            .lookup("ServerEvents", BindingKey::new(None, ServerEvent::Startup))
            .remove(0);
        assert!(entry.is_carried());

        let func: Function = new.registry_value(entry.callback()).unwrap();
        func.call::<()>(()).unwrap();
        assert!(new.globals().get::<bool>("fired").unwrap());
        assert!(new.globals().get::<Value>("n").unwrap().is_nil());
        assert!(new.globals().get::<Value>("state").unwrap().is_nil());
    }

    #[test]
    fn test_fresh_registration_replaces_carried() {
        const SOURCE: &str = "return function() end";
        let old = unsafe { Lua::unsafe_new() };
        let registry = BindingRegistry::new();
        let catalog = Catalog(vec![]);
        let key = BindingKey::new(None, ServerEvent::Startup);

        let func: Function = old.load(SOURCE).set_name("=startup.lua").eval().unwrap();
        registry
            .register(&old, &catalog, None, ServerEvent::Startup, func, 3)
            .unwrap();
        let other: Function = old.load("return function() return 1 end").eval().unwrap();
        registry
            .register(&old, &catalog, None, ServerEvent::Startup, other, 0)
            .unwrap();
        let _ = registry.lookup("ServerEvents", key)[0].claim();

        let (new, rebuilt) = carry(&old, &registry);
        let func: Function = new.load(SOURCE).set_name("=startup.lua").eval().unwrap();
        let fresh = rebuilt
            .register(&new, &catalog, None, ServerEvent::Startup, func, 3)
            .unwrap();
        assert_eq!(rebuilt.len(), 3);

        assert_eq!(rebuilt.retire_replaced(&new), 1);
        let entries = rebuilt.lookup("ServerEvents", key);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_carried());
        assert_eq!(entries[1].id(), fresh);
        assert_eq!(entries[1].remaining(), 2);
        assert_eq!(rebuilt.retire_replaced(&new), 0);
    }
}
