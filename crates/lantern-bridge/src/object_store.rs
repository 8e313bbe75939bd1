//! Script handles for native objects
//!
//! Each live native object seen by scripts is represented by exactly one handle
//! per resolved type. Handles live in a weak-valued table in the Lua registry,
//! so an unreferenced handle can be collected and a later push simply creates a
//! new one. Tearing down the runtime invalidates every handle that is still
//! reachable, and native code can invalidate the handles of a single object
//! when it goes away.

use std::cell::Cell;
use std::sync::{Arc, Weak};

use mlua::{AnyUserData, Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};

use crate::types::{NativeObject, TypeRegistry, TypeTag, INT64, UINT64};

const STORE_KEY: &str = "lantern.object_store";
const METHODS_KEY: &str = "lantern.methods";

#[derive(Debug)]
enum HandleTarget {
    Native(Weak<dyn NativeObject>),
    Int64(i64),
    UInt64(u64),
}

/// The userdata scripts hold in place of a native value
#[derive(Debug)]
pub struct ObjectHandle {
    target: HandleTarget,
    tag: TypeTag,
    addr: usize,
    valid: Cell<bool>,
}

impl ObjectHandle {
    fn boxed(target: HandleTarget) -> Self {
        let tag = match target {
            HandleTarget::UInt64(_) => TypeTag::of(&UINT64),
            _ => TypeTag::of(&INT64),
        };
        Self {
            target,
            tag,
            addr: 0,
            valid: Cell::new(true),
        }
    }

    /// The registered type this handle was created as
    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }

    pub fn is_valid(&self) -> bool {
        if !self.valid.get() {
            return false;
        }
        match &self.target {
            HandleTarget::Native(object) => object.strong_count() > 0,
            _ => true,
        }
    }

    /// The native object behind this handle, if it is still alive
    pub fn native(&self) -> Option<Arc<dyn NativeObject>> {
        match &self.target {
            HandleTarget::Native(object) if self.valid.get() => object.upgrade(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.target {
            HandleTarget::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.target {
            HandleTarget::UInt64(v) => Some(v),
            _ => None,
        }
    }

    fn invalidate(&self) {
        self.valid.set(false);
    }

    fn boxed_value(&self) -> Option<i128> {
        match self.target {
            HandleTarget::Int64(v) => Some(v as i128),
            HandleTarget::UInt64(v) => Some(v as i128),
            HandleTarget::Native(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self.target {
            HandleTarget::Int64(v) => v.to_string(),
            HandleTarget::UInt64(v) => v.to_string(),
            HandleTarget::Native(_) => format!("{}: 0x{:x}", self.tag.name(), self.addr),
        }
    }
}

impl UserData for ObjectHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.describe()));

        methods.add_meta_function(MetaMethod::Index, |lua, (ud, key): (AnyUserData, Value)| {
            let tag = ud.borrow::<ObjectHandle>()?.tag;
            lookup_method(lua, tag, key)
        });

        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Value, Value)| {
            match (comparable(&a), comparable(&b)) {
                (Some(a), Some(b)) => Ok(a == b),
                _ => Ok(false),
            }
        });

        methods.add_meta_function(MetaMethod::Lt, |_, (a, b): (Value, Value)| {
            let (a, b) = ordered_pair(&a, &b)?;
            Ok(a < b)
        });

        methods.add_meta_function(MetaMethod::Le, |_, (a, b): (Value, Value)| {
            let (a, b) = ordered_pair(&a, &b)?;
            Ok(a <= b)
        });
    }
}

fn comparable(value: &Value) -> Option<i128> {
    match value {
        Value::Integer(i) => Some(*i as i128),
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i128),
        Value::UserData(ud) => ud.borrow::<ObjectHandle>().ok()?.boxed_value(),
        _ => None,
    }
}

fn ordered_pair(a: &Value, b: &Value) -> mlua::Result<(i128, i128)> {
    match (comparable(a), comparable(b)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(mlua::Error::RuntimeError(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn lookup_method(lua: &Lua, tag: TypeTag, key: Value) -> mlua::Result<Value> {
    let methods: Table = lua.named_registry_value(METHODS_KEY)?;
    for tag in tag.ancestors() {
        if let Some(table) = methods.raw_get::<Option<Table>>(tag.addr())? {
            let found: Value = table.raw_get(key.clone())?;
            if !found.is_nil() {
                return Ok(found);
            }
        }
    }
    Ok(Value::Nil)
}

fn weak_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__mode", "v")?;
    table.set_metatable(Some(meta));
    Ok(table)
}

fn store_key(addr: usize, tag: TypeTag) -> String {
    format!("{:x}/{:x}", addr, tag.addr())
}

fn object_addr(object: &dyn NativeObject) -> usize {
    object as *const dyn NativeObject as *const () as usize
}

/// Create the handle table and the per-type method tables in `lua`
pub fn create(lua: &Lua) -> mlua::Result<()> {
    lua.set_named_registry_value(STORE_KEY, weak_table(lua)?)?;
    lua.set_named_registry_value(METHODS_KEY, lua.create_table()?)
}

/// Expose `func` as method `name` on handles of `tag` and its subtypes
pub fn add_method(lua: &Lua, tag: TypeTag, name: &str, func: Function) -> mlua::Result<()> {
    let methods: Table = lua.named_registry_value(METHODS_KEY)?;
    let table = match methods.raw_get::<Option<Table>>(tag.addr())? {
        Some(table) => table,
        None => {
            let table = lua.create_table()?;
            methods.raw_set(tag.addr(), &table)?;
            table
        }
    };
    table.raw_set(name, func)
}

/// Push a native object, reusing its live handle if it has one.
///
/// The handle is typed as the most derived registered type in the object's
/// ancestry.
pub fn push_native(lua: &Lua, object: &Arc<dyn NativeObject>) -> mlua::Result<Value> {
    let actual = object.type_tag();
    let resolved = lua
        .app_data_ref::<TypeRegistry>()
        .ok_or_else(|| mlua::Error::RuntimeError("type registry is not installed".into()))?
        .resolve(actual);
    let Some(tag) = resolved else {
        return Err(mlua::Error::RuntimeError(format!(
            "`{}` is not a registered script type",
            actual.name()
        )));
    };

    let addr = object_addr(object.as_ref());
    let key = store_key(addr, tag);
    let store: Table = lua.named_registry_value(STORE_KEY)?;

    if let Some(existing) = store.raw_get::<Option<AnyUserData>>(key.as_str())? {
        if existing.borrow::<ObjectHandle>()?.is_valid() {
            return Ok(Value::UserData(existing));
        }
    }

    let handle = lua.create_userdata(ObjectHandle {
        target: HandleTarget::Native(Arc::downgrade(object)),
        tag,
        addr,
        valid: Cell::new(true),
    })?;
    store.raw_set(key, &handle)?;
    Ok(Value::UserData(handle))
}

pub fn push_int64(lua: &Lua, value: i64) -> mlua::Result<Value> {
    push_boxed(lua, HandleTarget::Int64(value))
}

pub fn push_uint64(lua: &Lua, value: u64) -> mlua::Result<Value> {
    push_boxed(lua, HandleTarget::UInt64(value))
}

/// Every push boxes into a new handle, keyed in the store by its own address
fn push_boxed(lua: &Lua, target: HandleTarget) -> mlua::Result<Value> {
    let handle = Value::UserData(lua.create_userdata(ObjectHandle::boxed(target))?);
    let store: Table = lua.named_registry_value(STORE_KEY)?;
    store.raw_set(format!("boxed/{:p}", handle.to_pointer()), handle.clone())?;
    Ok(handle)
}

/// Invalidate every handle still in the store.
///
/// Entries stay in place for the collector; a later push of the same object
/// replaces its invalidated handle. Returns the number of handles invalidated.
pub fn invalidate_all(lua: &Lua) -> mlua::Result<usize> {
    let store: Table = lua.named_registry_value(STORE_KEY)?;
    let mut count = 0;
    for pair in store.pairs::<Value, AnyUserData>() {
        let (_, handle) = pair?;
        if let Ok(handle) = handle.borrow::<ObjectHandle>() {
            handle.invalidate();
            count += 1;
        }
    }
    Ok(count)
}

/// Invalidate the handles of one native object, whatever type they were pushed as
pub fn invalidate_object(lua: &Lua, object: &dyn NativeObject) -> mlua::Result<usize> {
    let addr = object_addr(object);
    let store: Table = lua.named_registry_value(STORE_KEY)?;

    let mut stale = Vec::new();
    for pair in store.pairs::<Value, AnyUserData>() {
        let (key, handle) = pair?;
        let handle = handle.borrow::<ObjectHandle>()?;
        if matches!(handle.target, HandleTarget::Native(_)) && handle.addr == addr {
            handle.invalidate();
            stale.push(key);
        }
    }

    let count = stale.len();
    for key in stale {
        store.raw_set(key, Value::Nil)?;
    }
    Ok(count)
}
