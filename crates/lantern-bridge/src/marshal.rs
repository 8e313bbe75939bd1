//! Conversion of native values to and from script values
//!
//! Pushing never fails for primitives. Checking validates type and range and
//! reports failures as [`ArgumentError`] so the message points at the offending
//! argument. Integers that do not fit a script number losslessly (64-bit) travel
//! as boxed handles with comparison and `tostring` support.

use std::sync::Arc;

use mlua::{FromLua, Function, Lua, MultiValue, UserDataRef, Value};

use crate::error::ArgumentError;
use crate::object_store::{self, ObjectHandle};
use crate::types::{NativeObject, ScriptObject, TypeRegistry, TypeTag};

/// A native value that can be handed to scripts
pub trait Push {
    fn push(self, lua: &Lua) -> mlua::Result<Value>;
}

/// A native value that can be read back from a script argument
pub trait Check: Sized {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError>;
}

/// Enumerations accepted from scripts as integers in `[FIRST, COUNT - 1]`
pub trait ScriptEnum: Copy + TryFrom<i32> + Into<i32> + 'static {
    const NAME: &'static str;
    const FIRST: i32;
    const COUNT: i32;
}

macro_rules! push_as_integer {
    ($($t:ty),*) => {
        $(
            impl Push for $t {
                fn push(self, _lua: &Lua) -> mlua::Result<Value> {
                    Ok(Value::Integer(self as mlua::Integer))
                }
            }
        )*
    };
}

push_as_integer!(i8, i16, i32, u8, u16, u32);

impl Push for f32 {
    fn push(self, _lua: &Lua) -> mlua::Result<Value> {
        Ok(Value::Number(self as f64))
    }
}

impl Push for f64 {
    fn push(self, _lua: &Lua) -> mlua::Result<Value> {
        Ok(Value::Number(self))
    }
}

impl Push for bool {
    fn push(self, _lua: &Lua) -> mlua::Result<Value> {
        Ok(Value::Boolean(self))
    }
}

impl Push for &str {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_string(self).map(Value::String)
    }
}

impl Push for String {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        self.as_str().push(lua)
    }
}

impl Push for i64 {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        object_store::push_int64(lua, self)
    }
}

impl Push for u64 {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        object_store::push_uint64(lua, self)
    }
}

impl Push for () {
    fn push(self, _lua: &Lua) -> mlua::Result<Value> {
        Ok(Value::Nil)
    }
}

impl Push for Value {
    fn push(self, _lua: &Lua) -> mlua::Result<Value> {
        Ok(self)
    }
}

impl<T: Push> Push for Option<T> {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            Some(value) => value.push(lua),
            None => Ok(Value::Nil),
        }
    }
}

impl Push for &Arc<dyn NativeObject> {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        object_store::push_native(lua, self)
    }
}

impl Push for Arc<dyn NativeObject> {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        object_store::push_native(lua, &self)
    }
}

impl<T: NativeObject + 'static> Push for Arc<T> {
    fn push(self, lua: &Lua) -> mlua::Result<Value> {
        let object: Arc<dyn NativeObject> = self;
        object_store::push_native(lua, &object)
    }
}

/// Push each element of a tuple as one argument
pub trait PushMulti {
    fn push_multi(self, lua: &Lua) -> mlua::Result<MultiValue>;
}

macro_rules! push_multi_tuple {
    ($($name:ident),*) => {
        impl<$($name: Push),*> PushMulti for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            fn push_multi(self, lua: &Lua) -> mlua::Result<MultiValue> {
                let ($($name,)*) = self;
                Ok(MultiValue::from_vec(vec![$($name.push(lua)?),*]))
            }
        }
    };
}

push_multi_tuple!();
push_multi_tuple!(A);
push_multi_tuple!(A, B);
push_multi_tuple!(A, B, C);
push_multi_tuple!(A, B, C, D);
push_multi_tuple!(A, B, C, D, E);
push_multi_tuple!(A, B, C, D, E, F);

impl PushMulti for MultiValue {
    fn push_multi(self, _lua: &Lua) -> mlua::Result<MultiValue> {
        Ok(self)
    }
}

/// Script-facing name of a value's type, using the handle type for userdata
fn type_name_of(value: &Value) -> String {
    if let Value::UserData(ud) = value {
        if let Ok(handle) = ud.borrow::<ObjectHandle>() {
            return handle.type_tag().name().to_string();
        }
    }
    value.type_name().to_string()
}

fn above_max(narg: usize, max: impl std::fmt::Display) -> ArgumentError {
    ArgumentError::new(narg, format!("value must be less than or equal to {}", max))
}

fn below_min(narg: usize, min: impl std::fmt::Display) -> ArgumentError {
    ArgumentError::new(narg, format!("value must be greater than or equal to {}", min))
}

fn check_number(lua: &Lua, value: &Value, narg: usize) -> Result<f64, ArgumentError> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        Value::String(_) => lua
            .coerce_number(value.clone())
            .ok()
            .flatten()
            .ok_or_else(|| ArgumentError::type_mismatch(narg, "number", "string")),
        other => Err(ArgumentError::type_mismatch(
            narg,
            "number",
            &type_name_of(other),
        )),
    }
}

fn check_integral(lua: &Lua, value: &Value, narg: usize) -> Result<f64, ArgumentError> {
    let n = check_number(lua, value, narg)?;
    if n.is_nan() {
        return Err(ArgumentError::type_mismatch(narg, "number", "nan"));
    }
    Ok(n)
}

macro_rules! check_ranged_integer {
    ($($t:ty),*) => {
        $(
            impl Check for $t {
                fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
                    let n = check_integral(lua, value, narg)?;
                    if n > <$t>::MAX as f64 {
                        Err(above_max(narg, <$t>::MAX))
                    } else if n < <$t>::MIN as f64 {
                        Err(below_min(narg, <$t>::MIN))
                    } else {
                        Ok(n as $t)
                    }
                }
            }
        )*
    };
}

check_ranged_integer!(i8, i16, i32, u8, u16, u32);

impl Check for i64 {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        match value {
            Value::Integer(i) => Ok(*i),
            Value::UserData(_) => check_type(value, Some(TypeTag::of(&crate::types::INT64)), narg, true)?
                .and_then(|handle| handle.as_i64())
                .ok_or_else(|| ArgumentError::type_mismatch(narg, "int64", &type_name_of(value))),
            _ => {
                let n = check_integral(lua, value, narg)?;
                // i64::MAX is not representable as f64; its nearest neighbour is 2^63
                if n >= i64::MAX as f64 {
                    Err(above_max(narg, i64::MAX))
                } else if n < i64::MIN as f64 {
                    Err(below_min(narg, i64::MIN))
                } else {
                    Ok(n as i64)
                }
            }
        }
    }
}

impl Check for u64 {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        match value {
            Value::Integer(i) => u64::try_from(*i).map_err(|_| below_min(narg, 0)),
            Value::UserData(_) => check_type(value, Some(TypeTag::of(&crate::types::UINT64)), narg, true)?
                .and_then(|handle| handle.as_u64())
                .ok_or_else(|| ArgumentError::type_mismatch(narg, "uint64", &type_name_of(value))),
            _ => {
                let n = check_integral(lua, value, narg)?;
                if n >= u64::MAX as f64 {
                    Err(above_max(narg, u64::MAX))
                } else if n < 0.0 {
                    Err(below_min(narg, 0))
                } else {
                    Ok(n as u64)
                }
            }
        }
    }
}

impl Check for f64 {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        check_number(lua, value, narg)
    }
}

impl Check for f32 {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        check_number(lua, value, narg).map(|n| n as f32)
    }
}

/// Truthiness: everything except `nil` and `false` is true
impl Check for bool {
    fn check(_lua: &Lua, value: &Value, _narg: usize) -> Result<Self, ArgumentError> {
        Ok(!matches!(value, Value::Nil | Value::Boolean(false)))
    }
}

impl Check for String {
    fn check(lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        String::from_lua(value.clone(), lua)
            .map_err(|_| ArgumentError::type_mismatch(narg, "string", &type_name_of(value)))
    }
}

impl Check for Function {
    fn check(_lua: &Lua, value: &Value, narg: usize) -> Result<Self, ArgumentError> {
        check_function(value, narg)
    }
}

/// Check argument `narg` (1-based) of `args`
pub fn check<T: Check>(lua: &Lua, args: &[Value], narg: usize) -> Result<T, ArgumentError> {
    let nil = Value::Nil;
    let value = args.get(narg.wrapping_sub(1)).unwrap_or(&nil);
    T::check(lua, value, narg)
}

/// Like [`check`], but a missing or nil argument yields `default`
pub fn check_opt<T: Check>(
    lua: &Lua,
    args: &[Value],
    narg: usize,
    default: T,
) -> Result<T, ArgumentError> {
    match args.get(narg.wrapping_sub(1)) {
        None | Some(Value::Nil) => Ok(default),
        Some(value) => T::check(lua, value, narg),
    }
}

pub fn check_enum<E: ScriptEnum>(lua: &Lua, value: &Value, narg: usize) -> Result<E, ArgumentError> {
    let n = i32::check(lua, value, narg)?;
    if n > E::COUNT - 1 {
        return Err(above_max(narg, E::COUNT - 1));
    }
    if n < E::FIRST {
        return Err(below_min(narg, E::FIRST));
    }
    E::try_from(n).map_err(|_| {
        ArgumentError::new(narg, format!("{} is not a valid {}", n, E::NAME))
    })
}

pub fn check_function(value: &Value, narg: usize) -> Result<Function, ArgumentError> {
    match value {
        Value::Function(func) => Ok(func.clone()),
        other => Err(ArgumentError::type_mismatch(
            narg,
            "function",
            &type_name_of(other),
        )),
    }
}

/// Match a handle against one exact type.
///
/// `expected` of `None` accepts any handle. With `error` unset a mismatch or an
/// invalidated handle yields `Ok(None)` instead of an error, which is how
/// subtypes are tried in turn.
pub fn check_type(
    value: &Value,
    expected: Option<TypeTag>,
    narg: usize,
    error: bool,
) -> Result<Option<UserDataRef<ObjectHandle>>, ArgumentError> {
    let expected_name = expected.map_or("object", |tag| tag.name());
    let fail = |err: ArgumentError| if error { Err(err) } else { Ok(None) };

    let handle = match value {
        Value::UserData(ud) => match ud.borrow::<ObjectHandle>() {
            Ok(handle) => handle,
            Err(_) => {
                return fail(ArgumentError::type_mismatch(
                    narg,
                    expected_name,
                    &type_name_of(value),
                ))
            }
        },
        other => {
            return fail(ArgumentError::type_mismatch(
                narg,
                expected_name,
                &type_name_of(other),
            ))
        }
    };

    if expected.is_some_and(|tag| tag != handle.type_tag()) {
        return fail(ArgumentError::type_mismatch(
            narg,
            expected_name,
            handle.type_tag().name(),
        ));
    }

    if !handle.is_valid() {
        return fail(ArgumentError::type_mismatch(
            narg,
            expected_name,
            "pointer to nonexisting (invalidated) object",
        ));
    }

    Ok(Some(handle))
}

/// Check for a handle of `expected` or any registered subtype.
///
/// Subtypes are tried most derived first, then `expected` itself.
pub fn check_handle(
    lua: &Lua,
    value: &Value,
    expected: TypeTag,
    narg: usize,
) -> Result<UserDataRef<ObjectHandle>, ArgumentError> {
    let candidates = lua
        .app_data_ref::<TypeRegistry>()
        .map(|types| types.descendants(expected))
        .unwrap_or_default();

    for candidate in candidates {
        if let Some(handle) = check_type(value, Some(candidate), narg, false)? {
            return Ok(handle);
        }
    }

    check_type(value, Some(expected), narg, true)?.ok_or_else(|| {
        ArgumentError::type_mismatch(narg, expected.name(), &type_name_of(value))
    })
}

/// Check for a live native object of `expected` or a subtype
pub fn check_native(
    lua: &Lua,
    value: &Value,
    expected: TypeTag,
    narg: usize,
) -> Result<Arc<dyn NativeObject>, ArgumentError> {
    check_handle(lua, value, expected, narg)?
        .native()
        .ok_or_else(|| {
            ArgumentError::type_mismatch(
                narg,
                expected.name(),
                "pointer to nonexisting (invalidated) object",
            )
        })
}

/// Check for a live native object and downcast it to `T`
pub fn check_object<T: ScriptObject + Send + Sync + 'static>(
    lua: &Lua,
    value: &Value,
    narg: usize,
) -> Result<Arc<T>, ArgumentError> {
    let object = check_native(lua, value, T::script_type(), narg)?;
    let found = object.type_tag();
    crate::types::AsAny::into_any_arc(object)
        .downcast::<T>()
        .map_err(|_| ArgumentError::type_mismatch(narg, T::script_type().name(), found.name()))
}
