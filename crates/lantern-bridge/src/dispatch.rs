use std::sync::atomic::{AtomicU32, Ordering};

use mlua::{Lua, MultiValue, RegistryKey, Value};
use tracing::error;

use crate::error::BridgeError;

/// Runs registered callbacks behind a protected-call boundary
#[derive(Debug, Default)]
pub struct Dispatcher {
    depth: AtomicU32,
}

struct DepthGuard<'a>(&'a AtomicU32);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks currently executing on this dispatcher
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    fn enter(&self) -> DepthGuard<'_> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        DepthGuard(&self.depth)
    }

    /// Call the function stored under `callback` with `args`.
    ///
    /// Failures are logged here and returned for inspection; they never
    /// unwind into the caller. With `nresults` set the results are truncated
    /// or padded with nil to that many values.
    pub fn execute(
        &self,
        lua: &Lua,
        callback: &RegistryKey,
        args: MultiValue,
        nresults: Option<usize>,
    ) -> Result<MultiValue, BridgeError> {
        let func = match lua.registry_value::<Value>(callback) {
            Ok(Value::Function(func)) => func,
            Ok(other) => {
                drop(args);
                let err = BridgeError::NotCallable {
                    found: other.type_name(),
                };
                error!(target: "scripting", "{}", err);
                return Err(err);
            }
            Err(e) => {
                error!(target: "scripting", "Failed to resolve callback: {}", e);
                return Err(BridgeError::Call(e));
            }
        };

        let _guard = self.enter();
        match func.call::<MultiValue>(args) {
            Ok(results) => Ok(fit_results(results, nresults)),
            Err(e) => {
                error!(target: "scripting", "{}", e);
                Err(BridgeError::Call(e))
            }
        }
    }
}

fn fit_results(results: MultiValue, nresults: Option<usize>) -> MultiValue {
    let Some(n) = nresults else {
        return results;
    };
    let mut values = results.into_vec();
    values.resize(n, Value::Nil);
    MultiValue::from_vec(values)
}
