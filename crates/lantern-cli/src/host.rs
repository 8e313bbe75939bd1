//! The demo host: a console "server" that scripts can hook into

use std::sync::Arc;
use std::time::Instant;

use lantern_bridge::mlua::{MultiValue, Value};
use lantern_bridge::{
    check, check_object, Bindings, Bridge, DefinitionCatalog, EventCategory, NativeObject, Push,
    ScriptEnum, ScriptHost, ScriptObject, TypeDescriptor, TypeTag,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::info;

static SERVER: TypeDescriptor = TypeDescriptor::new("Server", None);

/// Events the console host raises
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ServerEvent {
    Startup = 1,
    Shutdown = 2,
    /// `(event, diff_ms)` every host tick
    WorldTick = 3,
}

impl ScriptEnum for ServerEvent {
    const NAME: &'static str = "ServerEvent";
    const FIRST: i32 = 1;
    const COUNT: i32 = 4;
}

impl EventCategory for ServerEvent {
    const CATEGORY: &'static str = "ServerEvents";
}

/// The running server as scripts see it
pub struct Server {
    name: String,
    started: Instant,
}

impl NativeObject for Server {
    fn type_tag(&self) -> TypeTag {
        Self::script_type()
    }
}

impl ScriptObject for Server {
    const DESCRIPTOR: &'static TypeDescriptor = &SERVER;
}

pub struct ConsoleHost {
    server: Arc<Server>,
}

impl ConsoleHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            server: Arc::new(Server {
                name: name.into(),
                started: Instant::now(),
            }),
        }
    }
}

impl DefinitionCatalog for ConsoleHost {
    fn has_definition(&self, _kind: &'static str, _id: u32) -> bool {
        false
    }
}

impl ScriptHost for ConsoleHost {
    fn install(&self, bindings: &mut Bindings<'_>) -> lantern_bridge::mlua::Result<()> {
        let server_type = bindings.register_type(&SERVER);

        bindings.add_method(server_type, "GetName", |lua, args: MultiValue| {
            let args = args.into_vec();
            let server = check_object::<Server>(lua, args.first().unwrap_or(&Value::Nil), 1)?;
            Ok(server.name.clone())
        })?;
        bindings.add_method(server_type, "GetUptime", |lua, args: MultiValue| {
            let args = args.into_vec();
            let server = check_object::<Server>(lua, args.first().unwrap_or(&Value::Nil), 1)?;
            Ok(u64::try_from(server.started.elapsed().as_millis()).unwrap_or(u64::MAX))
        })?;

        let server = Arc::clone(&self.server);
        bindings.set_function("GetServer", move |lua, ()| Arc::clone(&server).push(lua))?;

        bindings.set_function("Log", |lua, args: MultiValue| {
            let message: String = check(lua, &args.into_vec(), 1)?;
            info!(target: "script", "{}", message);
            Ok(())
        })?;

        bindings.expose_events::<ServerEvent>("RegisterServerEvent")
    }

    fn on_state_open(&self, bridge: &Bridge) {
        info!(
            "{} scripts loaded, {} bindings registered",
            bridge.scripts().len(),
            bridge.binding_count()
        );
    }

    fn on_reload(&self, _bridge: &Bridge) {
        info!("Scripts reloaded");
    }
}
