//! Shared fixtures: a small native object hierarchy and a host that exposes it
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs;
use std::rc::Rc;
use std::sync::Arc;

use lantern_bridge::mlua::{Lua, MultiValue, Value};
use lantern_bridge::{
    check, check_native, check_object, Bindings, Bridge, BridgeConfig, DefinitionCatalog,
    EventCategory, NativeObject, Push, ScriptEnum, ScriptHost, ScriptObject, TypeDescriptor,
    TypeTag,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tempfile::TempDir;

pub static OBJECT: TypeDescriptor = TypeDescriptor::new("Object", None);
pub static WORLD_OBJECT: TypeDescriptor = TypeDescriptor::new("WorldObject", Some(&OBJECT));
pub static UNIT: TypeDescriptor = TypeDescriptor::new("Unit", Some(&WORLD_OBJECT));
pub static CREATURE: TypeDescriptor = TypeDescriptor::new("Creature", Some(&UNIT));
pub static PLAYER: TypeDescriptor = TypeDescriptor::new("Player", Some(&UNIT));
pub static GAME_OBJECT: TypeDescriptor = TypeDescriptor::new("GameObject", Some(&WORLD_OBJECT));

pub const CREATURE_TEMPLATE: &str = "creature template";

pub struct Creature {
    pub entry: u32,
}

impl NativeObject for Creature {
    fn type_tag(&self) -> TypeTag {
        Self::script_type()
    }
}

impl ScriptObject for Creature {
    const DESCRIPTOR: &'static TypeDescriptor = &CREATURE;
}

pub struct Player {
    pub name: String,
}

impl NativeObject for Player {
    fn type_tag(&self) -> TypeTag {
        Self::script_type()
    }
}

impl ScriptObject for Player {
    const DESCRIPTOR: &'static TypeDescriptor = &PLAYER;
}

pub struct GameObject {
    pub entry: u32,
}

impl NativeObject for GameObject {
    fn type_tag(&self) -> TypeTag {
        Self::script_type()
    }
}

impl ScriptObject for GameObject {
    const DESCRIPTOR: &'static TypeDescriptor = &GAME_OBJECT;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ServerEvent {
    Startup = 1,
    Shutdown = 2,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum CreatureEvent {
    EnterCombat = 1,
    Died = 2,
}

impl ScriptEnum for CreatureEvent {
    const NAME: &'static str = "CreatureEvent";
    const FIRST: i32 = 1;
    const COUNT: i32 = 3;
}

impl EventCategory for CreatureEvent {
    const CATEGORY: &'static str = "CreatureEvents";
    const DEFINITION: Option<&'static str> = Some(CREATURE_TEMPLATE);
}

/// Host-side state the scripts can reach
#[derive(Default)]
pub struct World {
    pub creatures: RefCell<Vec<Arc<Creature>>>,
    pub players: RefCell<Vec<Arc<Player>>>,
    pub game_objects: RefCell<Vec<Arc<GameObject>>>,
    pub opened: Cell<usize>,
    pub closed: Cell<usize>,
    pub reloads: Cell<usize>,
}

impl World {
    pub fn spawn_creature(&self, entry: u32) -> Arc<Creature> {
        let creature = Arc::new(Creature { entry });
        self.creatures.borrow_mut().push(Arc::clone(&creature));
        creature
    }

    pub fn spawn_player(&self, name: &str) -> Arc<Player> {
        let player = Arc::new(Player {
            name: name.to_string(),
        });
        self.players.borrow_mut().push(Arc::clone(&player));
        player
    }

    pub fn spawn_game_object(&self, entry: u32) -> Arc<GameObject> {
        let object = Arc::new(GameObject { entry });
        self.game_objects.borrow_mut().push(Arc::clone(&object));
        object
    }
}

pub struct TestHost {
    pub world: Rc<World>,
    /// Creature template ids the catalog knows
    pub templates: Vec<u32>,
}

impl TestHost {
    pub fn new(templates: &[u32]) -> Self {
        Self {
            world: Rc::new(World::default()),
            templates: templates.to_vec(),
        }
    }
}

impl DefinitionCatalog for TestHost {
    fn has_definition(&self, kind: &'static str, id: u32) -> bool {
        kind == CREATURE_TEMPLATE && self.templates.contains(&id)
    }
}

fn nth<T>(list: &RefCell<Vec<Arc<T>>>, index: u32) -> Option<Arc<T>> {
    let index = usize::try_from(index).ok()?.checked_sub(1)?;
    list.borrow().get(index).cloned()
}

fn arg(args: &[Value], narg: usize) -> Value {
    args.get(narg - 1).cloned().unwrap_or(Value::Nil)
}

impl ScriptHost for TestHost {
    fn install(&self, bindings: &mut Bindings<'_>) -> lantern_bridge::mlua::Result<()> {
        for descriptor in [
            &OBJECT,
            &WORLD_OBJECT,
            &UNIT,
            &CREATURE,
            &PLAYER,
            &GAME_OBJECT,
        ] {
            bindings.register_type(descriptor);
        }

        bindings.add_method(
            TypeTag::of(&WORLD_OBJECT),
            "GetTypeName",
            |lua, args: MultiValue| {
                let args = args.into_vec();
                let object = check_native(lua, &arg(&args, 1), TypeTag::of(&WORLD_OBJECT), 1)?;
                Ok(object.type_tag().name())
            },
        )?;
        bindings.add_method(TypeTag::of(&CREATURE), "GetEntry", |lua, args: MultiValue| {
            let args = args.into_vec();
            let creature = check_object::<Creature>(lua, &arg(&args, 1), 1)?;
            Ok(creature.entry)
        })?;
        bindings.add_method(TypeTag::of(&PLAYER), "GetName", |lua, args: MultiValue| {
            let args = args.into_vec();
            let player = check_object::<Player>(lua, &arg(&args, 1), 1)?;
            Ok(player.name.clone())
        })?;

        let world = Rc::clone(&self.world);
        bindings.set_function("GetCreature", move |lua, args: MultiValue| {
            let index: u32 = check(lua, &args.into_vec(), 1)?;
            nth(&world.creatures, index).push(lua)
        })?;
        let world = Rc::clone(&self.world);
        bindings.set_function("GetPlayer", move |lua, args: MultiValue| {
            let index: u32 = check(lua, &args.into_vec(), 1)?;
            nth(&world.players, index).push(lua)
        })?;
        let world = Rc::clone(&self.world);
        bindings.set_function("GetGameObject", move |lua, args: MultiValue| {
            let index: u32 = check(lua, &args.into_vec(), 1)?;
            nth(&world.game_objects, index).push(lua)
        })?;

        bindings.set_function("IsUnit", |lua, args: MultiValue| {
            let args = args.into_vec();
            check_native(lua, &arg(&args, 1), TypeTag::of(&UNIT), 1)?;
            Ok(true)
        })?;
        bindings.set_function("TakeU8", |lua, args: MultiValue| {
            let value: u8 = check(lua, &args.into_vec(), 1)?;
            Ok(value)
        })?;
        bindings.set_function("TakeI32", |lua, args: MultiValue| {
            let value: i32 = check(lua, &args.into_vec(), 1)?;
            Ok(value)
        })?;
        bindings.set_function("MaxU64", |lua, ()| u64::MAX.push(lua))?;
        bindings.set_function("AddU64", |lua, args: MultiValue| {
            let args = args.into_vec();
            let a: u64 = check(lua, &args, 1)?;
            let b: u64 = check(lua, &args, 2)?;
            a.wrapping_add(b).push(lua)
        })?;

        bindings.expose_events::<ServerEvent>("RegisterServerEvent")?;
        bindings.expose_events::<CreatureEvent>("RegisterCreatureEvent")?;
        Ok(())
    }

    fn on_state_open(&self, _bridge: &Bridge) {
        self.world.opened.set(self.world.opened.get() + 1);
    }

    fn on_state_close(&self, _bridge: &Bridge) {
        self.world.closed.set(self.world.closed.get() + 1);
    }

    fn on_reload(&self, _bridge: &Bridge) {
        self.world.reloads.set(self.world.reloads.get() + 1);
    }
}

/// Write `files` (relative path, source) into a fresh script root
pub fn script_tree(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for (relative, source) in files {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create script dir");
        }
        fs::write(path, source).expect("Failed to write script");
    }
    dir
}

/// An initialized bridge over `dir`, plus the host's world
pub fn start(dir: &TempDir, templates: &[u32]) -> (Bridge, Rc<World>) {
    let host = TestHost::new(templates);
    let world = Rc::clone(&host.world);
    let config = BridgeConfig {
        script_path: dir.path().display().to_string(),
        ..BridgeConfig::default()
    };
    let mut bridge = Bridge::new(config, Rc::new(host));
    bridge.initialize().expect("Failed to initialize bridge");
    (bridge, world)
}

pub fn eval<T: lantern_bridge::mlua::FromLua>(bridge: &Bridge, source: &str) -> T {
    bridge
        .lua()
        .expect("bridge is not initialized")
        .load(source)
        .eval()
        .expect("script evaluation failed")
}

pub fn exec_err(bridge: &Bridge, source: &str) -> String {
    bridge
        .lua()
        .expect("bridge is not initialized")
        .load(source)
        .exec()
        .expect_err("script should have failed")
        .to_string()
}

pub fn lua(bridge: &Bridge) -> &Lua {
    bridge.lua().expect("bridge is not initialized")
}
