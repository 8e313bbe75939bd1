//! Values and object handles crossing between the host and scripts

mod common;

use std::sync::Arc;

use common::{eval, exec_err, lua, script_tree, start};
use lantern_bridge::mlua::Value;
use lantern_bridge::{check, object_store, NativeObject, ObjectHandle, Push};

#[test]
fn test_integer_ranges() {
    let dir = script_tree(&[]);
    let (bridge, _world) = start(&dir, &[]);

    for v in [0, 1, 127, 255] {
        let got: u8 = eval(&bridge, &format!("return TakeU8({v})"));
        assert_eq!(u32::from(got), v);
    }

    let err = exec_err(&bridge, "TakeU8(256)");
    assert!(err.contains("bad argument #1 (value must be less than or equal to 255)"), "{err}");
    let err = exec_err(&bridge, "TakeU8(-1)");
    assert!(err.contains("bad argument #1 (value must be greater than or equal to 0)"), "{err}");

    let min: i32 = eval(&bridge, "return TakeI32(-2147483648)");
    assert_eq!(min, i32::MIN);
    let err = exec_err(&bridge, "TakeI32(2147483648)");
    assert!(err.contains("value must be less than or equal to 2147483647"), "{err}");
}

#[test]
fn test_integer_checks_on_host_side() {
    let dir = script_tree(&[]);
    let (bridge, _world) = start(&dir, &[]);
    let lua = lua(&bridge);

    let args = [Value::Integer(i64::from(u16::MAX)), Value::Number(70000.0)];
    assert_eq!(check::<u16>(lua, &args, 1).unwrap(), u16::MAX);
    let err = check::<u16>(lua, &args, 2).unwrap_err();
    assert_eq!(err.narg, 2);
    assert_eq!(err.message, "value must be less than or equal to 65535");

    let err = check::<u16>(lua, &args, 3).unwrap_err();
    assert_eq!(err.to_string(), "bad argument #3 (number expected, got nil)");
}

#[test]
fn test_wide_integers_are_boxed() {
    let dir = script_tree(&[]);
    let (bridge, _world) = start(&dir, &[]);

    let text: String = eval(&bridge, "return tostring(MaxU64())");
    assert_eq!(text, u64::MAX.to_string());

    let equal: bool = eval(&bridge, "return MaxU64() == MaxU64()");
    assert!(equal);

    let ordered: bool = eval(&bridge, "return AddU64(1, 2) < AddU64(2, 2)");
    assert!(ordered);

    let sum: String = eval(&bridge, "return tostring(AddU64(MaxU64(), 1))");
    assert_eq!(sum, "0");

    let value = u64::MAX.push(lua(&bridge)).unwrap();
    assert_eq!(check::<u64>(lua(&bridge), &[value], 1).unwrap(), u64::MAX);
}

#[test]
fn test_same_object_same_handle() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    world.spawn_creature(7);

    let same: bool = eval(&bridge, "return rawequal(GetCreature(1), GetCreature(1))");
    assert!(same);

    let text: String = eval(&bridge, "return tostring(GetCreature(1))");
    assert!(text.starts_with("Creature: 0x"), "{text}");

    let missing: bool = eval(&bridge, "return GetCreature(2) == nil");
    assert!(missing);
}

#[test]
fn test_invalidate_all_fails_later_checks() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    world.spawn_creature(7);

    let entry: u32 = eval(&bridge, "held = GetCreature(1); return held:GetEntry()");
    assert_eq!(entry, 7);

    let handle: Value = eval(&bridge, "return held");
    assert!(object_store::invalidate_all(lua(&bridge)).unwrap() >= 1);
    let valid = handle
        .as_userdata()
        .unwrap()
        .borrow::<ObjectHandle>()
        .unwrap()
        .is_valid();
    assert!(!valid);

    let err = exec_err(&bridge, "held:GetEntry()");
    assert!(
        err.contains("bad argument #1 (Creature expected, got pointer to nonexisting (invalidated) object)"),
        "{err}"
    );

    let fresh: bool = eval(&bridge, "return rawequal(held, GetCreature(1))");
    assert!(!fresh);
}

#[test]
fn test_invalidate_one_object() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    let doomed = world.spawn_creature(1);
    world.spawn_creature(2);

    lua(&bridge)
        .load("first = GetCreature(1); second = GetCreature(2)")
        .exec()
        .unwrap();

    let doomed: Arc<dyn NativeObject> = doomed;
    assert_eq!(bridge.invalidate_object(doomed.as_ref()), 1);

    let err = exec_err(&bridge, "first:GetEntry()");
    assert!(err.contains("invalidated"), "{err}");
    let entry: u32 = eval(&bridge, "return second:GetEntry()");
    assert_eq!(entry, 2);
}

#[test]
fn test_dropped_native_object() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    world.spawn_creature(3);

    lua(&bridge).load("held = GetCreature(1)").exec().unwrap();
    world.creatures.borrow_mut().clear();

    let err = exec_err(&bridge, "held:GetEntry()");
    assert!(err.contains("pointer to nonexisting (invalidated) object"), "{err}");
}

#[test]
fn test_methods_resolve_through_ancestors() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    world.spawn_creature(5);
    world.spawn_player("Ardent");
    world.spawn_game_object(9);

    let names: Vec<String> = eval(
        &bridge,
        "return { GetCreature(1):GetTypeName(), GetPlayer(1):GetTypeName(), GetGameObject(1):GetTypeName() }",
    );
    assert_eq!(names, vec!["Creature", "Player", "GameObject"]);

    let name: String = eval(&bridge, "return GetPlayer(1):GetName()");
    assert_eq!(name, "Ardent");

    let missing: bool = eval(&bridge, "return GetPlayer(1).GetEntry == nil");
    assert!(missing);
}

#[test]
fn test_checks_accept_subtypes_only() {
    let dir = script_tree(&[]);
    let (bridge, world) = start(&dir, &[]);
    world.spawn_creature(5);
    world.spawn_player("Ardent");
    world.spawn_game_object(9);

    let units: bool = eval(&bridge, "return IsUnit(GetCreature(1)) and IsUnit(GetPlayer(1))");
    assert!(units);

    let err = exec_err(&bridge, "IsUnit(GetGameObject(1))");
    assert!(err.contains("bad argument #1 (Unit expected, got GameObject)"), "{err}");

    let err = exec_err(&bridge, "IsUnit(42)");
    assert!(err.contains("bad argument #1 (Unit expected, got integer)"), "{err}");
}
