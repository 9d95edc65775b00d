//! End-to-end: authoritative mutations flow through the time circle and
//! a shadow tree converges on the same state.

use mesh_core::mailbox::MailBox;
use mesh_core::property::{
    CompositeDescriptor, FieldKind, PropertyDecl, PropertySetting, PropertyTree, SyncPolicy, TypeRegistry,
};
use mesh_core::sync::{PropertySyncCommandList, SubscriberKind, SyncPublisher, TimeCircle, TimeCircleConfig};
use mesh_core::{DictKey, PropValue, PropertyError};
use std::sync::Arc;

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            CompositeDescriptor::new("Item")
                .field("name", FieldKind::Leaf(PropValue::from("")))
                .field("count", FieldKind::Leaf(PropValue::Int(0)))
                .field("enchantments", FieldKind::List),
        )
        .unwrap();
    Arc::new(registry)
}

fn declare(tree: &mut PropertyTree, keep_order: bool, shadow: bool) {
    let policy = SyncPolicy {
        delay_ms: 100,
        keep_order,
    };
    let mut decls = vec![
        PropertyDecl::new("bag", FieldKind::Dict).policy(policy),
        PropertyDecl::new("log", FieldKind::List).policy(policy),
        PropertyDecl::new("level", FieldKind::Leaf(PropValue::Int(1)))
            .setting(PropertySetting::SERVER_TO_SHADOW | PropertySetting::FAST_SYNC),
    ];
    if shadow {
        decls = decls.into_iter().map(PropertyDecl::shadow).collect();
    }
    for decl in decls {
        tree.declare_property(decl).unwrap();
    }
}

fn mutate(tree: &mut PropertyTree) -> Result<(), PropertyError> {
    let bag = tree.root_of("bag")?;
    let log = tree.root_of("log")?;
    let level = tree.root_of("level")?;

    let sword = tree.new_composite("Item")?;
    let name = tree.field(sword, "name")?;
    tree.set_value(name, "sword")?;
    tree.dict_update(bag, "slot_1", sword)?;

    let count = tree.field(sword, "count")?;
    tree.set_value(count, 2i64)?;
    let enchantments = tree.field(sword, "enchantments")?;
    tree.list_add_value(enchantments, "fire")?;
    tree.list_add_value(enchantments, "ice")?;
    tree.list_remove_at(enchantments, 0)?;

    let shield = tree.new_composite("Item")?;
    tree.dict_update(bag, "slot_2", shield)?;
    tree.dict_remove(bag, &DictKey::from("slot_2"))?;

    for i in 0..5 {
        tree.list_add_value(log, i as i64)?;
    }
    tree.list_remove_at(log, 1)?;
    tree.list_remove_at(log, 1)?;
    let replacement = tree.new_leaf(40i64);
    tree.list_set(log, 2, replacement)?;
    let first = tree.new_leaf(-1i64);
    tree.list_insert(log, 0, first)?;

    tree.set_value(level, 7i64)?;
    Ok(())
}

fn run(keep_order: bool) -> (PropertyTree, PropertyTree, Vec<PropertySyncCommandList>) {
    let registry = registry();
    let shadow_mailbox = MailBox::new("hero", "10.0.0.5", 7100, 1);

    let mut circle = TimeCircle::new(TimeCircleConfig::default());
    let publisher = Arc::new(SyncPublisher::new(circle.handle()));
    publisher.subscribe(shadow_mailbox.clone(), SubscriberKind::Shadow);

    let mut authority = PropertyTree::new(registry.clone());
    declare(&mut authority, keep_order, false);
    authority.set_owner_all(publisher);

    let mut shadow = PropertyTree::new(registry);
    declare(&mut shadow, keep_order, true);

    mutate(&mut authority).unwrap();

    let mut batches = Vec::new();
    circle.tick(2000, |mailbox, list| {
        assert_eq!(mailbox, shadow_mailbox);
        batches.push(list);
    });
    for batch in &batches {
        assert_eq!(batch.entity_id, "hero");
        shadow.apply_sync_commands(batch).unwrap();
    }
    (authority, shadow, batches)
}

fn assert_converged(authority: &PropertyTree, shadow: &PropertyTree) {
    for name in ["bag", "log", "level"] {
        let a = authority.to_wire(authority.root_of(name).unwrap()).unwrap();
        let s = shadow.to_wire(shadow.root_of(name).unwrap()).unwrap();
        assert_eq!(a, s, "property '{name}' diverged");
    }
}

#[test]
fn shadow_converges_with_ordered_delivery() {
    let (authority, shadow, batches) = run(true);
    assert_converged(&authority, &shadow);
    // fast sync level goes out alone on the first tick
    assert_eq!(batches[0].commands.len(), 1);
    assert_eq!(batches[0].commands[0].path, vec!["level".to_string()]);
}

#[test]
fn shadow_converges_with_coalesced_delivery() {
    let (authority, shadow, batches) = run(false);
    assert_converged(&authority, &shadow);

    let ordered_total: usize = run(true).2.iter().map(|b| b.commands.len()).sum();
    let coalesced_total: usize = batches.iter().map(|b| b.commands.len()).sum();
    assert!(coalesced_total < ordered_total);
}

#[test]
fn shadow_rejects_local_writes_but_accepts_deltas() {
    let (_, mut shadow, _) = run(true);
    let level = shadow.root_of("level").unwrap();
    assert!(matches!(
        shadow.set_value(level, 1i64),
        Err(PropertyError::ShadowMutation { .. })
    ));
    assert_eq!(shadow.value(level).unwrap(), &PropValue::Int(7));
}
