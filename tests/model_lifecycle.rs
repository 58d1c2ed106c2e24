mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{basic, settings, setup};
use facet::adapter::connect;
use facet::attribute::AttributeOptions;
use facet::datatype::{Value, ValueType};
use facet::error::FacetError;
use facet::model::{Catalog, Instance, ModelBuilder};
use facet::settings::Config;

#[test]
fn create_sets_values_and_defaults() {
    let catalog = setup();
    let model = basic(&catalog);
    assert_eq!(model.model().name(), "sample");
    assert_eq!(model.get("foo").unwrap(), Value::Nil);
    assert_eq!(model.get("bar").unwrap(), Value::from("bar-value"));
    assert_eq!(model.get("status").unwrap(), Value::keyword("draft"));
    assert_eq!(model.get("tags").unwrap(), Value::set(Vec::<Value>::new()));
}

#[test]
fn change_returns_a_new_instance() {
    let catalog = setup();
    let model = basic(&catalog);
    let next = model.change(|m| m.set("foo", "new-foo-value")).unwrap();
    assert_eq!(next, model);
    assert_eq!(next.get("foo").unwrap(), Value::from("new-foo-value"));
    assert_eq!(next.get("bar").unwrap(), Value::from("bar-value"));
    // the original keeps reading its own snapshot
    assert_eq!(model.get("foo").unwrap(), Value::Nil);
    assert!(next.db().basis_t() > model.db().basis_t());
}

#[test]
fn overridden_setters_call_the_generated_one() {
    let catalog = setup();
    let model = basic(&catalog);
    let next = model.change(|m| m.set("overrideable", "x")).unwrap();
    assert_eq!(next.get("overrideable").unwrap(), Value::from("x"));
    assert_eq!(next.get("foo").unwrap(), Value::from("overridden with x"));
}

#[test]
fn unknown_keys_are_rejected() {
    let catalog = setup();
    let model = basic(&catalog);
    let err = model.change(|m| m.set("nope", "x")).unwrap_err();
    assert!(matches!(err, FacetError::UndefinedAttribute { key, .. } if key == "nope"));
    assert!(matches!(model.get("nope"), Err(FacetError::UndefinedAttribute { .. })));
}

#[test]
fn values_are_type_checked_when_set() {
    let catalog = setup();
    let model = basic(&catalog);
    let mut changer = model.changer();
    assert!(matches!(
        changer.set("foo", 42),
        Err(FacetError::TypeMismatch { .. })
    ));
    assert!(matches!(
        changer.set("status", Value::keyword("archived")),
        Err(FacetError::TypeMismatch { .. })
    ));
    assert!(!changer.is_changed());
}

#[test]
fn sets_are_diffed() {
    let catalog = setup();
    let model = catalog
        .create("sample", |m| m.set("tags", Value::set(["a", "b"])))
        .unwrap();
    let next = model.change(|m| m.set("tags", Value::set(["b", "c"]))).unwrap();
    assert_eq!(next.get("tags").unwrap(), Value::set(["b", "c"]));
    let cleared = next.change(|m| m.set("tags", Value::Nil)).unwrap();
    assert_eq!(cleared.get("tags").unwrap(), Value::set(Vec::<Value>::new()));
}

#[test]
fn setting_nil_retracts() {
    let catalog = setup();
    let model = basic(&catalog);
    let next = model.change(|m| m.set("bar", Value::Nil)).unwrap();
    assert_eq!(next.get("bar").unwrap(), Value::Nil);
}

#[test]
fn retract_removes_the_entity() {
    let catalog = setup();
    let model = basic(&catalog);
    let report = model.retract().unwrap();
    let after = facet::model::Db::new(report.db_after, catalog.clone());
    let err = model.at(&after).unwrap_err();
    assert!(matches!(err, FacetError::NotFound(id) if id == model.id()));
    // the instance itself still reads its snapshot
    assert_eq!(model.get("bar").unwrap(), Value::from("bar-value"));
}

#[test]
fn updated_at_is_the_last_transaction_time() {
    let catalog = setup();
    let before = chrono::Utc::now();
    let model = basic(&catalog);
    let updated = model.updated_at().unwrap();
    assert!(updated >= before);
    assert!(updated <= chrono::Utc::now());
}

#[test]
fn to_map_includes_the_id() {
    let catalog = setup();
    let model = basic(&catalog);
    let map = model.to_map().unwrap();
    assert_eq!(map.get("id"), Some(&Value::Id(model.id())));
    assert_eq!(map.get("bar"), Some(&Value::from("bar-value")));
    assert!(model.to_string().starts_with(&format!("#<sample {} ", model.id())));
}

#[test]
fn snapshots_as_of_earlier_transactions() {
    let catalog = setup();
    let model = basic(&catalog);
    let next = model.change(|m| m.set("foo", "later")).unwrap();
    let then = catalog.db_as_of(model.db().basis_t()).unwrap();
    assert_eq!(next.at(&then).unwrap().get("foo").unwrap(), Value::Nil);
}

fn item_catalog() -> Arc<Catalog> {
    let config = Arc::new(Config::new(settings("mem://items")));
    let connection = connect(config.settings()).unwrap();
    let item = ModelBuilder::new(&config, "item")
        .unwrap()
        .attribute_with(
            "tags",
            ValueType::set_of(ValueType::string()),
            AttributeOptions::default().default_value(Value::set(["a"])),
        )
        .unwrap()
        .attribute_with(
            "label",
            ValueType::string(),
            AttributeOptions::default().default_value("unnamed"),
        )
        .unwrap()
        .build()
        .unwrap();
    let bin = ModelBuilder::new(&config, "bin")
        .unwrap()
        .attribute("items", ValueType::set_of(ValueType::reference("item")))
        .unwrap()
        .build()
        .unwrap();
    let catalog = Catalog::builder(config, connection)
        .model(item)
        .model(bin)
        .build()
        .unwrap();
    catalog.install().unwrap();
    catalog
}

#[test]
fn new_sets_keep_elements_shared_with_the_default() {
    let catalog = item_catalog();
    let untouched = catalog.create("item", |_| Ok(())).unwrap();
    assert_eq!(untouched.get("tags").unwrap(), Value::set(["a"]));
    assert_eq!(untouched.get("label").unwrap(), Value::from("unnamed"));

    let item = catalog
        .create("item", |m| m.set("tags", Value::set(["a", "b"])))
        .unwrap();
    assert_eq!(item.get("tags").unwrap(), Value::set(["a", "b"]));

    let cleared = catalog
        .create("item", |m| {
            m.set("tags", Value::set(Vec::<Value>::new()))?;
            m.set("label", Value::Nil)
        })
        .unwrap();
    assert_eq!(cleared.get("tags").unwrap(), Value::set(Vec::<Value>::new()));
    assert_eq!(cleared.get("label").unwrap(), Value::Nil);
}

#[test]
fn instances_are_identified_by_entity_id() {
    let catalog = item_catalog();
    let item = catalog.create("item", |_| Ok(())).unwrap();
    let db = catalog.db().unwrap();
    let bin = Arc::clone(catalog.model("bin").unwrap());
    let same_entity = Instance::new(bin, item.id(), db);
    assert_eq!(Value::Ref(item.clone()), Value::Ref(same_entity.clone()));
    assert_eq!(item, same_entity);
    let distinct: HashSet<Instance> = [item, same_entity].into_iter().collect();
    assert_eq!(distinct.len(), 1);
}
