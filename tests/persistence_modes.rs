mod common;

use common::{sample_catalog, settings};
use facet::construct::MemoryConnection;
use facet::datatype::Value;

#[test]
fn in_memory_mode_has_no_ledger() {
    let connection = MemoryConnection::in_memory("mem://ledger");
    // No ledger head should exist (no persistence)
    assert!(connection.current_superhash().unwrap().is_none());
}

#[test]
fn file_mode_persists_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("facet.db");
    let uri = format!("file://{}", path.display());

    let (id, parent_id) = {
        let catalog = sample_catalog(settings(&uri));
        let parent = catalog.create("sample", |m| m.set("foo", "parent")).unwrap();
        let child = catalog
            .create("sample", |m| {
                m.set("foo", "child")?;
                m.set("tags", Value::set(["x", "y"]))?;
                m.set("parent", &parent)
            })
            .unwrap();
        (child.id(), parent.id())
    };

    // a second catalog over the same file sees everything again
    let catalog = sample_catalog(settings(&uri));
    let db = catalog.db().unwrap();
    assert_eq!(db.basis_t(), 2);
    let child = db.entity("sample", id).unwrap();
    assert_eq!(child.get("foo").unwrap(), Value::from("child"));
    assert_eq!(child.get("tags").unwrap(), Value::set(["x", "y"]));
    let parent = child.get("parent").unwrap().into_instance().unwrap();
    assert_eq!(parent.id(), parent_id);

    // new ids do not collide with restored ones
    let fresh = catalog.create("sample", |m| m.set("foo", "fresh")).unwrap();
    assert!(fresh.id() != id && fresh.id() != parent_id);
}

#[test]
fn file_mode_keeps_a_hash_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();
    let uri = format!("file://{}", path);

    let connection = MemoryConnection::open(&uri, path).unwrap();
    assert!(connection.current_superhash().unwrap().is_none());
    drop(connection);

    let catalog = sample_catalog(settings(&uri));
    catalog.create("sample", |m| m.set("foo", "one")).unwrap();
    catalog.create("sample", |m| m.set("foo", "two")).unwrap();
    drop(catalog);

    let reopened = MemoryConnection::open(&uri, path).unwrap();
    let head = reopened.current_superhash().unwrap();
    assert!(head.is_some(), "expected a ledger head after two transactions");
    assert_eq!(head.unwrap().len(), 64);
}
