mod common;

use std::sync::Arc;

use common::setup;
use facet::datatype::{Value, ValueType};
use facet::error::FacetError;
use facet::model::{Catalog, Db, Instance};
use facet::query::{Row, var};

struct Fixture {
    catalog: Arc<Catalog>,
    one: Instance,
    two: Instance,
    db: Db,
}

fn fixture() -> Fixture {
    let catalog = setup();
    let one = catalog.create("sample", |m| m.set("foo", "one")).unwrap();
    let two = catalog
        .create("sample", |m| {
            m.set("foo", "two")?;
            m.set("parent", &one)
        })
        .unwrap();
    let db = catalog.db().unwrap();
    Fixture { catalog, one, two, db }
}

#[test]
fn queries() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let results = f
        .db
        .find(["e"])
        .clause(var("e"), sample.attribute("foo").unwrap(), "one")
        .instances()
        .unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.model().name(), "sample");
    assert_eq!(result.get("foo").unwrap(), Value::from("one"));
    assert_eq!(result.id(), f.one.id());
    assert_eq!(result.db(), &f.db);
}

#[test]
fn binds_variables() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let results = f
        .db
        .find(["v"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("v"))
        .clause(var("e"), sample.attribute("parent").unwrap(), var("p"))
        .clause(var("p"), sample.attribute("foo").unwrap(), "one")
        .to_vec()
        .unwrap();
    assert_eq!(results, vec![Row::Value(Value::from("two"))]);
}

#[test]
fn binds_multiple_results() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let results = f
        .db
        .find(["e", "v"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("v"))
        .clause(var("e"), sample.attribute("parent").unwrap(), var("p"))
        .clause(var("p"), sample.attribute("foo").unwrap(), "one")
        .to_vec()
        .unwrap();
    assert_eq!(results.len(), 1);
    match &results[0] {
        Row::Map(cells) => {
            assert_eq!(cells.keys().collect::<Vec<_>>(), vec!["e", "v"]);
            assert_eq!(cells["v"], Value::from("two"));
            assert_eq!(cells["e"].ref_id(), Some(f.two.id()));
        }
        other => panic!("expected a map row, got {}", other),
    }
}

#[test]
fn raw_clauses() {
    let f = fixture();
    let results = f
        .db
        .find([("e", ValueType::reference("sample"))])
        .raw_clause(r#"?e rie.sample/foo "one""#)
        .instances()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id(), f.one.id());
}

#[test]
fn binds_inputs() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let query = f
        .db
        .find(["e"])
        .inputs(["foo"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("foo"));
    assert_eq!(query.free_vars(), vec![var("foo")]);
    let bound = query.with([("foo", "one")]);
    assert!(bound.free_vars().is_empty());
    let results = bound.instances().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id(), f.one.id());
    // the unbound query is untouched
    assert!(matches!(
        query.to_vec(),
        Err(FacetError::UnboundVariable(vars)) if vars == vec!["foo"]
    ));
}

#[test]
fn free_vars_shrink_as_inputs_are_bound() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let query = f
        .db
        .find(["e"])
        .inputs(["foo", "parent"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("foo"))
        .clause(var("e"), sample.attribute("parent").unwrap(), var("parent"));
    assert_eq!(query.free_vars(), vec![var("foo"), var("parent")]);

    let half = query.with([("foo", "two")]);
    assert_eq!(half.free_vars(), vec![var("parent")]);
    assert!(matches!(
        half.to_vec(),
        Err(FacetError::UnboundVariable(vars)) if vars == vec!["parent"]
    ));

    let full = half.bind("parent", &f.one);
    assert!(full.free_vars().is_empty());
    let results = full.instances().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id(), f.two.id());
}

#[test]
fn casts_reference_inputs() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let results = f
        .db
        .find(["e"])
        .inputs(["parent"])
        .clause(var("e"), sample.attribute("parent").unwrap(), var("parent"))
        .bind("parent", &f.one)
        .instances()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id(), f.two.id());
}

#[test]
fn typed_find() {
    let f = fixture();
    let results = f
        .db
        .find([("v", ValueType::string())])
        .raw_clause("[?e :rie.sample/parent ?p]")
        .raw_clause(r#"[?e :rie.sample/foo "two"]"#)
        .raw_clause("[?p :rie.sample/foo ?v]")
        .to_vec()
        .unwrap();
    assert_eq!(results, vec![Row::Value(Value::from("one"))]);
}

#[test]
fn typed_inputs() {
    let f = fixture();
    let results = f
        .db
        .find([("v", ValueType::string())])
        .typed_input("parent", ValueType::reference("sample"))
        .raw_clause("[?e :rie.sample/parent ?parent]")
        .raw_clause("[?e :rie.sample/foo ?v]")
        .with([("parent", &f.one)])
        .to_vec()
        .unwrap();
    assert_eq!(results, vec![Row::Value(Value::from("two"))]);
}

#[test]
fn or_join() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let foo = sample.attribute("foo").unwrap();
    let results = f
        .db
        .find(["e"])
        .clause(var("e"), sample.type_attribute(), sample.type_marker())
        .or_join(["e"], |q| {
            vec![
                q.clause(var("e"), foo, "one"),
                q.clause(var("e"), foo, "two"),
            ]
        })
        .instances()
        .unwrap();
    let mut ids: Vec<u64> = results.iter().map(|i| i.id()).collect();
    ids.sort();
    let mut expected = vec![f.one.id(), f.two.id()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[test]
fn not_join() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let foo = sample.attribute("foo").unwrap();
    let results = f
        .db
        .find(["e"])
        .clause(var("e"), sample.type_attribute(), sample.type_marker())
        .not_join(["e"], |q| q.clause(var("e"), foo, "one"))
        .instances()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id(), f.two.id());
}

#[test]
fn undefined_projection_fails() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let err = f
        .db
        .find(["x"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("v"))
        .to_vec()
        .unwrap_err();
    assert!(matches!(err, FacetError::UndefinedVariable(v) if v == "x"));
}

#[test]
fn variables_bound_only_inside_joins_are_undefined() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let foo = sample.attribute("foo").unwrap();
    let negated = f
        .db
        .find([("x", ValueType::string())])
        .clause(var("e"), sample.type_attribute(), sample.type_marker())
        .not_join(["e"], |q| q.clause(var("e"), foo, var("x")));
    assert!(matches!(
        negated.to_ast(),
        Err(FacetError::UndefinedVariable(v)) if v == "x"
    ));
    assert!(matches!(
        negated.to_vec(),
        Err(FacetError::UndefinedVariable(v)) if v == "x"
    ));

    let branched = f
        .db
        .find([("x", ValueType::string())])
        .clause(var("e"), sample.type_attribute(), sample.type_marker())
        .or_join(["e"], |q| {
            vec![
                q.clause(var("e"), foo, var("x")),
                q.clause(var("e"), foo, "two"),
            ]
        });
    assert!(matches!(
        branched.to_ast(),
        Err(FacetError::UndefinedVariable(v)) if v == "x"
    ));
}

#[test]
fn conflicting_types_fail() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let err = f
        .db
        .find(["v"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("v"))
        .clause(var("e"), sample.attribute("status").unwrap(), var("v"))
        .to_vec()
        .unwrap_err();
    assert!(matches!(err, FacetError::ConflictingType { var, .. } if var == "v"));
}

#[test]
fn unresolved_types_fail() {
    let f = fixture();
    let err = f
        .db
        .find(["e"])
        .raw_clause(r#"?e rie.sample/foo "one""#)
        .to_vec()
        .unwrap_err();
    assert!(matches!(err, FacetError::UnresolvedType(v) if v == "e"));
}

#[test]
fn queries_are_immutable_and_re_executable() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let base = f
        .db
        .find(["e"])
        .clause(var("e"), sample.type_attribute(), sample.type_marker());
    let narrowed = base.clause(var("e"), sample.attribute("foo").unwrap(), "one");
    assert_eq!(base.clauses().len(), 1);
    assert_eq!(narrowed.clauses().len(), 2);
    assert_eq!(base.to_vec().unwrap().len(), 2);
    assert_eq!(narrowed.to_vec().unwrap().len(), 1);
    // new facts do not leak into a query bound to an older snapshot
    f.catalog.create("sample", |m| m.set("foo", "one")).unwrap();
    assert_eq!(narrowed.to_vec().unwrap().len(), 1);
    assert_eq!(narrowed.rows().unwrap().count(), 1);
}

#[test]
fn compiled_form_renders_as_datalog() {
    let f = fixture();
    let sample = f.catalog.model("sample").unwrap();
    let ast = f
        .db
        .find(["e"])
        .inputs(["foo"])
        .clause(var("e"), sample.attribute("foo").unwrap(), var("foo"))
        .to_ast()
        .unwrap();
    assert_eq!(
        ast.to_string(),
        "[:find ?e :in $ ?foo :where [?e :rie.sample/foo ?foo]]"
    );
}
