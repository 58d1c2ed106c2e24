mod common;

use std::sync::Arc;

use common::{settings, setup};
use facet::adapter::connect;
use facet::datatype::{Codec, CodecRegistry, Value, ValueType, Wire};
use facet::error::{FacetError, Result};
use facet::model::{Catalog, Db, ModelBuilder};
use facet::settings::Config;

/// Lower-cased strings that must contain an `@`.
struct EmailCodec;

impl Codec for EmailCodec {
    fn data_type(&self) -> String {
        String::from("email")
    }
    fn dump(&self, value: &Value) -> Result<Wire> {
        match value {
            Value::Nil => Ok(Wire::Nil),
            Value::String(s) if s.contains('@') => Ok(Wire::String(s.to_lowercase())),
            other => Err(FacetError::TypeMismatch {
                expected: self.data_type(),
                found: other.to_string(),
            }),
        }
    }
    fn load(&self, wire: &Wire, _db: &Db) -> Result<Value> {
        match wire {
            Wire::Nil => Ok(Value::Nil),
            Wire::String(s) => Ok(Value::String(s.clone())),
            other => Err(FacetError::TypeMismatch {
                expected: self.data_type(),
                found: other.to_string(),
            }),
        }
    }
}

#[test]
fn unknown_types_fail_at_definition() {
    let config = Arc::new(Config::new(settings("mem://codecs")));
    let err = ModelBuilder::new(&config, "user")
        .unwrap()
        .attribute("email", ValueType::scalar("email"))
        .err()
        .unwrap();
    assert!(matches!(err, FacetError::UnknownType(tag) if tag == "email"));
}

#[test]
fn defaults_must_match_the_type() {
    let config = Arc::new(Config::new(settings("mem://codecs")));
    let err = ModelBuilder::new(&config, "user")
        .unwrap()
        .attribute_with(
            "age",
            ValueType::long(),
            facet::attribute::AttributeOptions::default().default_value("old"),
        )
        .err()
        .unwrap();
    assert!(matches!(err, FacetError::TypeMismatch { .. }));
}

#[test]
fn registered_codecs_are_used_both_ways() {
    let mut codecs = CodecRegistry::new();
    codecs.register("email", Arc::new(EmailCodec));
    let config = Arc::new(Config::with_codecs(settings("mem://codecs"), codecs));
    let connection = connect(config.settings()).unwrap();
    let user = ModelBuilder::new(&config, "user")
        .unwrap()
        .attribute("email", ValueType::scalar("email"))
        .unwrap()
        .attribute("aliases", ValueType::set_of(ValueType::scalar("email")))
        .unwrap()
        .build()
        .unwrap();
    let catalog = Catalog::builder(config, connection)
        .model(user)
        .build()
        .unwrap();
    catalog.install().unwrap();

    let mut changer = catalog.changer("user").unwrap();
    assert!(matches!(
        changer.set("email", "not-an-address"),
        Err(FacetError::TypeMismatch { .. })
    ));
    changer.set("email", "Ada@Example.org").unwrap();
    changer
        .set("aliases", Value::set(["A@x.org", "b@x.org"]))
        .unwrap();
    let user = changer.commit().unwrap();
    assert_eq!(user.get("email").unwrap(), Value::from("ada@example.org"));
    assert_eq!(user.get("aliases").unwrap(), Value::set(["a@x.org", "b@x.org"]));

    let found = user.finder().by("email", "ADA@example.org").unwrap();
    assert_eq!(found, vec![user]);
}

#[test]
fn references_must_target_known_models() {
    let config = Arc::new(Config::new(settings("mem://codecs")));
    let connection = connect(config.settings()).unwrap();
    let post = ModelBuilder::new(&config, "post")
        .unwrap()
        .attribute("author", ValueType::reference("person"))
        .unwrap()
        .build()
        .unwrap();
    let err = Catalog::builder(config, connection)
        .model(post)
        .build()
        .unwrap_err();
    assert!(matches!(err, FacetError::UndefinedModel(name) if name == "person"));
}

#[test]
fn built_in_codecs_round_trip() {
    let catalog = setup();
    let one = catalog.create("sample", |m| m.set("foo", "one")).unwrap();
    let db = catalog.db().unwrap();
    let cases: Vec<(ValueType, Vec<Value>)> = vec![
        (ValueType::string(), vec![Value::from("x"), Value::from("")]),
        (ValueType::long(), vec![Value::from(0i64), Value::from(-42i64), Value::from(i64::MAX)]),
        (ValueType::boolean(), vec![Value::from(true), Value::from(false)]),
        (ValueType::keyword(), vec![Value::keyword("draft")]),
        (ValueType::instant(), vec![Value::Instant(chrono::Utc::now())]),
        (
            ValueType::one_of([":draft", ":published"]),
            vec![Value::keyword("draft"), Value::keyword("published")],
        ),
        (ValueType::reference("sample"), vec![Value::Id(one.id()), Value::Ref(one.clone())]),
        (ValueType::any_ref(), vec![Value::Id(one.id())]),
        (
            ValueType::set_of(ValueType::string()),
            vec![Value::set(["a", "b"]), Value::set(Vec::<Value>::new())],
        ),
        (
            ValueType::set_of(ValueType::reference("sample")),
            vec![Value::set([Value::Id(one.id())])],
        ),
    ];
    for (value_type, values) in cases {
        let codec = db.codec_for(&value_type).unwrap();
        for value in values.into_iter().chain([Value::Nil]) {
            let wire = codec.dump(&value).unwrap();
            assert_eq!(codec.load(&wire, &db).unwrap(), value, "{}", value_type);
        }
    }
}

#[test]
fn sets_refuse_nil_elements() {
    let catalog = setup();
    let db = catalog.db().unwrap();
    let codec = db.codec_for(&ValueType::set_of(ValueType::string())).unwrap();
    assert_eq!(codec.dump(&Value::Nil).unwrap(), Wire::Nil);
    assert!(matches!(
        codec.dump(&Value::set([Value::Nil, Value::from("a")])),
        Err(FacetError::TypeMismatch { .. })
    ));
}
