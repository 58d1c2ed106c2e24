#![allow(dead_code)]

use std::sync::Arc;

use facet::adapter::connect;
use facet::attribute::{AttributeOptions, Unique};
use facet::datatype::{Value, ValueType};
use facet::model::{Catalog, Instance, ModelBuilder};
use facet::settings::{Config, Settings};

pub fn settings(uri: &str) -> Settings {
    Settings {
        namespace: String::from("rie"),
        partition: String::from("test"),
        uri: uri.to_string(),
        log_level: String::from("warn"),
    }
}

/// The `sample` model every integration test works with.
pub fn sample_catalog(settings: Settings) -> Arc<Catalog> {
    let config = Arc::new(Config::new(settings));
    let connection = connect(config.settings()).unwrap();
    let sample = ModelBuilder::new(&config, "sample")
        .unwrap()
        .attribute("foo", ValueType::string())
        .unwrap()
        .attribute_with(
            "bar",
            ValueType::string(),
            AttributeOptions::default()
                .external_key("rie.sample/bar-custom-key")
                .doc("the #bar attribute"),
        )
        .unwrap()
        .attribute_with(
            "name",
            ValueType::string(),
            AttributeOptions::default().unique(Unique::Value),
        )
        .unwrap()
        .attribute("overrideable", ValueType::string())
        .unwrap()
        .attribute("parent", ValueType::reference("sample"))
        .unwrap()
        .attribute_with(
            "children",
            ValueType::set_of(ValueType::reference("sample")),
            AttributeOptions::default().external_key("rie.sample/_parent"),
        )
        .unwrap()
        .attribute("tags", ValueType::set_of(ValueType::string()))
        .unwrap()
        .attribute_with(
            "status",
            ValueType::one_of(["draft", "published"]),
            AttributeOptions::default().default_value(Value::keyword("draft")),
        )
        .unwrap()
        .override_setter("overrideable", |changer, value, base| {
            let shown = value.as_str().unwrap_or_default().to_string();
            base(changer, value)?;
            changer.set("foo", format!("overridden with {}", shown))
        })
        .unwrap()
        .finder("by_foo_and_bar", |finder, argument| {
            let text = argument.as_str().unwrap_or_default().to_string();
            let (foo, bar) = text.split_once('/').unwrap_or((text.as_str(), ""));
            finder.filter([("foo", foo), ("bar", bar)])
        })
        .validate(&["foo"], |scope, values| {
            if values[0].as_str().is_some_and(|s| s.contains("invalid")) {
                scope.invalid("must not contain the string 'invalid'");
            }
        })
        .build()
        .unwrap();
    let catalog = Catalog::builder(config, connection)
        .model(sample)
        .build()
        .unwrap();
    catalog.install().unwrap();
    catalog
}

pub fn setup() -> Arc<Catalog> {
    sample_catalog(settings("mem://fixture"))
}

/// `Sample.create! { |m| m.bar = 'bar-value' }`
pub fn basic(catalog: &Arc<Catalog>) -> Instance {
    catalog
        .create("sample", |m| m.set("bar", "bar-value"))
        .unwrap()
}
