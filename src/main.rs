//! Walks through the modeling layer against the store named in `facet.toml`
//! (or `FACET_URI`), printing what happens along the way.
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use facet::adapter::connect;
use facet::attribute::{AttributeOptions, Unique};
use facet::datatype::{Value, ValueType};
use facet::model::{Catalog, ModelBuilder};
use facet::query::var;
use facet::settings::{Config, Settings};
use facet::Result;

fn main() -> Result<()> {
    let path = std::env::args().nth(1);
    let settings = Settings::load(Some(path.as_deref().unwrap_or("facet")))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::new(settings));
    let connection = connect(config.settings())?;
    let person = ModelBuilder::new(&config, "person")?
        .attribute_with("name", ValueType::string(), AttributeOptions::default().unique(Unique::Identity))?
        .attribute("nicknames", ValueType::set_of(ValueType::string()))?
        .attribute("friend", ValueType::reference("person"))?
        .validate(&["name"], |scope, values| {
            if values[0].as_str().is_none_or(str::is_empty) {
                scope.invalid("is required");
            }
        })
        .build()?;
    let catalog = Catalog::builder(Arc::clone(&config), connection)
        .model(person)
        .build()?;
    catalog.install()?;

    let ada = catalog.create("person", |c| {
        c.set("name", "Ada")?;
        c.set("nicknames", Value::set(["Countess"]))
    })?;
    let charles = catalog.create("person", |c| {
        c.set("name", "Charles")?;
        c.set("friend", &ada)
    })?;
    println!("{}", ada);
    println!("{}", charles);

    match catalog.create("person", |c| c.set("name", "")) {
        Ok(_) => println!("An empty name was accepted"),
        Err(e) => println!("Rejected: {:?}", e.errors_on("name")),
    }

    let db = catalog.db()?;
    let model = catalog.model("person")?;
    let friends = db
        .find(["name", "friend-name"])
        .clause(var("p"), model.attribute("name")?, var("name"))
        .clause(var("p"), model.attribute("friend")?, var("f"))
        .clause(var("f"), model.attribute("name")?, var("friend-name"));
    for row in friends.rows()? {
        println!("{}", row?);
    }
    println!("{} people as of t={}", db.finder("person")?.all()?.len(), db.basis_t());
    Ok(())
}
