//! Facet – a modeling layer over an immutable attribute store.
//!
//! The store only knows *facts*: `[entity attribute value]` triples that are
//! asserted and retracted in transactions, and read through immutable
//! snapshots. Facet puts typed models on top of that:
//! * A [`model::Model`] names an entity type and owns its attributes.
//! * An [`attribute::Attribute`] maps a local key (`first_name`) to a store
//!   key (`:app.person/first-name`) and carries a [`datatype::ValueType`].
//! * A [`datatype::Codec`] converts values between their in-memory form and
//!   what goes over the wire, checking types on the way out.
//! * A [`changer::Changer`] collects pending edits, validates them and commits
//!   them as one transaction.
//! * A [`query::Query`] is an immutable builder for datalog queries whose
//!   results are loaded back through the codecs.
//!
//! Every entity a model creates carries a type marker (`:app/type` with the
//! value `:app.type/person`), which is how finders scope lookups to a model.
//!
//! ## Modules
//! * [`datatype`] – Values, wire values, value types and their codecs.
//! * [`attribute`] – Attribute definitions and the per model registry.
//! * [`model`] – Models, the catalog, snapshots ([`model::Db`]) and instances.
//! * [`changer`] – Changesets, including nested entities.
//! * [`validator`] – Rules and validation errors.
//! * [`query`] – The query builder and its compiled form.
//! * [`finder`] – Lookups by id, by attribute and custom finders.
//! * [`adapter`] – The store seam: [`adapter::Connection`] and
//!   [`adapter::Database`].
//! * [`construct`] – The reference store: an in-memory fact index with an
//!   optional SQLite log ([`persist`]).
//! * [`engine`] – Datalog evaluation for the reference store; [`datalog`]
//!   parses raw clause text.
//! * [`settings`] – Settings loaded through the `config` crate.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use facet::adapter::connect;
//! use facet::model::{Catalog, ModelBuilder};
//! use facet::datatype::ValueType;
//! use facet::settings::{Config, Settings};
//!
//! let config = Arc::new(Config::new(Settings::default()));
//! let connection = connect(config.settings()).unwrap();
//! let person = ModelBuilder::new(&config, "person").unwrap()
//!     .attribute("name", ValueType::string()).unwrap()
//!     .build().unwrap();
//! let catalog = Catalog::builder(config, connection).model(person).build().unwrap();
//! catalog.install().unwrap();
//! let alice = catalog.create("person", |c| c.set("name", "Alice")).unwrap();
//! assert_eq!(alice.get("name").unwrap().as_str(), Some("Alice"));
//! let found = catalog.db().unwrap().finder("person").unwrap().by("name", "Alice").unwrap();
//! assert_eq!(found, vec![alice]);
//! ```
//!
//! ## Logging
//! Everything logs through `tracing`; install a subscriber (the binary uses
//! `tracing_subscriber` with an `EnvFilter`) to see commits, rejections and
//! executed queries.

pub mod adapter;
pub mod attribute;
pub mod changer;
pub mod construct;
pub mod datalog;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod finder;
pub mod model;
pub mod persist;
pub mod query;
pub mod settings;
pub mod validator;

pub use crate::changer::Changer;
pub use crate::datatype::{Value, ValueType};
pub use crate::error::{FacetError, Result};
pub use crate::model::{Catalog, Db, Instance, ModelBuilder};
pub use crate::query::{Query, var};
