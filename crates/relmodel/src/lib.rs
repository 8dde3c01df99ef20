//! relmodel - an association-aware record mapper.
//!
//! Entities are described once with an [`EntityDef`] and registered in a
//! [`Catalog`]. A [`Model`] is a request-scoped handle on one entity: it
//! reads nested result trees across belongsTo / hasOne / hasMany /
//! hasAndBelongsToMany associations, saves nested input trees back, and
//! runs attached [`Behavior`]s around every operation.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! let registry = DatasourceRegistry::global();
//! registry.register("default", DatasourceConfig::sqlite("blog.db"));
//!
//! let catalog = Catalog::new();
//! catalog.define(EntityDef::new("Post").belongs_to("User").has_many("Comment"));
//! catalog.define(EntityDef::new("User"));
//! catalog.define(EntityDef::new("Comment").belongs_to("Post"));
//!
//! let mut post = catalog.model("Post")?;
//! let saved = post.save_associated(
//!     Tree::single("Post", record! { "title" => "Hello" })
//!         .with_many("Comment", vec![record! { "comment" => "First" }]),
//!     SaveAllOptions::new(),
//! )?;
//!
//! let found = post.find_first(
//!     FindOptions::new().conditions(Expr::field_is("Post.title", "Hello")),
//! )?;
//! ```
//!
//! # Crates
//!
//! - `relmodel-core`: values, rows, schemas, validation, the `Connection` trait and errors
//! - `relmodel-query`: SQL expressions, statement builders and the query cache
//! - `relmodel-schema`: live-table introspection and schema diffs
//! - `relmodel-datasource`: the named datasource registry
//! - `relmodel-sqlite`: the SQLite driver

pub mod association;
pub mod behavior;
pub mod catalog;
pub mod delete;
pub mod entity;
pub mod find;
pub mod inflect;
pub mod model;
pub mod save;
pub mod timestamp;
pub mod tree;

pub use association::{
    AssociationKind, AssociationRegistry, AssociationSpec, CounterCache, ForeignKey,
};
pub use behavior::{
    Behavior, BehaviorCollection, BehaviorContext, Dispatch, HookOutcome, TriggerOptions,
};
pub use catalog::Catalog;
pub use entity::EntityDef;
pub use find::{Callbacks, FindOptions, FindResult, FindType, ListResult, Neighbors, ThreadNode};
pub use model::Model;
pub use save::{
    SaveAllInput, SaveAllOptions, SaveOptions, SaveOutcome, SaveStatus, ValidateMode,
    ValidationErrors,
};
pub use tree::{Record, Related, Tree};

pub use relmodel_core::{
    ColumnDef, Connection, Dialect, EntitySchema, Error, FieldType, On, Result, Row, Rule,
    ValidationRule, Validator, Value,
};
pub use relmodel_datasource::{DatasourceConfig, DatasourceRegistry, DriverFactory};
pub use relmodel_query::{Expr, Join, JoinType, OrderBy};
pub use relmodel_schema::{DatabaseSchema, Introspector};

/// Everything needed to define entities and run operations.
///
/// ```ignore
/// use relmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociationKind, AssociationSpec, Behavior, BehaviorContext, Callbacks, Catalog,
        ColumnDef, DatasourceConfig, DatasourceRegistry, EntityDef, Error, Expr, FieldType,
        FindOptions, FindResult, FindType, HookOutcome, Model, Record, Related, Result, Rule,
        SaveAllInput, SaveAllOptions, SaveOptions, SaveOutcome, Tree, ValidateMode, Value,
        record,
    };
}
