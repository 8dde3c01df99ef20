//! Entity definitions.
//!
//! An [`EntityDef`] describes one entity type once: its table, key, columns,
//! associations, behaviors and defaults. Definitions are registered in a
//! [`Catalog`](crate::Catalog) and shared by every model instance created
//! from them.

use relmodel_core::{ColumnDef, EntitySchema, ValidationRule, Validator};

use crate::association::{AssociationKind, AssociationSpec};
use crate::inflect;

/// Static description of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDef {
    /// Entity name, e.g. `"BlogPost"`; also the default alias.
    pub name: String,

    /// Table without prefix; `None` for a table-less entity.
    pub table: Option<String>,

    /// Table prefix overriding the datasource's prefix.
    pub table_prefix: Option<String>,

    /// Primary key column.
    pub primary_key: String,

    /// Datasource name resolved through the registry.
    pub datasource: String,

    /// Declared columns; empty means introspect the live table.
    pub schema: EntitySchema,

    /// Declared associations in declaration order.
    pub associations: Vec<(String, AssociationSpec)>,

    /// Behaviors attached to every new instance, with their settings.
    pub behaviors: Vec<(String, serde_json::Value)>,

    /// Computed columns: name -> SQL expression.
    pub virtual_fields: Vec<(String, String)>,

    /// Column used as the value of `find_list` by default.
    pub display_field: Option<String>,

    /// Default order of finds.
    pub order: Vec<String>,

    /// Field validation rules.
    pub validate: Validator,

    /// Cache read results until the next write to a read table.
    pub cache_queries: bool,

    /// Default association depth of finds.
    pub recursive: i32,
}

impl EntityDef {
    /// Entity `name` on table `tableize(name)` with key `id`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: Some(inflect::tableize(&name)),
            name,
            table_prefix: None,
            primary_key: "id".to_string(),
            datasource: "default".to_string(),
            schema: EntitySchema::default(),
            associations: Vec::new(),
            behaviors: Vec::new(),
            virtual_fields: Vec::new(),
            display_field: None,
            order: Vec::new(),
            validate: Validator::new(),
            cache_queries: false,
            recursive: 1,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Entity with no backing table (validation and behaviors only).
    pub fn without_table(mut self) -> Self {
        self.table = None;
        self
    }

    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(prefix.into());
        self
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn datasource(mut self, name: impl Into<String>) -> Self {
        self.datasource = name.into();
        self
    }

    pub fn schema(mut self, schema: EntitySchema) -> Self {
        self.schema = schema;
        self
    }

    /// Declare one column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.schema.push(column);
        self
    }

    /// Declare an association under `alias`.
    pub fn associate(mut self, alias: impl Into<String>, spec: AssociationSpec) -> Self {
        let alias = alias.into();
        self.associations.retain(|(a, _)| *a != alias);
        self.associations.push((alias, spec));
        self
    }

    /// belongsTo the entity named `alias`.
    pub fn belongs_to(self, alias: impl Into<String>) -> Self {
        self.associate(alias, AssociationSpec::belongs_to())
    }

    pub fn has_one(self, alias: impl Into<String>) -> Self {
        self.associate(alias, AssociationSpec::has_one())
    }

    pub fn has_many(self, alias: impl Into<String>) -> Self {
        self.associate(alias, AssociationSpec::has_many())
    }

    pub fn has_and_belongs_to_many(self, alias: impl Into<String>) -> Self {
        self.associate(alias, AssociationSpec::has_and_belongs_to_many())
    }

    /// Attach the behavior registered as `name` to every instance.
    pub fn behavior(mut self, name: impl Into<String>, settings: serde_json::Value) -> Self {
        self.behaviors.push((name.into(), settings));
        self
    }

    pub fn virtual_field(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let name = name.into();
        self.virtual_fields.retain(|(n, _)| *n != name);
        self.virtual_fields.push((name, sql.into()));
        self
    }

    pub fn display_field(mut self, column: impl Into<String>) -> Self {
        self.display_field = Some(column.into());
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order.push(order.into());
        self
    }

    /// Add a validation rule for `field`.
    pub fn validate(mut self, field: impl Into<String>, rule: impl Into<ValidationRule>) -> Self {
        self.validate.add(field, rule);
        self
    }

    pub fn cache_queries(mut self, enabled: bool) -> Self {
        self.cache_queries = enabled;
        self
    }

    pub fn recursive(mut self, depth: i32) -> Self {
        self.recursive = depth;
        self
    }

    /// Aliases declared with `kind`.
    pub fn associated(&self, kind: AssociationKind) -> impl Iterator<Item = &str> {
        self.associations
            .iter()
            .filter(move |(_, spec)| spec.kind == kind)
            .map(|(alias, _)| alias.as_str())
    }

    /// Table name used by naming conventions (no prefix).
    pub fn convention_table(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| inflect::tableize(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{FieldType, Rule};

    #[test]
    fn test_defaults_follow_conventions() {
        let def = EntityDef::new("BlogPost");
        assert_eq!(def.table.as_deref(), Some("blog_posts"));
        assert_eq!(def.primary_key, "id");
        assert_eq!(def.datasource, "default");
        assert_eq!(def.recursive, 1);
        assert!(def.schema.is_empty());
    }

    #[test]
    fn test_builder() {
        let def = EntityDef::new("Post")
            .column(ColumnDef::primary("id"))
            .column(ColumnDef::new("title", FieldType::String))
            .belongs_to("Author")
            .has_many("Comment")
            .associate("Author", AssociationSpec::belongs_to().class_name("User"))
            .virtual_field("shout", "UPPER(\"Post\".\"title\")")
            .validate("title", Rule::NotBlank)
            .display_field("title");
        assert_eq!(def.schema.len(), 2);
        assert_eq!(def.associations.len(), 2);
        assert_eq!(
            def.associated(AssociationKind::BelongsTo).collect::<Vec<_>>(),
            vec!["Author"]
        );
        assert_eq!(def.associations[1].1.class_name.as_deref(), Some("User"));
        assert_eq!(def.validate.fields().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn test_tableless() {
        let def = EntityDef::new("Contact").without_table();
        assert!(def.table.is_none());
        assert_eq!(def.convention_table(), "contacts");
    }
}
