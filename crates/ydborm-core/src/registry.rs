//! Process-wide model registry.
//!
//! Maps model names and table names to [`ModelDescriptor`]s. Relationship
//! declarations refer to their targets by name, and the registry is where
//! those names are resolved.

use crate::Result;
use crate::error::{ConfigError, Error, RelationshipErrorKind};
use crate::field::FieldInfo;
use crate::instance::{AnyInstance, Instance};
use crate::model::{Model, normalize_key};
use crate::relationship::{RelationshipInfo, RelationshipKind};
use crate::row::Row;
use crate::value::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

/// A relationship declaration with its lazily resolved target.
pub struct RelationshipDescriptor {
    pub info: RelationshipInfo,
    target: OnceLock<Arc<ModelDescriptor>>,
}

impl RelationshipDescriptor {
    fn new(info: RelationshipInfo) -> Self {
        Self {
            info,
            target: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn kind(&self) -> RelationshipKind {
        self.info.kind
    }

    /// Target descriptor, if it has been resolved already.
    pub fn resolved_target(&self) -> Option<&Arc<ModelDescriptor>> {
        self.target.get()
    }
}

impl fmt::Debug for RelationshipDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipDescriptor")
            .field("info", &self.info)
            .field("resolved", &self.target.get().is_some())
            .finish()
    }
}

/// Registered, immutable description of a model.
pub struct ModelDescriptor {
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    pub fields: &'static [FieldInfo],
    pub relationships: Vec<RelationshipDescriptor>,
    type_id: TypeId,
    decode: fn(&Row) -> Result<AnyInstance>,
}

fn decode_erased<M: Model>(row: &Row) -> Result<AnyInstance> {
    Instance::<M>::from_row(row).map(|instance| instance.erase())
}

impl ModelDescriptor {
    pub fn of<M: Model>() -> Self {
        Self {
            name: M::MODEL_NAME,
            table: M::TABLE_NAME,
            primary_key: M::PRIMARY_KEY,
            fields: M::fields(),
            relationships: M::RELATIONSHIPS
                .iter()
                .copied()
                .map(RelationshipDescriptor::new)
                .collect(),
            type_id: TypeId::of::<M>(),
            decode: decode_erased::<M>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<M: Model>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Decode a row into a new detached instance of this model.
    #[allow(clippy::result_large_err)]
    pub fn decode(&self, row: &Row) -> Result<AnyInstance> {
        (self.decode)(row)
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.info.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// The single primary key column, if the key is not composite.
    pub fn single_key(&self) -> Option<&'static str> {
        match self.primary_key {
            [only] => Some(*only),
            _ => None,
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn normalize_key(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        normalize_key(self.name, self.fields, self.primary_key, values)
    }

    fn validate(&self) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(config_error(format!(
                "model '{}' declares no primary key",
                self.name
            )));
        }
        for column in self.primary_key {
            if self.field(column).is_none() {
                return Err(config_error(format!(
                    "primary key column '{}' of model '{}' is not a field",
                    column, self.name
                )));
            }
        }
        for rel in &self.relationships {
            if rel.info.kind == RelationshipKind::ManyToOne && self.field(rel.info.foreign_key).is_none()
            {
                return Err(config_error(format!(
                    "relationship '{}.{}' uses unknown foreign key '{}'",
                    self.name, rel.info.name, rel.info.foreign_key
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("relationships", &self.relationships)
            .finish_non_exhaustive()
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

#[derive(Default)]
struct RegistryMaps {
    by_name: HashMap<&'static str, Arc<ModelDescriptor>>,
    table_owner: HashMap<&'static str, &'static str>,
}

/// Name and table index of registered models.
#[derive(Default)]
pub struct ModelRegistry {
    maps: RwLock<RegistryMaps>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by sessions.
    pub fn global() -> &'static ModelRegistry {
        static GLOBAL: OnceLock<ModelRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ModelRegistry::new)
    }

    /// Register `M`, returning its descriptor.
    ///
    /// Registering the same type again returns the existing descriptor. A
    /// different type claiming a used model name or table name is a
    /// configuration error.
    #[allow(clippy::result_large_err)]
    pub fn register<M: Model>(&self) -> Result<Arc<ModelDescriptor>> {
        if let Some(existing) = self.get(M::MODEL_NAME) {
            if existing.is::<M>() {
                return Ok(existing);
            }
        }

        let descriptor = ModelDescriptor::of::<M>();
        descriptor.validate()?;

        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = maps.by_name.get(M::MODEL_NAME) {
            if existing.is::<M>() {
                return Ok(Arc::clone(existing));
            }
            return Err(config_error(format!(
                "model name '{}' is already registered by another type",
                M::MODEL_NAME
            )));
        }
        if let Some(owner) = maps.table_owner.get(M::TABLE_NAME) {
            return Err(config_error(format!(
                "table '{}' is already mapped by model '{}'",
                M::TABLE_NAME,
                owner
            )));
        }

        let descriptor = Arc::new(descriptor);
        maps.by_name.insert(M::MODEL_NAME, Arc::clone(&descriptor));
        maps.table_owner.insert(M::TABLE_NAME, M::MODEL_NAME);
        tracing::debug!(
            model = M::MODEL_NAME,
            table = M::TABLE_NAME,
            relationships = descriptor.relationships.len(),
            "Registered model"
        );
        Ok(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .get(name)
            .cloned()
    }

    pub fn get_by_table(&self, table: &str) -> Option<Arc<ModelDescriptor>> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        let name = maps.table_owner.get(table)?;
        maps.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered model names, sorted.
    pub fn models(&self) -> Vec<&'static str> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = maps.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Resolve the target of `relationship`, caching it on the descriptor.
    ///
    /// Fails with `RelationshipError` when the target name is not registered
    /// or, for `OneToMany`, when the foreign key is not a target column.
    #[allow(clippy::result_large_err)]
    pub fn resolve_target(
        &self,
        owner: &ModelDescriptor,
        relationship: &RelationshipDescriptor,
    ) -> Result<Arc<ModelDescriptor>> {
        if let Some(target) = relationship.target.get() {
            return Ok(Arc::clone(target));
        }
        let info = &relationship.info;
        let target = self.get(info.target).ok_or_else(|| {
            Error::relationship(
                RelationshipErrorKind::UnresolvedTarget,
                owner.name,
                info.name,
                format!("target model '{}' is not registered", info.target),
            )
        })?;
        if info.kind == RelationshipKind::OneToMany && target.field(info.foreign_key).is_none() {
            return Err(Error::relationship(
                RelationshipErrorKind::UnsupportedKey,
                owner.name,
                info.name,
                format!(
                    "foreign key '{}' is not a column of '{}'",
                    info.foreign_key, target.name
                ),
            ));
        }
        let _ = relationship.target.set(Arc::clone(&target));
        tracing::trace!(
            model = owner.name,
            relationship = info.name,
            target = target.name,
            "Resolved relationship target"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::{many_to_one, one_to_many};
    use crate::types::ColumnType;

    #[derive(Debug, Clone)]
    struct Author {
        id: i64,
    }

    #[derive(Debug, Clone)]
    struct Book {
        id: i64,
        author_id: i64,
    }

    #[derive(Debug, Clone)]
    struct Impostor;

    impl Model for Author {
        const MODEL_NAME: &'static str = "Author";
        const TABLE_NAME: &'static str = "authors";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];
        const RELATIONSHIPS: &'static [RelationshipInfo] =
            &[one_to_many("books", "Book", "author_id").backref("author")];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", ColumnType::Int64).primary_key(true)];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.id.into()]
        }
    }

    impl Model for Book {
        const MODEL_NAME: &'static str = "Book";
        const TABLE_NAME: &'static str = "books";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];
        const RELATIONSHIPS: &'static [RelationshipInfo] =
            &[many_to_one("author", "Author", "author_id")];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", ColumnType::Int64).primary_key(true),
                FieldInfo::new("author_id", ColumnType::Int64),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("author_id", self.author_id.into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                author_id: row.get_named("author_id")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.id.into()]
        }
    }

    impl Model for Impostor {
        const MODEL_NAME: &'static str = "Author";
        const TABLE_NAME: &'static str = "impostors";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", ColumnType::Int64).primary_key(true)];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", Value::Int64(0))]
        }

        fn from_row(_row: &Row) -> Result<Self> {
            Ok(Self)
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![Value::Int64(0)]
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ModelRegistry::new();
        let a = registry.register::<Author>().unwrap();
        let b = registry.register::<Author>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.models(), vec!["Author"]);
        assert!(registry.get_by_table("authors").unwrap().is::<Author>());
    }

    #[test]
    fn test_conflicting_name_is_config_error() {
        let registry = ModelRegistry::new();
        registry.register::<Author>().unwrap();
        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_target_resolves_on_first_use() {
        let registry = ModelRegistry::new();
        let author = registry.register::<Author>().unwrap();
        let books = author.relationship("books").unwrap();

        // Declared before the target exists: resolution fails at use time
        let err = registry.resolve_target(&author, books).unwrap_err();
        assert_eq!(
            err.relationship_kind(),
            Some(RelationshipErrorKind::UnresolvedTarget)
        );
        assert!(books.resolved_target().is_none());

        registry.register::<Book>().unwrap();
        let target = registry.resolve_target(&author, books).unwrap();
        assert_eq!(target.name, "Book");
        assert!(books.resolved_target().is_some());
    }

    #[test]
    fn test_decode_builds_detached_instance() {
        let descriptor = ModelDescriptor::of::<Book>();
        let row = Row::from_pairs([("id", Value::Int64(4)), ("author_id", Value::Int64(1))]);
        let any = descriptor.decode(&row).unwrap();
        assert_eq!(any.model_name(), "Book");
        assert!(!any.is_attached());
        assert_eq!(descriptor.single_key(), Some("id"));
    }
}
