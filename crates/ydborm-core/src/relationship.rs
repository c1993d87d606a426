//! Relationship declarations between models.
//!
//! Declarations name their target model by string and never fail. The name is
//! resolved against the [`ModelRegistry`](crate::ModelRegistry) the first time
//! the relationship is loaded, which allows mutually-referencing models to be
//! declared in any order.

/// Cardinality of a relationship, seen from the declaring model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// The foreign key lives on the target and points at this model's key.
    OneToMany,
    /// The foreign key lives on this model and points at the target's key.
    ManyToOne,
}

impl RelationshipKind {
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany)
    }
}

/// Static description of one relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: &'static str,
    /// Registry name of the target model
    pub target: &'static str,
    pub kind: RelationshipKind,
    /// Foreign key column; on the target for `OneToMany`, on the owner for
    /// `ManyToOne`
    pub foreign_key: &'static str,
    /// Relationship on the target that points back at the owner
    pub backref: Option<&'static str>,
    /// Default ordering for collections, e.g. `"created_at DESC"`
    pub order_by: Option<&'static str>,
}

impl RelationshipInfo {
    pub const fn new(
        name: &'static str,
        target: &'static str,
        kind: RelationshipKind,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            kind,
            foreign_key,
            backref: None,
            order_by: None,
        }
    }

    pub const fn backref(mut self, name: &'static str) -> Self {
        self.backref = Some(name);
        self
    }

    pub const fn order_by(mut self, spec: &'static str) -> Self {
        self.order_by = Some(spec);
        self
    }
}

/// Declare a relationship of any kind.
pub const fn relationship(
    name: &'static str,
    target: &'static str,
    kind: RelationshipKind,
    foreign_key: &'static str,
) -> RelationshipInfo {
    RelationshipInfo::new(name, target, kind, foreign_key)
}

/// Declare a collection of targets whose `foreign_key` points at this model.
pub const fn one_to_many(
    name: &'static str,
    target: &'static str,
    foreign_key: &'static str,
) -> RelationshipInfo {
    RelationshipInfo::new(name, target, RelationshipKind::OneToMany, foreign_key)
}

/// Declare a single target referenced by this model's `foreign_key`.
pub const fn many_to_one(
    name: &'static str,
    target: &'static str,
    foreign_key: &'static str,
) -> RelationshipInfo {
    RelationshipInfo::new(name, target, RelationshipKind::ManyToOne, foreign_key)
}
