//! Relationship loading for lazy proxies and eager includes.
//!
//! Targets are resolved by name through the session's registry at first use,
//! so a relationship may name a model that is registered later. Loaded rows
//! always hydrate through the identity map.

use crate::Session;
use asupersync::{Cx, Outcome};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use ydborm_core::{
    AnyInstance, Driver, Error, Loaded, ModelDescriptor, RelationLoader, RelationshipErrorKind,
    RelationshipInfo, RelationshipKind, Result, Value,
};
use ydborm_query::{
    BoundPredicate, Predicate, SelectSpec, TableRef, compile_select, eq, in_, parse_order_spec,
};

fn unsupported_key(model: &'static str, relationship: &str, message: &str) -> Error {
    Error::relationship(
        RelationshipErrorKind::UnsupportedKey,
        model,
        relationship,
        message,
    )
}

/// SELECT over `target` filtered by one predicate, optionally in the
/// relationship's declared order (`"field [asc|desc], ..."`).
#[allow(clippy::result_large_err)]
fn related_spec(
    info: &RelationshipInfo,
    target: &ModelDescriptor,
    predicate: Predicate,
    ordered: bool,
) -> Result<SelectSpec> {
    let table = TableRef::from(target);
    let mut spec = SelectSpec::new(table);
    spec.predicates.push(BoundPredicate::bind(&table, predicate)?);
    if ordered {
        if let Some(order) = info.order_by {
            for part in order.split(',') {
                spec.order.push(parse_order_spec(&table, part)?);
            }
        }
    }
    Ok(spec)
}

/// `value` coerced to the type of `column` on `descriptor`, skipping nulls.
fn key_of(descriptor: &ModelDescriptor, column: &str, value: Option<Value>) -> Option<Value> {
    let field = descriptor.field(column)?;
    let value = value.filter(|v| !v.is_null())?;
    field.column_type.coerce(value).ok()
}

impl<D: Driver> Session<D> {
    /// Look up `relationship` on `model` and resolve its target.
    #[allow(clippy::result_large_err)]
    fn resolve_relationship(
        &self,
        model: &'static str,
        relationship: &str,
    ) -> Result<(Arc<ModelDescriptor>, RelationshipInfo, Arc<ModelDescriptor>)> {
        let owner = self.registry.get(model).ok_or_else(|| {
            Error::relationship(
                RelationshipErrorKind::UnresolvedTarget,
                model,
                relationship,
                format!("model '{model}' is not registered"),
            )
        })?;
        let declared = owner.relationship(relationship).ok_or_else(|| {
            Error::relationship(
                RelationshipErrorKind::UnknownRelationship,
                model,
                relationship,
                "no such relationship",
            )
        })?;
        let info = declared.info;
        let target = self.registry.resolve_target(&owner, declared)?;
        Ok((owner, info, target))
    }

    async fn select_related(
        &mut self,
        cx: &Cx,
        target: &ModelDescriptor,
        spec: &SelectSpec,
    ) -> Outcome<Vec<AnyInstance>, Error> {
        let rows = match self.run_statement(cx, &compile_select(spec)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut related = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.hydrate_any(target, row) {
                Ok(instance) => related.push(instance),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(related)
    }

    // ========================================================================
    // Lazy Loading
    // ========================================================================

    /// Resolve one relationship of an attached instance and store it in the
    /// instance's slot.
    #[tracing::instrument(level = "debug", skip(self, cx, owner), fields(model = owner.model_name()))]
    async fn load_relationship_impl(
        &mut self,
        cx: &Cx,
        owner: &AnyInstance,
        relationship: &str,
        expected_target: &'static str,
    ) -> Outcome<Loaded, Error> {
        let model = owner.model_name();
        match owner.owner() {
            None => {
                return Outcome::Err(Error::relationship(
                    RelationshipErrorKind::Detached,
                    model,
                    relationship,
                    "instance is not attached to a live session",
                ));
            }
            Some(id) if id != self.id => {
                return Outcome::Err(Error::relationship(
                    RelationshipErrorKind::ForeignSession,
                    model,
                    relationship,
                    format!("instance belongs to {id}, not {}", self.id),
                ));
            }
            Some(_) => {}
        }

        let (descriptor, info, target) = match self.resolve_relationship(model, relationship) {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };
        if target.name != expected_target {
            return Outcome::Err(Error::relationship(
                RelationshipErrorKind::TargetMismatch,
                model,
                relationship,
                format!(
                    "relationship targets {}, requested {}",
                    target.name, expected_target
                ),
            ));
        }

        match self.auto_flush(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let loaded = match info.kind {
            RelationshipKind::OneToMany => {
                self.lazy_children(cx, &descriptor, &info, &target, owner)
                    .await
            }
            RelationshipKind::ManyToOne => self.lazy_parent(cx, &info, &target, owner).await,
        };
        if let Outcome::Ok(value) = &loaded {
            self.stats.lazy_loads += 1;
            tracing::debug!(relationship, target = target.name, loaded = ?value, "Lazy load complete");
        }
        loaded
    }

    async fn lazy_children(
        &mut self,
        cx: &Cx,
        descriptor: &ModelDescriptor,
        info: &RelationshipInfo,
        target: &ModelDescriptor,
        owner: &AnyInstance,
    ) -> Outcome<Loaded, Error> {
        let Some(pk_column) = descriptor.single_key() else {
            return Outcome::Err(unsupported_key(
                descriptor.name,
                info.name,
                "composite primary keys cannot be followed",
            ));
        };
        let Some(key) = key_of(target, info.foreign_key, owner.value(pk_column)) else {
            return Outcome::Err(unsupported_key(
                descriptor.name,
                info.name,
                "primary key does not fit the foreign key column",
            ));
        };
        let spec = match related_spec(info, target, eq(info.foreign_key, key), true) {
            Ok(spec) => spec,
            Err(e) => return Outcome::Err(e),
        };
        let children = match self.select_related(cx, target, &spec).await {
            Outcome::Ok(children) => children,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Some(backref) = info.backref {
            for child in &children {
                child.set_slot(backref, Loaded::Parent(owner.downgrade()));
            }
        }
        let loaded = Loaded::Many(children);
        owner.set_slot(info.name, loaded.clone());
        Outcome::Ok(loaded)
    }

    async fn lazy_parent(
        &mut self,
        cx: &Cx,
        info: &RelationshipInfo,
        target: &ModelDescriptor,
        owner: &AnyInstance,
    ) -> Outcome<Loaded, Error> {
        let Some(target_pk) = target.single_key() else {
            return Outcome::Err(unsupported_key(
                owner.model_name(),
                info.name,
                "target has a composite primary key",
            ));
        };
        let Some(fk) = key_of(target, target_pk, owner.value(info.foreign_key)) else {
            // Null foreign key: nothing to load
            let loaded = Loaded::One(None);
            owner.set_slot(info.name, loaded.clone());
            return Outcome::Ok(loaded);
        };
        let spec = match related_spec(info, target, eq(target_pk, fk), false) {
            Ok(spec) => spec,
            Err(e) => return Outcome::Err(e),
        };
        let parent = match self.select_related(cx, target, &spec).await {
            Outcome::Ok(found) => found.into_iter().next(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let loaded = Loaded::One(parent);
        owner.set_slot(info.name, loaded.clone());
        Outcome::Ok(loaded)
    }

    // ========================================================================
    // Eager Loading
    // ========================================================================

    /// Load `relationship` for every parent with one batched query.
    #[tracing::instrument(level = "debug", skip(self, cx, descriptor, parents), fields(model = descriptor.name, parents = parents.len()))]
    pub(crate) async fn eager_load(
        &mut self,
        cx: &Cx,
        descriptor: &ModelDescriptor,
        relationship: &str,
        parents: &[AnyInstance],
    ) -> Outcome<(), Error> {
        if parents.is_empty() {
            return Outcome::Ok(());
        }
        let (_, info, target) = match self.resolve_relationship(descriptor.name, relationship) {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };
        let outcome = match info.kind {
            RelationshipKind::OneToMany => {
                self.include_children(cx, descriptor, &info, &target, parents)
                    .await
            }
            RelationshipKind::ManyToOne => {
                self.include_parents(cx, &info, &target, parents).await
            }
        };
        if let Outcome::Ok(()) = outcome {
            self.stats.eager_loads += 1;
        }
        outcome
    }

    async fn include_children(
        &mut self,
        cx: &Cx,
        descriptor: &ModelDescriptor,
        info: &RelationshipInfo,
        target: &ModelDescriptor,
        parents: &[AnyInstance],
    ) -> Outcome<(), Error> {
        let Some(pk_column) = descriptor.single_key() else {
            return Outcome::Err(unsupported_key(
                descriptor.name,
                info.name,
                "composite primary keys cannot be followed",
            ));
        };

        let parent_keys: Vec<Option<Value>> = parents
            .iter()
            .map(|parent| key_of(target, info.foreign_key, parent.value(pk_column)))
            .collect();
        let mut seen = HashSet::new();
        let keys: Vec<Value> = parent_keys
            .iter()
            .flatten()
            .filter(|key| seen.insert((*key).clone()))
            .cloned()
            .collect();

        let mut groups: HashMap<Value, Vec<AnyInstance>> = HashMap::new();
        if !keys.is_empty() {
            let spec = match related_spec(info, target, in_(info.foreign_key, keys), true) {
                Ok(spec) => spec,
                Err(e) => return Outcome::Err(e),
            };
            let children = match self.select_related(cx, target, &spec).await {
                Outcome::Ok(children) => children,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for child in children {
                if let Some(fk) = key_of(target, info.foreign_key, child.value(info.foreign_key)) {
                    groups.entry(fk).or_default().push(child);
                }
            }
        }

        for (parent, key) in parents.iter().zip(parent_keys) {
            let children = key
                .and_then(|key| groups.get(&key).cloned())
                .unwrap_or_default();
            if let Some(backref) = info.backref {
                for child in &children {
                    child.set_slot(backref, Loaded::Parent(parent.downgrade()));
                }
            }
            parent.set_slot(info.name, Loaded::Many(children));
        }
        Outcome::Ok(())
    }

    async fn include_parents(
        &mut self,
        cx: &Cx,
        info: &RelationshipInfo,
        target: &ModelDescriptor,
        children: &[AnyInstance],
    ) -> Outcome<(), Error> {
        let Some(target_pk) = target.single_key() else {
            return Outcome::Err(unsupported_key(
                target.name,
                info.name,
                "target has a composite primary key",
            ));
        };

        let foreign_keys: Vec<Option<Value>> = children
            .iter()
            .map(|child| key_of(target, target_pk, child.value(info.foreign_key)))
            .collect();
        let mut seen = HashSet::new();
        let keys: Vec<Value> = foreign_keys
            .iter()
            .flatten()
            .filter(|key| seen.insert((*key).clone()))
            .cloned()
            .collect();

        let mut by_key: HashMap<Value, AnyInstance> = HashMap::new();
        if !keys.is_empty() {
            let spec = match related_spec(info, target, in_(target_pk, keys), false) {
                Ok(spec) => spec,
                Err(e) => return Outcome::Err(e),
            };
            let found = match self.select_related(cx, target, &spec).await {
                Outcome::Ok(found) => found,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for parent in found {
                if let Some(key) = key_of(target, target_pk, parent.value(target_pk)) {
                    by_key.insert(key, parent);
                }
            }
        }

        for (child, fk) in children.iter().zip(foreign_keys) {
            let parent = fk.and_then(|fk| by_key.get(&fk).cloned());
            child.set_slot(info.name, Loaded::One(parent));
        }
        Outcome::Ok(())
    }
}

impl<D: Driver> RelationLoader for Session<D> {
    fn load_relationship(
        &mut self,
        cx: &Cx,
        owner: &AnyInstance,
        relationship: &str,
        expected_target: &'static str,
    ) -> impl Future<Output = Outcome<Loaded, Error>> + Send {
        self.load_relationship_impl(cx, owner, relationship, expected_target)
    }
}
