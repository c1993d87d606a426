//! Shared instance handles and relationship slots.
//!
//! An [`Instance<M>`] is the canonical in-memory object for one row inside a
//! session. Cloning the handle is cheap and every clone observes the same
//! data, so a refresh by the identity map is visible everywhere at once.
//!
//! The owning session is recorded as a plain [`SessionId`]. Instances never
//! keep a session alive; closing or dropping the session clears the owner and
//! leaves the instance detached.

use crate::error::{Error, RelationshipErrorKind};
use crate::model::{Model, model_row, normalize_key};
use crate::row::Row;
use crate::value::Value;
use crate::{Cx, Outcome, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Identifier of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Value held by a loaded relationship slot.
#[derive(Clone)]
pub enum Loaded {
    Many(Vec<AnyInstance>),
    One(Option<AnyInstance>),
    /// Parent assigned through a backref. Held weakly so that a parent and
    /// its children do not keep each other alive.
    Parent(WeakInstance),
}

impl fmt::Debug for Loaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loaded::Many(items) => write!(f, "Many({})", items.len()),
            Loaded::One(item) => write!(f, "One({})", item.is_some()),
            Loaded::Parent(weak) => write!(f, "Parent(alive={})", weak.upgrade().is_some()),
        }
    }
}

/// State of one relationship slot on an instance.
#[derive(Debug, Clone, Default)]
pub enum SlotState {
    #[default]
    Unloaded,
    /// A proxy was handed out but nothing has been loaded yet
    Pending,
    Loaded(Loaded),
}

impl SlotState {
    pub const fn is_loaded(&self) -> bool {
        matches!(self, SlotState::Loaded(_))
    }
}

trait InstanceObject: Send + Sync {
    fn model_name(&self) -> &'static str;
    fn row(&self) -> Row;
    fn identity_key(&self) -> Result<Vec<Value>>;
    fn refresh_from(&self, row: &Row) -> Result<()>;
    fn owner(&self) -> Option<SessionId>;
    fn set_owner(&self, owner: Option<SessionId>);
    fn slots(&self) -> &Mutex<HashMap<String, SlotState>>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct InstanceInner<M: Model> {
    data: RwLock<M>,
    owner: RwLock<Option<SessionId>>,
    slots: Mutex<HashMap<String, SlotState>>,
}

impl<M: Model> InstanceObject for InstanceInner<M> {
    fn model_name(&self) -> &'static str {
        M::MODEL_NAME
    }

    fn row(&self) -> Row {
        model_row(&*self.data.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn identity_key(&self) -> Result<Vec<Value>> {
        let raw = self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .primary_key_value();
        normalize_key(M::MODEL_NAME, M::fields(), M::PRIMARY_KEY, raw)
    }

    fn refresh_from(&self, row: &Row) -> Result<()> {
        let fresh = M::from_row(row)?;
        *self.data.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    fn owner(&self) -> Option<SessionId> {
        *self.owner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_owner(&self, owner: Option<SessionId>) {
        *self.owner.write().unwrap_or_else(|e| e.into_inner()) = owner;
    }

    fn slots(&self) -> &Mutex<HashMap<String, SlotState>> {
        &self.slots
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Typed handle to a model instance.
pub struct Instance<M: Model> {
    inner: Arc<InstanceInner<M>>,
}

impl<M: Model> Clone for Instance<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model> Instance<M> {
    /// Wrap a value as a new, detached instance.
    pub fn new(model: M) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                data: RwLock::new(model),
                owner: RwLock::new(None),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn from_row(row: &Row) -> Result<Self> {
        M::from_row(row).map(Self::new)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, M> {
        self.inner.data.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutable access. Allowed on detached instances; changes reach the
    /// database only through an explicit `upsert`.
    pub fn write(&self) -> RwLockWriteGuard<'_, M> {
        self.inner.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone of the current values.
    pub fn snapshot(&self) -> M {
        self.read().clone()
    }

    /// Whether both handles refer to the same canonical instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.inner.owner()
    }

    pub fn is_attached(&self) -> bool {
        self.owner().is_some()
    }

    pub fn primary_key(&self) -> Vec<Value> {
        self.read().primary_key_value()
    }

    /// Type-erased handle sharing the same instance.
    pub fn erase(&self) -> AnyInstance {
        AnyInstance {
            inner: Arc::clone(&self.inner) as Arc<dyn InstanceObject>,
        }
    }

    /// Proxy for a collection relationship. Performs no I/O.
    pub fn related_many<T: Model>(&self, relationship: &str) -> LazyMany<T> {
        let owner = self.erase();
        owner.mark_pending(relationship);
        LazyMany {
            owner,
            relationship: relationship.to_string(),
            _target: PhantomData,
        }
    }

    /// Proxy for a single-valued relationship. Performs no I/O.
    pub fn related_one<T: Model>(&self, relationship: &str) -> LazyOne<T> {
        let owner = self.erase();
        owner.mark_pending(relationship);
        LazyOne {
            owner,
            relationship: relationship.to_string(),
            _target: PhantomData,
        }
    }
}

impl<M: Model + fmt::Debug> fmt::Debug for Instance<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("data", &*self.read())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Type-erased instance handle used by the identity map and the relationship
/// engine.
#[derive(Clone)]
pub struct AnyInstance {
    inner: Arc<dyn InstanceObject>,
}

impl AnyInstance {
    pub fn model_name(&self) -> &'static str {
        self.inner.model_name()
    }

    pub fn row(&self) -> Row {
        self.inner.row()
    }

    /// Current value of one column.
    pub fn value(&self, column: &str) -> Option<Value> {
        self.inner.row().get_by_name(column).cloned()
    }

    /// Primary key coerced to the key column types.
    #[allow(clippy::result_large_err)]
    pub fn identity_key(&self) -> Result<Vec<Value>> {
        self.inner.identity_key()
    }

    /// Replace the instance data in place with a freshly decoded row.
    #[allow(clippy::result_large_err)]
    pub fn refresh_from(&self, row: &Row) -> Result<()> {
        self.inner.refresh_from(row)
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.inner.owner()
    }

    pub fn set_owner(&self, owner: Option<SessionId>) {
        self.inner.set_owner(owner);
    }

    pub fn is_attached(&self) -> bool {
        self.owner().is_some()
    }

    pub fn slot(&self, relationship: &str) -> SlotState {
        self.lock_slots()
            .get(relationship)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_slot(&self, relationship: &str, value: Loaded) {
        self.lock_slots()
            .insert(relationship.to_string(), SlotState::Loaded(value));
    }

    /// Move an unloaded slot to `Pending`. Loaded slots are left alone.
    pub fn mark_pending(&self, relationship: &str) {
        let mut slots = self.lock_slots();
        let slot = slots.entry(relationship.to_string()).or_default();
        if matches!(slot, SlotState::Unloaded) {
            *slot = SlotState::Pending;
        }
    }

    pub fn clear_slots(&self) {
        self.lock_slots().clear();
    }

    /// Loaded collection, if the slot holds one.
    pub fn loaded_many(&self, relationship: &str) -> Option<Vec<AnyInstance>> {
        match self.slot(relationship) {
            SlotState::Loaded(Loaded::Many(items)) => Some(items),
            _ => None,
        }
    }

    /// Loaded single value, if the slot holds one. A backref parent that has
    /// been dropped counts as not loaded.
    pub fn loaded_one(&self, relationship: &str) -> Option<Option<AnyInstance>> {
        match self.slot(relationship) {
            SlotState::Loaded(Loaded::One(item)) => Some(item),
            SlotState::Loaded(Loaded::Parent(weak)) => weak.upgrade().map(Some),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &AnyInstance) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }

    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Recover the typed handle. `None` when `M` is not the instance's model.
    pub fn downcast<M: Model>(&self) -> Option<Instance<M>> {
        Arc::clone(&self.inner)
            .into_any()
            .downcast::<InstanceInner<M>>()
            .ok()
            .map(|inner| Instance { inner })
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, SlotState>> {
        self.inner.slots().lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<M: Model> From<Instance<M>> for AnyInstance {
    fn from(instance: Instance<M>) -> Self {
        instance.erase()
    }
}

impl fmt::Debug for AnyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyInstance")
            .field("model", &self.model_name())
            .field("key", &self.identity_key().ok())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Non-owning instance reference.
#[derive(Clone)]
pub struct WeakInstance {
    inner: Weak<dyn InstanceObject>,
}

impl WeakInstance {
    pub fn upgrade(&self) -> Option<AnyInstance> {
        self.inner.upgrade().map(|inner| AnyInstance { inner })
    }
}

/// Loads relationship slots on behalf of lazy proxies.
///
/// Implemented by the session, which owns the identity map and the driver.
/// The loader must store the result in the owner's slot before returning.
pub trait RelationLoader {
    /// Resolve `relationship` of `owner`.
    ///
    /// `expected_target` is the model name the caller will downcast to; a
    /// declaration that resolves to a different model is a
    /// `RelationshipError`.
    fn load_relationship(
        &mut self,
        cx: &Cx,
        owner: &AnyInstance,
        relationship: &str,
        expected_target: &'static str,
    ) -> impl Future<Output = Outcome<Loaded, Error>> + Send;
}

fn downcast_target<T: Model>(
    owner: &AnyInstance,
    relationship: &str,
    item: &AnyInstance,
) -> Result<Instance<T>> {
    item.downcast::<T>().ok_or_else(|| {
        Error::relationship(
            RelationshipErrorKind::TargetMismatch,
            owner.model_name(),
            relationship,
            format!(
                "expected {} instances, found {}",
                T::MODEL_NAME,
                item.model_name()
            ),
        )
    })
}

/// Lazy proxy for a `OneToMany` relationship.
pub struct LazyMany<T: Model> {
    owner: AnyInstance,
    relationship: String,
    _target: PhantomData<fn() -> T>,
}

impl<T: Model> LazyMany<T> {
    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    pub fn is_loaded(&self) -> bool {
        self.owner.loaded_many(&self.relationship).is_some()
    }

    /// Already-loaded items, without I/O.
    pub fn get(&self) -> Option<Vec<Instance<T>>> {
        let items = self.owner.loaded_many(&self.relationship)?;
        items
            .iter()
            .map(|item| downcast_target(&self.owner, &self.relationship, item))
            .collect::<Result<Vec<_>>>()
            .ok()
    }

    /// Load through `loader` unless already loaded.
    pub async fn load<L: RelationLoader>(
        &self,
        cx: &Cx,
        loader: &mut L,
    ) -> Outcome<Vec<Instance<T>>, Error> {
        if let Some(items) = self.get() {
            return Outcome::Ok(items);
        }
        let loaded = match loader
            .load_relationship(cx, &self.owner, &self.relationship, T::MODEL_NAME)
            .await
        {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Loaded::Many(items) = loaded else {
            return Outcome::Err(Error::relationship(
                RelationshipErrorKind::TargetMismatch,
                self.owner.model_name(),
                &self.relationship,
                "relationship is not a collection",
            ));
        };
        match items
            .iter()
            .map(|item| downcast_target(&self.owner, &self.relationship, item))
            .collect::<Result<Vec<_>>>()
        {
            Ok(items) => Outcome::Ok(items),
            Err(e) => Outcome::Err(e),
        }
    }
}

/// Lazy proxy for a `ManyToOne` relationship or a backref parent.
pub struct LazyOne<T: Model> {
    owner: AnyInstance,
    relationship: String,
    _target: PhantomData<fn() -> T>,
}

impl<T: Model> LazyOne<T> {
    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    pub fn is_loaded(&self) -> bool {
        self.owner.loaded_one(&self.relationship).is_some()
    }

    /// Already-loaded value, without I/O. `Some(None)` means loaded and empty.
    pub fn get(&self) -> Option<Option<Instance<T>>> {
        match self.owner.loaded_one(&self.relationship)? {
            Some(item) => downcast_target(&self.owner, &self.relationship, &item)
                .ok()
                .map(Some),
            None => Some(None),
        }
    }

    /// Load through `loader` unless already loaded.
    pub async fn load<L: RelationLoader>(
        &self,
        cx: &Cx,
        loader: &mut L,
    ) -> Outcome<Option<Instance<T>>, Error> {
        if let Some(value) = self.get() {
            return Outcome::Ok(value);
        }
        let loaded = match loader
            .load_relationship(cx, &self.owner, &self.relationship, T::MODEL_NAME)
            .await
        {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let item = match loaded {
            Loaded::One(item) => item,
            Loaded::Parent(weak) => weak.upgrade(),
            Loaded::Many(_) => {
                return Outcome::Err(Error::relationship(
                    RelationshipErrorKind::TargetMismatch,
                    self.owner.model_name(),
                    &self.relationship,
                    "relationship is a collection",
                ));
            }
        };
        match item {
            Some(item) => match downcast_target(&self.owner, &self.relationship, &item) {
                Ok(instance) => Outcome::Ok(Some(instance)),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(None),
        }
    }
}
