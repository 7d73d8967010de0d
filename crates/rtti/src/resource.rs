//! Resource identity and deferred resolution.
//!
//! Resources referenced externally are identified by a 128-bit id plus a
//! class name. Loading a file never resolves them directly; each import
//! becomes a [`ResourcePromise`] that an out-of-scope resource loader
//! fulfills later.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::object::ObjectRef;
use crate::strings::StringId;

/// Persistent 128-bit resource identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new(uuid: Uuid) -> ResourceId {
        ResourceId(uuid)
    }

    pub fn generate() -> ResourceId {
        ResourceId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> ResourceId {
        ResourceId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parses both braced (`{…}`) and plain hyphenated forms.
    pub fn parse(text: &str) -> Option<ResourceId> {
        Uuid::parse_str(text.trim()).ok().map(ResourceId)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.braced())
    }
}

/// Class-qualified external reference form of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub id: ResourceId,
    pub class: StringId,
}

impl ResourceKey {
    pub fn new(id: ResourceId, class: StringId) -> ResourceKey {
        ResourceKey { id, class }
    }
}

/// A deferred, atomically fulfillable handle to a resource. Until
/// fulfilled, resolution yields `None`; the first `fulfill` wins.
pub struct ResourcePromise {
    key: ResourceKey,
    path: Option<String>,
    fulfilled: AtomicBool,
    cell: Mutex<Option<ObjectRef>>,
}

pub type ResourcePromiseRef = Arc<ResourcePromise>;

impl ResourcePromise {
    pub fn empty(key: ResourceKey) -> ResourcePromiseRef {
        Arc::new(ResourcePromise {
            key,
            path: None,
            fulfilled: AtomicBool::new(false),
            cell: Mutex::new(None),
        })
    }

    pub fn with_path(key: ResourceKey, path: &str) -> ResourcePromiseRef {
        Arc::new(ResourcePromise {
            key,
            path: Some(path.to_string()),
            fulfilled: AtomicBool::new(false),
            cell: Mutex::new(None),
        })
    }

    /// Already-resolved promise, used when the target object is at hand.
    pub fn resolved(key: ResourceKey, object: ObjectRef) -> ResourcePromiseRef {
        let promise = ResourcePromise::empty(key);
        promise.fulfill(Some(object));
        promise
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn id(&self) -> ResourceId {
        self.key.id
    }

    pub fn class(&self) -> StringId {
        self.key.class
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn fulfilled(&self) -> bool {
        self.fulfilled.load(Ordering::Acquire)
    }

    /// Stores the resolution. Only the first call has any effect.
    pub fn fulfill(&self, object: Option<ObjectRef>) {
        let mut cell = self.cell.lock().expect("promise lock poisoned");
        if self.fulfilled.load(Ordering::Acquire) {
            return;
        }
        *cell = object;
        self.fulfilled.store(true, Ordering::Release);
    }

    /// The resolved object; `None` until fulfilled (or fulfilled to null).
    pub fn peek(&self) -> Option<ObjectRef> {
        if !self.fulfilled.load(Ordering::Acquire) {
            return None;
        }
        self.cell.lock().expect("promise lock poisoned").clone()
    }
}

impl fmt::Debug for ResourcePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourcePromise({} {}, fulfilled: {})",
            self.key.class,
            self.key.id,
            self.fulfilled()
        )
    }
}
