//! Typed per-frame slot registry.
//!
//! Render extensions attach their own per-frame payloads to [`FrameState`]
//! without `FrameState` knowing their types: registration hands back a typed
//! [`SlotToken`], and each of the three frame instances lazily materializes
//! an independent value from the registered factory on first access.
//!
//! Registration is a startup-time activity. Sealing is by ownership: once the
//! registry is wrapped in an `Arc` and handed to the frame factory, no `&mut`
//! access exists and no further slots can be registered.
//!
//! [`FrameState`]: crate::frame::FrameState

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) type SlotValue = Box<dyn Any + Send + Sync>;
type SlotFactory = Box<dyn Fn() -> SlotValue + Send + Sync>;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Typed capability for one registered per-frame slot.
///
/// Cheap to copy; resolves against any frame built from the same registry.
pub struct SlotToken<T> {
    registry_id: u64,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SlotToken<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotToken<T> {}

impl<T> std::fmt::Debug for SlotToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotToken")
            .field("registry_id", &self.registry_id)
            .field("index", &self.index)
            .finish()
    }
}

impl<T> SlotToken<T> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.registry_id
    }
}

/// Registry of per-frame slot factories.
///
/// Every frame instance built from the same registry carries one
/// independently-created value per registered token, so the three buffered
/// frames always share the same logical slot shape.
pub struct SlotRegistry {
    id: u64,
    factories: Vec<SlotFactory>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            factories: Vec::new(),
        }
    }

    /// Register a per-frame slot, returning its typed token.
    ///
    /// The factory runs at most once per frame instance, lazily, the first
    /// time that instance is asked for this token.
    pub fn register<T, F>(&mut self, factory: F) -> SlotToken<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let index = self.factories.len();
        self.factories.push(Box::new(move || Box::new(factory())));
        SlotToken {
            registry_id: self.id,
            index,
            _marker: PhantomData,
        }
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Run the factory for one slot.
    pub(crate) fn instantiate(&self, index: usize) -> SlotValue {
        (self.factories[index])()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
