//! Thread-safe handle registry.

use super::{Handle, HandleKind};
use crate::backend::{HiveClient, Vault};
use crate::error::StructuredError;
use crate::stream::{SharedReader, SharedWriter};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

/// One live object owned by the registry.
#[derive(Clone)]
pub enum HandleObject {
    Client(Arc<dyn HiveClient>),
    Vault(Arc<dyn Vault>),
    Reader(SharedReader),
    Writer(SharedWriter),
}

impl HandleObject {
    pub fn kind(&self) -> HandleKind {
        match self {
            Self::Client(_) => HandleKind::Client,
            Self::Vault(_) => HandleKind::Vault,
            Self::Reader(_) => HandleKind::Reader,
            Self::Writer(_) => HandleKind::Writer,
        }
    }
}

/// Object refused by `allocate_owned` because its owner was released.
///
/// The object is handed back so the caller decides where it is dropped.
pub struct OwnerReleased {
    pub owner: Handle,
    pub object: HandleObject,
}

impl OwnerReleased {
    pub fn error(&self) -> StructuredError {
        StructuredError::handle_not_found(self.owner)
    }
}

impl Debug for OwnerReleased {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerReleased")
            .field("owner", &self.owner)
            .field("kind", &self.object.kind())
            .finish()
    }
}

struct Slot {
    object: HandleObject,
    /// Session that created this entry; released together with it.
    owner: Option<Handle>,
}

/// Maps opaque handles to live objects of any supported kind.
///
/// Critical sections are single map operations; backing I/O never runs
/// under the registry lock.
pub struct HandleRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<Handle, Slot>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a top-level `object` under a fresh handle.
    pub fn allocate(&self, object: HandleObject) -> Handle {
        let handle = self.next_handle();
        let kind = object.kind();
        self.write().insert(handle, Slot { object, owner: None });
        log_allocate(kind, handle);
        handle
    }

    /// Stores `object` under a fresh handle owned by `owner`.
    ///
    /// Fails without inserting when `owner` is no longer live, so nothing
    /// can be attached to a session that was already torn down.
    pub fn allocate_owned(
        &self,
        object: HandleObject,
        owner: Handle,
    ) -> Result<Handle, OwnerReleased> {
        let kind = object.kind();
        let handle = {
            let mut entries = self.write();
            if !entries.contains_key(&owner) {
                return Err(OwnerReleased { owner, object });
            }
            let handle = self.next_handle();
            entries.insert(
                handle,
                Slot {
                    object,
                    owner: Some(owner),
                },
            );
            handle
        };
        log_allocate(kind, handle);
        Ok(handle)
    }

    /// Stores a top-level object that needs to know its own handle while
    /// being built.
    ///
    /// The handle is consumed even when `build` fails.
    pub fn try_allocate_with<E>(
        &self,
        build: impl FnOnce(Handle) -> Result<HandleObject, E>,
    ) -> Result<Handle, E> {
        let handle = self.next_handle();
        let object = build(handle)?;
        let kind = object.kind();
        self.write().insert(handle, Slot { object, owner: None });
        log_allocate(kind, handle);
        Ok(handle)
    }

    /// Returns the live object for `handle` when it has the expected kind.
    pub fn resolve(
        &self,
        handle: Handle,
        expected: HandleKind,
    ) -> Result<HandleObject, StructuredError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&handle) {
            Some(slot) if slot.object.kind() == expected => Ok(slot.object.clone()),
            _ => Err(StructuredError::handle_not_found(handle)),
        }
    }

    pub fn resolve_client(&self, handle: Handle) -> Result<Arc<dyn HiveClient>, StructuredError> {
        match self.resolve(handle, HandleKind::Client)? {
            HandleObject::Client(client) => Ok(client),
            _ => Err(StructuredError::handle_not_found(handle)),
        }
    }

    pub fn resolve_vault(&self, handle: Handle) -> Result<Arc<dyn Vault>, StructuredError> {
        match self.resolve(handle, HandleKind::Vault)? {
            HandleObject::Vault(vault) => Ok(vault),
            _ => Err(StructuredError::handle_not_found(handle)),
        }
    }

    pub fn resolve_reader(&self, handle: Handle) -> Result<SharedReader, StructuredError> {
        match self.resolve(handle, HandleKind::Reader)? {
            HandleObject::Reader(reader) => Ok(reader),
            _ => Err(StructuredError::handle_not_found(handle)),
        }
    }

    pub fn resolve_writer(&self, handle: Handle) -> Result<SharedWriter, StructuredError> {
        match self.resolve(handle, HandleKind::Writer)? {
            HandleObject::Writer(writer) => Ok(writer),
            _ => Err(StructuredError::handle_not_found(handle)),
        }
    }

    /// Returns the kind of a live handle.
    pub fn kind_of(&self, handle: Handle) -> Option<HandleKind> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&handle).map(|slot| slot.object.kind())
    }

    /// Removes one entry. A second release of the same handle fails.
    pub fn release(&self, handle: Handle) -> Result<HandleObject, StructuredError> {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.remove(&handle)
        };
        match removed {
            Some(slot) => {
                debug!(
                    "event=handle_release module=handle status=ok kind={} handle={}",
                    slot.object.kind(),
                    handle
                );
                Ok(slot.object)
            }
            None => Err(StructuredError::handle_not_found(handle)),
        }
    }

    /// Releases `root` and every entry transitively owned by it.
    ///
    /// Returns released objects children first, so streams can be closed
    /// before their vault and client go away.
    pub fn release_tree(&self, root: Handle) -> Vec<(Handle, HandleObject)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut order = vec![root];
        let mut cursor = 0;
        while cursor < order.len() {
            let parent = order[cursor];
            let mut children = entries
                .iter()
                .filter(|(_, slot)| slot.owner == Some(parent))
                .map(|(handle, _)| *handle)
                .collect::<Vec<_>>();
            children.sort();
            order.extend(children);
            cursor += 1;
        }

        let released = order
            .into_iter()
            .rev()
            .filter_map(|handle| entries.remove(&handle).map(|slot| (handle, slot.object)))
            .collect::<Vec<_>>();
        debug!(
            "event=handle_release module=handle status=ok root={} released_count={}",
            root,
            released.len()
        );
        released
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_handle(&self) -> Handle {
        Handle::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Handle, Slot>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_allocate(kind: HandleKind, handle: Handle) {
    debug!(
        "event=handle_allocate module=handle status=ok kind={} handle={}",
        kind, handle
    );
}
