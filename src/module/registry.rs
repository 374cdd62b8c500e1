//! Read-mostly table of named modules.
//!
//! Lookups hand out [`ModuleRef`] handles; a module is counted as referenced
//! for as long as one of its handles is alive. Removal marks the module as
//! being removed, which makes further lookups fail, and the module is purged
//! once its last handle is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::error::{LifecycleError, Result, ValidationError};
use crate::module::{ModuleKind, Named};
use crate::{debug, epoch};

type Table<M> = RwLock<Vec<Arc<Entry<M>>>>;

struct Entry<M: ?Sized> {
    name: Arc<str>,
    module: Arc<M>,
    removing: AtomicBool,
}

/// Process-wide table of modules of one [`ModuleKind`].
pub struct Registry<M: ?Sized> {
    kind: ModuleKind,
    table: Arc<Table<M>>,
    /// Module new connections start with; never removed.
    default: Mutex<Option<Arc<str>>>,
}

impl<M: ?Sized> fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("modules", &self.read().len())
            .field("default", &self.default_name())
            .finish()
    }
}

impl<M: ?Sized> Registry<M> {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Entry<M>>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Entry<M>>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the module new connections start with, if one was set.
    pub fn default_name(&self) -> Option<Arc<str>> {
        self.default
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<M> Registry<M>
where
    M: ?Sized + Named + Send + Sync + 'static,
{
    /// Creates an empty registry for modules of `kind`.
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            table: Arc::new(RwLock::new(Vec::new())),
            default: Mutex::new(None),
        }
    }

    /// Marks `name` as the default module, which [`Registry::deregister`]
    /// refuses to remove. The module does not have to be registered yet.
    pub fn set_default(&self, name: &str) {
        *self.default.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.into());
    }

    /// Kind of module held by this registry.
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Adds `module` under its own name.
    ///
    /// # Errors
    ///
    /// Returns `EEXIST` if a module with the same name is registered, even if
    /// that module is being removed.
    pub fn register(&self, module: Arc<M>) -> Result<()> {
        let mut entries = self.write();

        if entries.iter().any(|e| *e.name == *module.name()) {
            return Err(LifecycleError::Exists {
                kind: self.kind,
                name: module.name().into(),
            }
            .into());
        }

        debug!("registered {} module {:?}", self.kind, module.name());

        entries.push(Arc::new(Entry {
            name: module.name().into(),
            module,
            removing: AtomicBool::new(false),
        }));

        Ok(())
    }

    /// Looks up a module by name, returning a counted handle.
    ///
    /// # Errors
    ///
    /// Returns "not found" (`ENOENT` for behavior modules, `ESRCH` for
    /// congestion modules) if no module has that name or it is being removed.
    pub fn lookup(&self, name: &str) -> Result<ModuleRef<M>> {
        let entries = self.read();

        entries
            .iter()
            .find(|e| *e.name == *name && !e.removing.load(Ordering::Acquire))
            .map(|entry| ModuleRef {
                module: Arc::clone(&entry.module),
                entry: Some(Arc::clone(entry)),
                table: Arc::downgrade(&self.table),
            })
            .ok_or_else(|| self.not_found(name))
    }

    /// Requests removal of the named module.
    ///
    /// An unreferenced module is purged immediately. A referenced module is
    /// marked as being removed, rejects every further lookup, and is purged
    /// when its last handle is released.
    ///
    /// # Errors
    ///
    /// Returns "not found" for an unknown name and `EBUSY` while the module
    /// is still referenced or is the default.
    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut entries = self.write();

        let Some(pos) = entries.iter().position(|e| *e.name == *name) else {
            return Err(self.not_found(name));
        };

        if self.default_name().is_some_and(|default| *default == *name) {
            return Err(LifecycleError::Busy {
                kind: self.kind,
                name: name.into(),
            }
            .into());
        }

        if Arc::strong_count(&entries[pos]) == 1 {
            let entry = entries.remove(pos);
            debug!("purged {} module {:?}", self.kind, name);
            epoch::defer(move || drop(entry));
            return Ok(());
        }

        entries[pos].removing.store(true, Ordering::Release);

        Err(LifecycleError::Busy {
            kind: self.kind,
            name: name.into(),
        }
        .into())
    }

    /// Number of live handles to the named module.
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.read()
            .iter()
            .find(|e| *e.name == *name)
            .map(|e| Arc::strong_count(e) - 1)
    }

    /// Returns `true` if the named module is still in the table, including
    /// while it is being removed.
    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|e| *e.name == *name)
    }

    /// Names of the modules available for lookup, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|e| !e.removing.load(Ordering::Acquire))
            .map(|e| e.name.to_string())
            .collect()
    }

    fn not_found(&self, name: &str) -> crate::Error {
        ValidationError::UnknownModule {
            kind: self.kind,
            name: name.into(),
        }
        .into()
    }
}

/// Counted handle to a registered module.
///
/// Dropping the handle, or calling [`ModuleRef::release`], releases the
/// reference.
pub struct ModuleRef<M: ?Sized + Send + Sync + 'static> {
    module: Arc<M>,
    entry: Option<Arc<Entry<M>>>,
    table: Weak<Table<M>>,
}

impl<M: ?Sized + Send + Sync + 'static> ModuleRef<M> {
    /// The referenced module.
    pub fn module(&self) -> &Arc<M> {
        &self.module
    }

    /// Registry name of the referenced module.
    pub fn name(&self) -> &str {
        self.entry.as_ref().map_or("", |e| &e.name)
    }

    /// Returns `true` if both handles reference the same registered module.
    pub fn ptr_eq(&self, other: &ModuleRef<M>) -> bool {
        Arc::ptr_eq(&self.module, &other.module)
    }

    /// Returns `true` once removal of the module has been requested.
    pub fn is_removing(&self) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|e| e.removing.load(Ordering::Acquire))
    }

    /// Releases the reference.
    pub fn release(self) {
        drop(self);
    }
}

impl<M: ?Sized + Send + Sync + 'static> Clone for ModuleRef<M> {
    fn clone(&self) -> Self {
        Self {
            module: Arc::clone(&self.module),
            entry: self.entry.clone(),
            table: Weak::clone(&self.table),
        }
    }
}

impl<M: ?Sized + Send + Sync + 'static> fmt::Debug for ModuleRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleRef").field(&self.name()).finish()
    }
}

impl<M: ?Sized + Send + Sync + 'static> Drop for ModuleRef<M> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let Some(table) = self.table.upgrade() else {
            return;
        };

        // Common path: the count drops under the read lock so a concurrent
        // `deregister` observes either the old or the new count.
        {
            let _entries = table.read().unwrap_or_else(PoisonError::into_inner);
            if !entry.removing.load(Ordering::Acquire) {
                drop(entry);
                return;
            }
        }

        let mut entries = table.write().unwrap_or_else(PoisonError::into_inner);

        // Only the table and this handle remain.
        if Arc::strong_count(&entry) == 2 {
            entries.retain(|e| !Arc::ptr_eq(e, &entry));
            debug!("purged module {:?} after last release", &*entry.name);

            let module = Arc::clone(&self.module);
            epoch::defer(move || drop(module));
        }

        drop(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug)]
    struct Dummy(&'static str);

    impl Named for Dummy {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn registry() -> Registry<Dummy> {
        let registry = Registry::new(ModuleKind::Congestion);
        registry.register(Arc::new(Dummy("alpha"))).unwrap();
        registry.register(Arc::new(Dummy("beta"))).unwrap();
        registry
    }

    #[test]
    fn registry_lookup_valid() {
        let registry = registry();

        let handle = registry.lookup("beta").unwrap();
        assert_eq!(handle.name(), "beta");
        assert_eq!(handle.module().0, "beta");
        assert_eq!(registry.refcount("beta"), Some(1));

        let copy = handle.clone();
        assert!(copy.ptr_eq(&handle));
        assert_eq!(registry.refcount("beta"), Some(2));

        handle.release();
        drop(copy);
        assert_eq!(registry.refcount("beta"), Some(0));
    }

    #[test]
    fn registry_duplicate_invalid() {
        let registry = registry();

        let err = registry.register(Arc::new(Dummy("alpha"))).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn registry_unknown_name_invalid() {
        let registry = registry();

        let err = registry.lookup("gamma").unwrap_err();
        assert_matches!(
            err,
            crate::Error::Validation(ValidationError::UnknownModule { .. })
        );
        assert_eq!(err.errno(), libc::ESRCH);
    }

    #[test]
    fn registry_deregister_unreferenced_valid() {
        let registry = registry();

        assert!(registry.deregister("alpha").is_ok());
        assert!(!registry.contains("alpha"));
        assert_eq!(registry.names(), vec!["beta".to_string()]);
    }

    #[test]
    fn registry_deregister_waits_for_release_valid() {
        let registry = registry();
        let handle = registry.lookup("alpha").unwrap();

        let err = registry.deregister("alpha").unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);

        // Being removed: new lookups fail, existing handles keep working.
        assert!(handle.is_removing());
        assert!(registry.lookup("alpha").is_err());
        assert!(registry.contains("alpha"));
        assert_eq!(handle.module().0, "alpha");

        drop(handle);
        assert!(!registry.contains("alpha"));
    }

    #[test]
    fn registry_deregister_default_invalid() {
        let registry = registry();
        registry.set_default("alpha");

        let err = registry.deregister("alpha").unwrap_err();
        assert_matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::Busy { kind: ModuleKind::Congestion, .. })
        );
        assert_eq!(err.errno(), libc::EBUSY);

        // Refused outright: the default stays available.
        assert!(registry.lookup("alpha").is_ok());
        assert_eq!(registry.names(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn registry_concurrent_release_purges_once_valid() {
        let registry = registry();
        let handles: Vec<_> = (0..8).map(|_| registry.lookup("beta").unwrap()).collect();

        assert!(registry.deregister("beta").is_err());

        std::thread::scope(|s| {
            for handle in handles {
                s.spawn(move || drop(handle));
            }
        });

        assert!(!registry.contains("beta"));
        assert!(registry.contains("alpha"));
    }
}
