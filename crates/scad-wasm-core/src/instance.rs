//! The contract every CAD kernel instance fulfils.
//!
//! - [`WasmInstance`]: a filesystem plus an entry point taking command-line
//!   arguments and returning an exit code
//! - [`InstanceFactory`]: turns fetched module bytes into an instance
//! - [`InstanceProvider`]: hands the current instance to the render executor
//! - [`InstanceHandle`]: a non-owning reference given to callers of
//!   `initialize()`

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::module::ModuleSource;
use crate::vfs::VirtualFs;
use scad_wasm_common::ScadError;

/// An instantiated CAD kernel.
///
/// Implementations must execute `invoke` calls one at a time; the kernel is
/// not reentrant.
#[async_trait]
pub trait WasmInstance: Send + Sync {
    /// The instance's virtual filesystem.
    fn fs(&self) -> &dyn VirtualFs;

    /// Run the entry point with `args` (without the program name) and return
    /// its exit code.
    async fn invoke(&self, args: &[String]) -> Result<i32, ScadError>;
}

/// Creates instances from fetched module bytes.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    /// Instantiate the kernel. File lookups made during instantiation go
    /// through `source.locate`.
    async fn instantiate(&self, source: ModuleSource) -> Result<Arc<dyn WasmInstance>, ScadError>;
}

/// Supplies the ready instance, if any.
pub trait InstanceProvider: Send + Sync {
    /// The current instance, or `None` before initialization or after reset.
    fn current_instance(&self) -> Option<Arc<dyn WasmInstance>>;
}

/// Non-owning handle to an instance owned by the loader.
///
/// Upgrading fails once the loader has been reset.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Weak<dyn WasmInstance>,
}

impl InstanceHandle {
    /// Create a handle observing `instance`.
    pub fn new(instance: &Arc<dyn WasmInstance>) -> Self {
        Self {
            inner: Arc::downgrade(instance),
        }
    }

    /// Temporarily obtain the instance.
    pub fn upgrade(&self) -> Option<Arc<dyn WasmInstance>> {
        self.inner.upgrade()
    }

    /// Whether the loader still holds the instance.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &InstanceHandle) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    struct NoopInstance {
        fs: MemFs,
    }

    #[async_trait]
    impl WasmInstance for NoopInstance {
        fn fs(&self) -> &dyn VirtualFs {
            &self.fs
        }

        async fn invoke(&self, _args: &[String]) -> Result<i32, ScadError> {
            Ok(0)
        }
    }

    #[test]
    fn test_handle_does_not_own_instance() {
        let instance: Arc<dyn WasmInstance> = Arc::new(NoopInstance { fs: MemFs::new() });
        let handle = InstanceHandle::new(&instance);
        let other = handle.clone();

        assert!(handle.is_alive());
        assert!(handle.ptr_eq(&other));
        assert!(handle.upgrade().is_some());

        drop(instance);
        assert!(!handle.is_alive());
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn test_noop_invoke() {
        let instance = NoopInstance { fs: MemFs::new() };
        assert_eq!(tokio_test::block_on(instance.invoke(&[])), Ok(0));
        assert!(instance.fs().list_dir("/").unwrap().is_empty());
    }
}
