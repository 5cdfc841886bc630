//! Contracts the registry consumes: the host operating system's loader and
//! virtual-memory surface, and the services of the surrounding emulation
//! runtime.

use crate::error::ForklinkError;
use crate::module::{Environ, PerModule};

bitflags::bitflags! {
    /// Flags for [`HostEngine::load_module`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Map the image without resolving anything it imports. Used to
        /// discover where the host loader wants to place an image without
        /// pulling in its dependencies.
        const NO_RESOLVE = 1;
    }
}

/// One region of the address space, as reported by the host's region query.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    /// Base of the allocation the queried address belongs to.
    pub alloc_base: usize,
    /// Base of the region itself.
    pub base: usize,
    /// Bytes from `base` to the end of the region.
    pub size: usize,
    /// Whether the region is unreserved.
    pub free: bool,
}

/// The host operating system's loader and virtual-memory calls, as the
/// registry needs them. Implementations wrap the real host API; tests
/// script one.
pub trait HostEngine {
    /// Full path of the on-disk image behind `handle`, converted from the
    /// host's wide encoding.
    fn module_path(&self, handle: usize) -> Option<String>;

    /// Examine the region of the address space containing `addr`.
    fn query_region(&self, addr: usize) -> Option<RegionInfo>;

    /// Reserve (without committing) `size` bytes at exactly `base`.
    fn reserve(&mut self, base: usize, size: usize) -> bool;

    /// Release a reservation previously made at `base`.
    fn release(&mut self, base: usize) -> bool;

    /// Load the module at `path`, returning the base address the loader
    /// chose.
    fn load_module(&mut self, path: &str, flags: LoadFlags) -> Option<usize>;

    /// Drop one host reference to the module at `handle`; the address range
    /// becomes reusable once the count reaches zero.
    fn unload_module(&mut self, handle: usize) -> bool;
}

/// Services the surrounding emulation runtime provides to the registry.
pub trait RuntimeServices {
    /// Run C++ static finalizers registered against `handle`.
    fn finalize(&mut self, handle: usize);

    /// Apply the module's pseudo-relocations.
    fn apply_pseudo_relocs(&mut self, meta: &PerModule);

    /// Check that the module was built against a compatible runtime.
    fn check_compat(&self, meta: &PerModule) -> Result<(), ForklinkError>;

    /// The shared impure pointer every module's slot is pointed at.
    fn impure_ptr(&self) -> *mut u8;

    /// The current process environment block.
    fn environ(&self) -> Environ;
}
