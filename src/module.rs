//! Management of individual modules.

use std::ffi::c_char;
use std::fmt;

use smallvec::SmallVec;

mod init;

/// A global constructor or destructor.
pub type ModuleInitFn = unsafe extern "C" fn();

/// A module's entry function. A zero return reports failure.
pub type ModuleMainFn = unsafe extern "C" fn(i32, *mut *mut c_char, *mut *mut c_char) -> i32;

/// The process environment block, as modules see it.
pub type Environ = *mut *mut c_char;

/// How a module entered the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    /// Resolved by the host loader's import search at process startup.
    Linked,
    /// Opened explicitly at runtime.
    Loaded,
}

/// Visit state used while the dependency sort rebuilds the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum DepState {
    #[default]
    Unknown,
    Pending,
    Done,
}

/// Metadata block every module hands to the entry stub on load.
///
/// The tables and pointers here live inside the module image. The registry
/// stores a snapshot and refreshes it when a forked child re-registers the
/// module, since the child's copy of the image carries its own tables.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PerModule {
    pub api_major: u32,
    pub api_minor: u32,
    /// Null-terminated constructor table; slot 0 is reserved by the module's
    /// startup code and never invoked.
    pub ctors: *const Option<ModuleInitFn>,
    /// Null-terminated destructor table; slot 0 is reserved.
    pub dtors: *const Option<ModuleInitFn>,
    pub data_start: *mut u8,
    pub data_end: *mut u8,
    pub bss_start: *mut u8,
    pub bss_end: *mut u8,
    pub main: Option<ModuleMainFn>,
    /// Slot the runtime's shared impure pointer is installed into.
    pub impure_ptr_ptr: *mut *mut u8,
    /// The module's own idea of the environment block.
    pub envptr: *mut Environ,
}

/// One currently loaded module.
pub struct Module {
    pub(crate) full_path: String,
    /// Byte offset of the basename within `full_path`; equal memory,
    /// different view.
    pub(crate) base_off: usize,
    /// Host module handle; equals the virtual address of the image base.
    pub(crate) handle: usize,
    pub(crate) preferred_base: usize,
    pub(crate) image_size: usize,
    pub(crate) meta: PerModule,
    pub(crate) ref_count: usize,
    pub(crate) kind: ModuleKind,
    /// Cleared once destructors have run, so the exit pass and a late
    /// detach cannot both run them.
    pub(crate) has_dtors: bool,
    /// Dependency edges; populated by the sorter and cleared when it
    /// finishes.
    pub(crate) deps: SmallVec<[usize; 4]>,
    pub(crate) dep_state: DepState,
}

impl Module {
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    /// The path component past the last separator.
    pub fn base_name(&self) -> &str {
        &self.full_path[self.base_off..]
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn preferred_base(&self) -> usize {
        self.preferred_base
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn meta(&self) -> &PerModule {
        &self.meta
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_name())
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.base_name())
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish()
    }
}
