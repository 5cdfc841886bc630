//! The ordered registry of loaded modules.
//!
//! One record per module the host currently has mapped, in registration
//! order until the dependency sort rebuilds the chain. Every mutation runs
//! under a single process-wide recursive lock; recursion is required because
//! host loader callbacks re-enter the registry on the thread that triggered
//! the load.

use std::borrow::Cow;
use std::cell::RefCell;

use parking_lot::ReentrantMutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::{
    error::{ForklinkError, ForklinkErrorKind},
    image::ImageView,
    module::{DepState, Module, ModuleKind, PerModule},
};

pub mod engine;

mod deps;
mod replay;
mod sort;

use engine::{HostEngine, RuntimeServices};

/// Where the process is in its lifecycle. Set by the startup sequence and
/// the fork driver; classifies entry-stub invocations and gates constructor
/// and destructor work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadPhase {
    /// Primary startup; linked modules are registering.
    #[default]
    Startup,
    /// Primary initialization has finished.
    Running,
    /// Forked child; linked modules are re-registering.
    ForkStartup,
    /// Forked child; dynamically opened modules are being replayed.
    ForkReplay,
}

impl LoadPhase {
    /// True while a forked child is still being reconstructed.
    pub fn in_forkee(self) -> bool {
        matches!(self, LoadPhase::ForkStartup | LoadPhase::ForkReplay)
    }
}

pub(crate) struct RegistryInner {
    pub(crate) modules: Vec<Module>,
    pub(crate) loaded_count: usize,
    pub(crate) replay_on_fork: bool,
    pub(crate) phase: LoadPhase,
    pub(crate) foreign_host: bool,
    pub(crate) exiting: bool,
    pub(crate) dtors_armed: bool,
}

pub struct Registry {
    state: ReentrantMutex<RefCell<RegistryInner>>,
}

// SAFETY: the inner state holds raw pointers into module images; every
// access is serialized by the recursive registry lock.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(RegistryInner {
                modules: Vec::new(),
                loaded_count: 0,
                replay_on_fork: false,
                phase: LoadPhase::default(),
                foreign_host: false,
                exiting: false,
                dtors_armed: false,
            })),
        }
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&RegistryInner) -> R) -> R {
        let guard = self.state.lock();
        let r = f(&*guard.borrow());
        r
    }

    pub(crate) fn with_inner_mut<R>(&self, f: impl FnOnce(&mut RegistryInner) -> R) -> R {
        let guard = self.state.lock();
        let r = f(&mut *guard.borrow_mut());
        r
    }

    pub fn phase(&self) -> LoadPhase {
        self.with_inner(|inner| inner.phase)
    }

    pub fn set_phase(&self, phase: LoadPhase) {
        self.with_inner_mut(|inner| inner.phase = phase)
    }

    /// Mark the runtime as having been pulled into a host-native process,
    /// where no process emulation state exists to maintain.
    pub fn set_foreign_host(&self, value: bool) {
        self.with_inner_mut(|inner| inner.foreign_host = value)
    }

    /// Mark the process as exiting; detach then skips the C++ ABI finalizer
    /// (the exit sequence owns finalization) but still runs module dtors.
    pub fn set_exiting(&self, value: bool) {
        self.with_inner_mut(|inner| inner.exiting = value)
    }

    /// The `dlfork` knob: whether fork should replay dynamically opened
    /// modules into the child.
    pub fn set_replay_on_fork(&self, value: bool) {
        self.with_inner_mut(|inner| inner.replay_on_fork = value)
    }

    pub fn replay_on_fork(&self) -> bool {
        self.with_inner(|inner| inner.replay_on_fork)
    }

    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.modules.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dynamically opened modules currently registered.
    pub fn loaded_len(&self) -> usize {
        self.with_inner(|inner| inner.loaded_count)
    }

    /// Register the module at `handle`, or refresh an existing record when a
    /// forked child re-reports it.
    pub fn insert<E: HostEngine>(
        &self,
        engine: &mut E,
        handle: usize,
        meta: &PerModule,
        kind: ModuleKind,
    ) -> Result<(), ForklinkError> {
        let guard = self.state.lock();

        let raw = engine
            .module_path(handle)
            .ok_or(ForklinkErrorKind::PathResolveFail { handle })?;
        let full_path = strip_long_path_prefix(&raw).into_owned();
        let base_off = base_name_offset(&full_path);

        let mut inner = guard.borrow_mut();
        // Linked modules are loaded by basename through the host search
        // path, so only the basename identifies them; runtime opens carry
        // the full path.
        let found = match kind {
            ModuleKind::Linked => inner.find_by_base_name(&full_path[base_off..]),
            ModuleKind::Loaded => inner.find_by_full_path(&full_path),
        };

        if let Some(idx) = found {
            // Only a forked child re-reporting a module the parent recorded
            // lands here; the host never re-runs a startup trampoline for an
            // image it already has mapped.
            let m = &mut inner.modules[idx];
            if m.handle != handle {
                return Err(ForklinkErrorKind::LoadedToDifferentAddress {
                    name: full_path,
                    parent: m.handle,
                    child: handle,
                }
                .into());
            }
            if kind == ModuleKind::Linked
                && !eq_path(&full_path, &m.full_path)
                && (m.meta.data_start != meta.data_start
                    || m.meta.data_end != meta.data_end
                    || m.meta.bss_start != meta.bss_start
                    || m.meta.bss_end != meta.bss_end
                    || m.meta.ctors != meta.ctors
                    || m.meta.dtors != meta.dtors)
            {
                return Err(ForklinkErrorKind::MismatchedLinkedModule {
                    parent: m.full_path.clone(),
                    child: full_path,
                }
                .into());
            }
            // Refresh the snapshot: the tables and pointers are bound to the
            // child's copy of the image.
            m.meta = *meta;
            return Ok(());
        }

        // SAFETY: the host loader mapped and validated the image at `handle`
        // before invoking its startup trampoline.
        let view = unsafe { ImageView::from_base(handle) }?;
        let module = Module {
            preferred_base: view.preferred_base(),
            image_size: view.image_size(),
            full_path,
            base_off,
            handle,
            meta: *meta,
            ref_count: 1,
            kind,
            has_dtors: true,
            deps: SmallVec::new(),
            dep_state: DepState::default(),
        };
        debug!(
            "{}: registered at {:#x} ({:?})",
            module.base_name(),
            handle,
            kind
        );
        if kind == ModuleKind::Loaded {
            inner.loaded_count += 1;
        }
        inner.modules.push(module);
        Ok(())
    }

    /// Unregister the module whose image contains `retaddr`, running its
    /// finalizers and destructors. Quietly does nothing while a forked child
    /// is being reconstructed or before primary initialization has finished,
    /// since fork is likely failing and nothing is fully set up.
    pub fn detach<E: HostEngine, R: RuntimeServices>(
        &self,
        engine: &E,
        runtime: &mut R,
        retaddr: usize,
    ) {
        let guard = self.state.lock();

        if guard.borrow().phase != LoadPhase::Running {
            return;
        }
        let Some(region) = engine.query_region(retaddr) else {
            return;
        };

        let (module, exiting) = {
            let mut inner = guard.borrow_mut();
            let Some(idx) = inner.find_by_handle(region.alloc_base) else {
                return;
            };
            let module = inner.modules.remove(idx);
            if module.kind == ModuleKind::Loaded {
                inner.loaded_count -= 1;
            }
            (module, inner.exiting)
        };

        debug!("{}: detaching", module.base_name());
        // The record comes off the chain before its destructors run, so a
        // re-entrant detach from a destructor cannot observe a half-dead
        // record.
        if !exiting {
            runtime.finalize(module.handle);
        }
        if module.has_dtors {
            // SAFETY: the destructor table lives in the image, which stays
            // mapped until the host finishes the unload that got us here.
            unsafe { module.meta.run_dtors() };
        }
    }

    /// Run constructors and entry functions for everything registered during
    /// startup, and arm the exit-time destructor pass.
    pub fn initialize_linked(&self) {
        let guard = self.state.lock();
        let (metas, in_forkee) = {
            let mut inner = guard.borrow_mut();
            inner.dtors_armed = !inner.modules.is_empty();
            let metas: Vec<(String, PerModule)> = inner
                .modules
                .iter()
                .map(|m| (m.base_name().to_string(), m.meta))
                .collect();
            (metas, inner.phase.in_forkee())
        };
        // A forkee inherits the parent's constructed state with the copied
        // data segments; running constructors again would double-initialize.
        if in_forkee {
            return;
        }
        for (name, meta) in metas {
            // SAFETY: the tables live in images registered on this chain.
            if let Err(err) = unsafe { meta.initialize(&name) } {
                debug!("{name}: startup entry reported failure: {err}");
            }
        }
    }

    /// Run destructors for every surviving module, newest first. One-shot,
    /// and skipped entirely in a forked child that never finished coming up.
    pub fn run_exit_dtors(&self) {
        let guard = self.state.lock();
        let metas = {
            let mut inner = guard.borrow_mut();
            if inner.phase.in_forkee() || !inner.dtors_armed {
                return;
            }
            inner.dtors_armed = false;
            let mut metas = Vec::new();
            for m in inner.modules.iter_mut().rev() {
                if m.has_dtors {
                    m.has_dtors = false;
                    metas.push(m.meta);
                }
            }
            metas
        };
        for meta in metas {
            // SAFETY: images stay mapped through process exit.
            unsafe { meta.run_dtors() };
        }
    }

    /// Note another outstanding open reference to the module at `handle`.
    pub fn add_ref(&self, handle: usize) -> bool {
        self.with_inner_mut(|inner| match inner.find_by_handle(handle) {
            Some(idx) => {
                inner.modules[idx].ref_count += 1;
                true
            }
            None => false,
        })
    }

    /// Drop one open reference, returning the remaining count. Removal
    /// happens through `detach` once the host delivers the unload
    /// notification for the last reference.
    pub fn release_ref(&self, handle: usize) -> Option<usize> {
        self.with_inner_mut(|inner| {
            inner.find_by_handle(handle).map(|idx| {
                let m = &mut inner.modules[idx];
                m.ref_count = m.ref_count.saturating_sub(1);
                m.ref_count
            })
        })
    }

    /// Ordered traversal of the registry, optionally filtered by kind.
    pub fn for_each<F: FnMut(&Module)>(&self, filter: Option<ModuleKind>, mut f: F) {
        self.with_inner(|inner| {
            for m in inner.iter_kind(filter) {
                f(m);
            }
        })
    }
}

impl RegistryInner {
    pub(crate) fn find_by_full_path(&self, path: &str) -> Option<usize> {
        self.modules.iter().position(|m| eq_path(&m.full_path, path))
    }

    pub(crate) fn find_by_base_name(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| eq_path(m.base_name(), name))
    }

    pub(crate) fn find_by_handle(&self, handle: usize) -> Option<usize> {
        self.modules.iter().position(|m| m.handle == handle)
    }

    pub(crate) fn iter_kind(&self, filter: Option<ModuleKind>) -> impl Iterator<Item = &Module> {
        self.modules
            .iter()
            .filter(move |m| filter.map_or(true, |k| m.kind == k))
    }
}

/// Strip the host's long-path marker. A UNC-style marker is rewritten to a
/// leading separator pair; stripping an already-stripped path is a no-op.
pub(crate) fn strip_long_path_prefix(path: &str) -> Cow<'_, str> {
    let Some(rest) = path.strip_prefix(r"\\?\") else {
        return Cow::Borrowed(path);
    };
    match rest.strip_prefix(r"UNC\") {
        Some(unc) => Cow::Owned(format!(r"\\{unc}")),
        None => Cow::Borrowed(rest),
    }
}

/// Case-insensitive comparison, matching how the host loader treats paths.
pub(crate) fn eq_path(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

pub(crate) fn base_name_offset(path: &str) -> usize {
    path.rfind('\\').map_or(0, |i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_path_prefix_is_stripped() {
        assert_eq!(
            strip_long_path_prefix(r"\\?\C:\emu\bin\a.dll"),
            r"C:\emu\bin\a.dll"
        );
        assert_eq!(strip_long_path_prefix(r"C:\emu\bin\a.dll"), r"C:\emu\bin\a.dll");
    }

    #[test]
    fn unc_marker_becomes_leading_separator() {
        assert_eq!(
            strip_long_path_prefix(r"\\?\UNC\server\share\b.dll"),
            r"\\server\share\b.dll"
        );
    }

    #[test]
    fn stripping_is_idempotent() {
        let once = strip_long_path_prefix(r"\\?\UNC\server\share\b.dll").into_owned();
        assert_eq!(strip_long_path_prefix(&once), once);
        let once = strip_long_path_prefix(r"\\?\C:\x\y.dll").into_owned();
        assert_eq!(strip_long_path_prefix(&once), once);
    }

    #[test]
    fn path_comparison_ignores_case() {
        assert!(eq_path(r"C:\Emu\Bin\A.DLL", r"c:\emu\bin\a.dll"));
        assert!(!eq_path(r"C:\emu\a.dll", r"C:\emu\b.dll"));
    }

    #[test]
    fn base_name_follows_last_separator() {
        let path = r"C:\emu\bin\a.dll";
        assert_eq!(&path[base_name_offset(path)..], "a.dll");
        assert_eq!(base_name_offset("bare.dll"), 0);
    }
}
