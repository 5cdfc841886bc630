//! The trampoline every module calls on load, and the small knobs around it.

use crate::{
    error::ForklinkError,
    module::{ModuleKind, PerModule},
    registry::{
        engine::{HostEngine, RuntimeServices},
        LoadPhase, Registry,
    },
};

impl Registry {
    /// Called by every module's startup trampoline, linked or dlopen'd.
    /// Classifies the load, registers the module, and for runtime opens runs
    /// its constructors and entry function. Errors propagate to the
    /// `dlopen` layer, which surfaces them as a failed open.
    pub fn on_module_attach<E: HostEngine, R: RuntimeServices>(
        &self,
        engine: &mut E,
        runtime: &mut R,
        handle: usize,
        meta: &PerModule,
    ) -> Result<(), ForklinkError> {
        // The emulation runtime itself was pulled into a host-native
        // process; there is no process state to maintain.
        if self.with_inner(|inner| inner.foreign_host) {
            return Ok(());
        }

        // SAFETY: the slot sits in the module's data segment, mapped by the
        // load that got us called.
        unsafe {
            if !meta.impure_ptr_ptr.is_null() {
                *meta.impure_ptr_ptr = runtime.impure_ptr();
            }
        }
        runtime.apply_pseudo_relocs(meta);
        runtime.check_compat(meta)?;

        // Before primary initialization finishes, and outside fork replay,
        // only modules linked into the executable can be registering.
        let phase = self.phase();
        let linked = matches!(phase, LoadPhase::Startup | LoadPhase::ForkStartup);
        let kind = if linked {
            ModuleKind::Linked
        } else {
            self.set_replay_on_fork(true);
            ModuleKind::Loaded
        };

        self.insert(engine, handle, meta, kind)?;

        // Runtime opens initialize immediately; linked modules wait for
        // `initialize_linked`, and a forkee inherits the parent's
        // constructed state.
        if !linked && !phase.in_forkee() {
            let name = self
                .with_inner(|inner| {
                    inner
                        .find_by_handle(handle)
                        .map(|idx| inner.modules[idx].base_name().to_string())
                })
                .unwrap_or_default();
            // SAFETY: the tables live in the image that just finished
            // mapping; the host loader keeps it mapped while we run.
            unsafe { meta.initialize(&name) }?;
        }
        Ok(())
    }

    /// Point every module's environment slot at the runtime's current block.
    pub fn refresh_env_pointers<R: RuntimeServices>(&self, runtime: &R) {
        let environ = runtime.environ();
        self.with_inner(|inner| {
            for m in inner.iter_kind(None) {
                // SAFETY: the slot lives in the module's data segment.
                unsafe {
                    if !m.meta.envptr.is_null() && *m.meta.envptr != environ {
                        *m.meta.envptr = environ;
                    }
                }
            }
        });
    }
}
