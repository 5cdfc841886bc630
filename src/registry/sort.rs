use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::{
    error::{ForklinkError, ForklinkErrorKind},
    module::{DepState, Module, ModuleKind},
};

use super::{Registry, RegistryInner};

impl Registry {
    /// Reorder the registry so dependencies precede dependents. Dynamically
    /// opened modules keep their opening order relative to each other, which
    /// is what lets a forked child replay them the way the parent opened
    /// them.
    ///
    /// The result is not kept across runs: there is no easy way to
    /// invalidate cached dependency information when a module unloads, and
    /// the sort runs at most a few times per process.
    pub fn topsort(&self) -> Result<(), ForklinkError> {
        self.with_inner_mut(|inner| inner.topsort())
    }
}

impl RegistryInner {
    pub(crate) fn topsort(&mut self) -> Result<(), ForklinkError> {
        if self.modules.is_empty() {
            return Ok(());
        }

        // Seed the chain constraint, then collect import edges.
        let mut dlopen_chain: SmallVec<[usize; 4]> = SmallVec::new();
        let mut results = Vec::with_capacity(self.modules.len());
        for idx in 0..self.modules.len() {
            if self.loaded_count > 0 && self.modules[idx].kind == ModuleKind::Loaded {
                // Every dynamically opened module depends on all modules
                // opened before it; without these edges the traversal below
                // would reverse their opening order.
                self.modules[idx].deps.extend(dlopen_chain.iter().copied());
                dlopen_chain.push(idx);
            }
            results.push(self.populate_deps(idx));
        }
        ForklinkError::collect(
            ForklinkErrorKind::DepEnumerationFail {
                name: "module chain".to_string(),
            },
            results,
        )?;

        // Rebuild the chain, walking the old order from the tail so the
        // traversal visits records in reverse discovery order.
        let mut order = Vec::with_capacity(self.modules.len());
        for idx in (0..self.modules.len()).rev() {
            self.sort_visit(idx, &mut order);
        }

        let mut slots: Vec<Option<Module>> = std::mem::take(&mut self.modules)
            .into_iter()
            .map(Some)
            .collect();
        self.modules = order.iter().map(|&idx| slots[idx].take().unwrap()).collect();

        // Tear down the edge scratch; see above for why it is not kept.
        for m in &mut self.modules {
            m.deps = SmallVec::new();
            m.dep_state = DepState::Unknown;
        }
        Ok(())
    }

    /// Append `idx`'s dependencies, then `idx` itself, to the rebuilt chain.
    /// Visited records are skipped, so a dependency cycle linearizes
    /// arbitrarily instead of recursing forever. Host system modules are
    /// known to ship cycles; user modules are expected not to.
    fn sort_visit(&mut self, idx: usize, order: &mut Vec<usize>) {
        match self.modules[idx].dep_state {
            DepState::Done => return,
            DepState::Pending => {
                warn!("{}: dependency cycle detected", self.modules[idx].base_name());
                return;
            }
            DepState::Unknown => {}
        }
        self.modules[idx].dep_state = DepState::Pending;
        let deps = self.modules[idx].deps.clone();
        for dep in deps {
            self.sort_visit(dep, order);
        }
        self.modules[idx].dep_state = DepState::Done;
        trace!("sorted: {}", self.modules[idx].base_name());
        order.push(idx);
    }
}
