use tracing::trace;

use crate::{
    error::{ForklinkError, ForklinkErrorKind},
    image::ImageView,
};

use super::RegistryInner;

impl RegistryInner {
    /// Append an edge for every import that is itself a registered module.
    /// Imports satisfied by host system modules are not in the registry and
    /// are not tracked.
    pub(crate) fn populate_deps(&mut self, idx: usize) -> Result<(), ForklinkError> {
        // SAFETY: the handle was mapped by the host loader when the module
        // registered.
        let view = unsafe { ImageView::from_base(self.modules[idx].handle) }.map_err(|err| {
            ForklinkError::new_collect(
                ForklinkErrorKind::DepEnumerationFail {
                    name: self.modules[idx].base_name().to_string(),
                },
                vec![err],
            )
        })?;
        for name in view.import_names() {
            if let Some(dep) = self.find_by_base_name(&name) {
                trace!("{} -> {}", self.modules[idx].base_name(), name);
                self.modules[idx].deps.push(dep);
            }
        }
        Ok(())
    }
}
