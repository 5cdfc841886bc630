use crate::error::{ForklinkError, ForklinkErrorKind};

use super::PerModule;

impl PerModule {
    /// Run the constructor table. Constructors run back to front: slot 0 is
    /// reserved, so the pass finds the terminator and walks `n - 1` down
    /// to 1.
    pub(crate) unsafe fn run_ctors(&self) {
        if self.ctors.is_null() {
            return;
        }
        let mut n = 1;
        while (*self.ctors.add(n)).is_some() {
            n += 1;
        }
        for i in (1..n).rev() {
            if let Some(ctor) = *self.ctors.add(i) {
                ctor();
            }
        }
    }

    /// Run the destructor table, front to back from slot 1 until the
    /// terminator.
    pub(crate) unsafe fn run_dtors(&self) {
        if self.dtors.is_null() {
            return;
        }
        let mut i = 1;
        while let Some(dtor) = *self.dtors.add(i) {
            dtor();
            i += 1;
        }
    }

    /// Run constructors and the module entry function.
    pub(crate) unsafe fn initialize(&self, name: &str) -> Result<(), ForklinkError> {
        self.run_ctors();
        if let Some(main) = self.main {
            let status = main(0, core::ptr::null_mut(), core::ptr::null_mut());
            if status == 0 {
                return Err(ForklinkErrorKind::EntryFailed {
                    name: name.to_string(),
                    status,
                }
                .into());
            }
        }
        Ok(())
    }
}
