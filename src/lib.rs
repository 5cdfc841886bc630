//! Dynamic module registry and fork replay for a POSIX emulation layer
//! hosted on a Win32-style loader.
//!
//! The host creates processes without copy-on-write semantics, so a forked
//! child starts life as a fresh process that must re-load every dynamic
//! module at exactly the address the parent had it, or pointers copied from
//! the parent's address space would dangle. The [`registry::Registry`] tracks
//! what is loaded; the replay engine reconstructs it in the child.

pub mod error;
pub mod image;
pub mod module;
pub mod registry;

mod stub;

pub use error::*;
