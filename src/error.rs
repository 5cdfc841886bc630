//! Error definitions for the registry and fork-replay paths.

use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct ForklinkError {
    pub kind: ForklinkErrorKind,
    #[related]
    pub related: Vec<ForklinkError>,
}

impl ForklinkError {
    pub fn new(kind: ForklinkErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn new_collect(kind: ForklinkErrorKind, related: Vec<ForklinkError>) -> Self {
        Self { kind, related }
    }

    /// Fold an iterator of results into one parent error carrying every
    /// failure, or the collected successes.
    pub fn collect<I, T>(parent_kind: ForklinkErrorKind, it: I) -> Result<Vec<T>, ForklinkError>
    where
        I: IntoIterator<Item = Result<T, ForklinkError>>,
    {
        let (vals, errs): (Vec<T>, Vec<ForklinkError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(ForklinkError {
                kind: parent_kind,
                related: errs,
            })
        }
    }
}

impl From<ForklinkErrorKind> for ForklinkError {
    fn from(value: ForklinkErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ForklinkErrorKind {
    #[error("image at {base:#x}: optional header offset out of range")]
    MalformedImage { base: usize },
    #[error("unable to resolve image path for handle {handle:#x}")]
    PathResolveFail { handle: usize },
    #[error("{name}: loaded to different address: parent({parent:#x}) != child({child:#x})")]
    LoadedToDifferentAddress {
        name: String,
        parent: usize,
        child: usize,
    },
    #[error(
        "loaded different module with same basename in forked child, \
         parent loaded: {parent}, child loaded: {child}; the modules differ, \
         so it is not safe to run the forked child; remove the offending \
         module before trying again"
    )]
    MismatchedLinkedModule { parent: String, child: String },
    #[error("address space needed by '{name}' ({base:#x}) is already occupied")]
    AddressSpaceOccupied { name: String, base: usize },
    #[error("unable to release protective reservation for {name} ({base:#x})")]
    ReleaseReservationFail { name: String, base: usize },
    #[error("unable to create interim mapping for {path}")]
    InterimMappingFail { path: String },
    #[error("couldn't examine memory at {addr:#x} while mapping {name}")]
    RegionQueryFail { name: String, addr: usize },
    #[error("couldn't reserve memory {at:#x}({size}) for '{name}' alignment")]
    BlockadeReserveFail {
        name: String,
        at: usize,
        size: usize,
    },
    #[error("unable to block off {at:#x} to prevent {name} from loading there")]
    BlockadeFail { name: String, at: usize },
    #[error("couldn't release memory {at:#x} for '{name}' alignment")]
    BlockadeReleaseFail { name: String, at: usize },
    #[error(
        "unable to remap {name} to same address as parent ({base:#x}) - \
         try rebasing the installation"
    )]
    RetriesExhausted { name: String, base: usize },
    #[error("unable to unload interim mapping of {name}")]
    UnloadFail { name: String },
    #[error("unable to map {path}")]
    MapFail { path: String },
    #[error("unable to map {name} to same address as parent: {parent:#x} != {child:#x}")]
    MapMismatch {
        name: String,
        parent: usize,
        child: usize,
    },
    #[error("{name}: module was built against an incompatible runtime")]
    RuntimeMismatch { name: String },
    #[error("{name}: module entry function returned {status}")]
    EntryFailed { name: String, status: i32 },
    #[error("failed to enumerate dependencies for {name}")]
    DepEnumerationFail { name: String },
}
