//! Reconstruction of the dynamic-module set in a forked child.
//!
//! The child is a fresh host process: nothing dlopen'd by the parent exists
//! in it yet, and the host loader is free to place images anywhere. Replay
//! walks the dependency-sorted registry copied from the parent and forces
//! each module back to the parent's address, reserving address ranges to
//! keep the loader honest.

use tracing::debug;

use crate::{
    error::{ForklinkError, ForklinkErrorKind},
    module::ModuleKind,
};

use super::{
    engine::{HostEngine, LoadFlags},
    LoadPhase, Registry,
};

/// Wrong-place landings tolerated before replay gives up and directs the
/// operator to rebase.
const REPLAY_RETRY_MAX: usize = 6;

/// What the replay loop needs from one dynamically opened record,
/// snapshotted so the host loader can run without the registry borrowed.
struct ReplaySlot {
    name: String,
    path: String,
    handle: usize,
    preferred_base: usize,
    image_size: usize,
    ref_count: usize,
}

impl Registry {
    /// Pre-book every dynamically opened module's address range so nothing
    /// else can take the spot while the child comes up.
    pub fn reserve_space<E: HostEngine>(&self, engine: &mut E) -> Result<(), ForklinkError> {
        for s in self.loaded_slots() {
            if !engine.reserve(s.handle, s.image_size) {
                return Err(ForklinkErrorKind::AddressSpaceOccupied {
                    name: s.name,
                    base: s.handle,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Re-load every dynamically opened module at the address the parent
    /// recorded for it. `reserve_space` must already have run.
    pub fn load_after_fork<E: HostEngine>(&self, engine: &mut E) -> Result<(), ForklinkError> {
        let previous = self.phase();
        self.set_phase(LoadPhase::ForkReplay);
        let result = self.load_after_fork_impl(engine);
        self.set_phase(previous);
        result
    }

    fn load_after_fork_impl<E: HostEngine>(&self, engine: &mut E) -> Result<(), ForklinkError> {
        let slots = self.loaded_slots();
        self.coerce_placements(engine, &slots, 0, 0)?;
        self.realize(engine, &slots)
    }

    fn loaded_slots(&self) -> Vec<ReplaySlot> {
        self.with_inner(|inner| {
            inner
                .iter_kind(Some(ModuleKind::Loaded))
                .map(|m| ReplaySlot {
                    name: m.base_name().to_string(),
                    path: m.full_path().to_string(),
                    handle: m.handle,
                    preferred_base: m.preferred_base,
                    image_size: m.image_size,
                    ref_count: m.ref_count,
                })
                .collect()
        })
    }

    /// For each module the parent had away from its preferred base, see
    /// where the host loader wants to put it; if that is the wrong place,
    /// unload the interim mapping, blockade the wrong address, and retry.
    /// Recursion keeps every blockade placed by an outer frame alive until
    /// the whole tail of the list has settled.
    ///
    /// Modules sitting at their preferred base are skipped: the loader will
    /// honor the preference during realization, and their target range was
    /// verified free when it was reserved.
    fn coerce_placements<E: HostEngine>(
        &self,
        engine: &mut E,
        slots: &[ReplaySlot],
        from: usize,
        retries: usize,
    ) -> Result<(), ForklinkError> {
        for (idx, d) in slots.iter().enumerate().skip(from) {
            if d.handle == d.preferred_base {
                continue;
            }
            // The first attempt still holds the protective reservation over
            // the target range.
            if retries == 0 && !engine.release(d.handle) {
                return Err(ForklinkErrorKind::ReleaseReservationFail {
                    name: d.name.clone(),
                    base: d.handle,
                }
                .into());
            }
            let h = engine
                .load_module(&d.path, LoadFlags::NO_RESOLVE)
                .ok_or_else(|| ForklinkErrorKind::InterimMappingFail {
                    path: d.path.clone(),
                })?;
            if h == d.handle {
                continue;
            }
            debug!("{} loaded in wrong place: {:#x} != {:#x}", d.name, h, d.handle);
            engine.unload_module(h);
            let reservation = reserve_at(engine, &d.name, h, d.handle, d.image_size)?
                .ok_or_else(|| ForklinkErrorKind::BlockadeFail {
                    name: d.name.clone(),
                    at: h,
                })?;
            if retries < REPLAY_RETRY_MAX {
                self.coerce_placements(engine, slots, idx, retries + 1)?;
            } else {
                return Err(ForklinkErrorKind::RetriesExhausted {
                    name: d.name.clone(),
                    base: d.handle,
                }
                .into());
            }
            // Once the recursion returns, everything after this point is
            // mapped; drop this frame's blockade on the way out.
            debug!("releasing blocked space at {:#x}", reservation);
            release_at(engine, &d.name, reservation)?;
            return Ok(());
        }
        Ok(())
    }

    /// Load each module for real, after either releasing its protective
    /// reservation (well-behaved modules) or unloading its interim mapping
    /// (rebased ones). The chain is in dependency order, so the loads pull
    /// in nothing outside the registry's control.
    fn realize<E: HostEngine>(
        &self,
        engine: &mut E,
        slots: &[ReplaySlot],
    ) -> Result<(), ForklinkError> {
        for d in slots {
            if d.handle == d.preferred_base {
                if !engine.release(d.handle) {
                    return Err(ForklinkErrorKind::ReleaseReservationFail {
                        name: d.name.clone(),
                        base: d.handle,
                    }
                    .into());
                }
            } else {
                // The interim mapping sits at the parent's handle, or the
                // coercion pass would have failed.
                if !engine.unload_module(d.handle) {
                    return Err(ForklinkErrorKind::UnloadFail {
                        name: d.name.clone(),
                    }
                    .into());
                }
            }
            let h = engine
                .load_module(&d.path, LoadFlags::empty())
                .ok_or_else(|| ForklinkErrorKind::MapFail {
                    path: d.path.clone(),
                })?;
            if h != d.handle {
                return Err(ForklinkErrorKind::MapMismatch {
                    name: d.name.clone(),
                    parent: d.handle,
                    child: h,
                }
                .into());
            }
            // Bring the host's reference count up to the parent's.
            for _ in 1..d.ref_count {
                engine.load_module(&d.path, LoadFlags::empty());
            }
        }
        Ok(())
    }
}

/// Reserve the free region starting at `here`, taking care never to cover a
/// byte of the target range, which often overlaps it.
fn reserve_at<E: HostEngine>(
    engine: &mut E,
    name: &str,
    here: usize,
    target_base: usize,
    target_size: usize,
) -> Result<Option<usize>, ForklinkError> {
    let region = engine
        .query_region(here)
        .ok_or_else(|| ForklinkErrorKind::RegionQueryFail {
            name: name.to_string(),
            addr: here,
        })?;
    if !region.free {
        return Ok(None);
    }

    let mut start = here;
    let mut end = region.base + region.size;
    let target_end = target_base + target_size;
    if target_base < start && target_end > start {
        // The target straddles our left edge.
        start = target_end;
    } else if target_base >= start && target_base < end {
        // The target overlaps partly or fully to our right.
        end = target_base;
    }
    let Some(size) = end.checked_sub(start).filter(|&s| s > 0) else {
        return Ok(None);
    };
    if !engine.reserve(start, size) {
        return Err(ForklinkErrorKind::BlockadeReserveFail {
            name: name.to_string(),
            at: start,
            size,
        }
        .into());
    }
    Ok(Some(start))
}

/// Release a blockade previously placed by `reserve_at`.
fn release_at<E: HostEngine>(
    engine: &mut E,
    name: &str,
    here: usize,
) -> Result<(), ForklinkError> {
    if !engine.release(here) {
        return Err(ForklinkErrorKind::BlockadeReleaseFail {
            name: name.to_string(),
            at: here,
        }
        .into());
    }
    Ok(())
}
