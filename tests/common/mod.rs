//! Scripted host doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::ffi::c_char;
use std::ptr;

use forklink::{
    error::{ForklinkError, ForklinkErrorKind},
    module::{Environ, PerModule},
    registry::engine::{HostEngine, LoadFlags, RegionInfo, RuntimeServices},
};

/// Region size the mock reports for unreserved address space.
pub const DEFAULT_REGION_SIZE: usize = 0x10_0000;

const LFANEW: usize = 0x80;
const OPT: usize = LFANEW + 24;
const PREFERRED_BASE_FIELD: usize = OPT + 24;
const IMPORT_RVA: usize = 0x200;

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Assemble a minimal in-memory image: stub header, optional header, and an
/// import directory naming `imports`.
pub fn build_image(preferred_base: u64, image_size: u32, imports: &[&str]) -> Vec<u8> {
    let desc_bytes = (imports.len() + 1) * 20;
    let name_bytes: usize = imports.iter().map(|n| n.len() + 1).sum();
    let total = (IMPORT_RVA + desc_bytes + name_bytes).max(0x400);
    let mut buf = vec![0u8; total];

    buf[0] = b'M';
    buf[1] = b'Z';
    put_u32(&mut buf, 0x3c, LFANEW as u32);
    buf[LFANEW] = b'P';
    buf[LFANEW + 1] = b'E';
    put_u16(&mut buf, OPT, 0x20b);
    put_u64(&mut buf, PREFERRED_BASE_FIELD, preferred_base);
    put_u32(&mut buf, OPT + 56, image_size);

    if !imports.is_empty() {
        put_u32(&mut buf, OPT + 112 + 8, IMPORT_RVA as u32);
        put_u32(&mut buf, OPT + 112 + 12, desc_bytes as u32);
        let mut name_rva = IMPORT_RVA + desc_bytes;
        for (i, name) in imports.iter().enumerate() {
            put_u32(&mut buf, IMPORT_RVA + i * 20 + 12, name_rva as u32);
            buf[name_rva..name_rva + name.len()].copy_from_slice(name.as_bytes());
            name_rva += name.len() + 1;
        }
    }
    buf
}

/// Pin an image in memory; its address is the handle the mock host reports.
pub fn leak_image(buf: Vec<u8>) -> usize {
    Box::leak(buf.into_boxed_slice()).as_ptr() as usize
}

/// Like `leak_image`, but patch the preferred base to the address the image
/// actually landed at, modeling a module the parent had at its preference.
pub fn leak_image_at_home(buf: Vec<u8>) -> usize {
    let leaked: &'static mut [u8] = Box::leak(buf.into_boxed_slice());
    let addr = leaked.as_ptr() as usize;
    leaked[PREFERRED_BASE_FIELD..PREFERRED_BASE_FIELD + 8]
        .copy_from_slice(&(addr as u64).to_le_bytes());
    addr
}

pub fn blank_meta() -> PerModule {
    PerModule {
        api_major: 1,
        api_minor: 0,
        ctors: ptr::null(),
        dtors: ptr::null(),
        data_start: ptr::null_mut(),
        data_end: ptr::null_mut(),
        bss_start: ptr::null_mut(),
        bss_end: ptr::null_mut(),
        main: None,
        impure_ptr_ptr: ptr::null_mut(),
        envptr: ptr::null_mut(),
    }
}

/// A scripted stand-in for the host loader and virtual-memory API.
///
/// Placement decisions are a script: `load_module` pops the next scripted
/// address for the path, falling back to the image's home address. Regions,
/// reservations, and per-address load counts are bookkeeping the tests
/// assert against.
#[derive(Default)]
pub struct MockHost {
    pub paths: HashMap<usize, String>,
    pub homes: HashMap<String, usize>,
    pub placements: HashMap<String, VecDeque<usize>>,
    pub reservations: HashMap<usize, usize>,
    pub regions: Vec<(usize, usize)>,
    pub occupied: Vec<(usize, usize)>,
    /// base -> (path, host load count)
    pub loaded: HashMap<usize, (String, usize)>,
    pub load_log: Vec<(String, LoadFlags, usize)>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an image for `path` and report it to the host bookkeeping.
    /// Returns the handle (the image's real address).
    pub fn install(
        &mut self,
        path: &str,
        preferred_base: u64,
        image_size: u32,
        imports: &[&str],
    ) -> usize {
        let handle = leak_image(build_image(preferred_base, image_size, imports));
        self.register(path, handle, image_size);
        handle
    }

    /// Like `install`, with the preferred base equal to the actual address.
    pub fn install_at_home(&mut self, path: &str, image_size: u32, imports: &[&str]) -> usize {
        let handle = leak_image_at_home(build_image(0, image_size, imports));
        self.register(path, handle, image_size);
        handle
    }

    fn register(&mut self, path: &str, handle: usize, image_size: u32) {
        self.paths.insert(handle, path.to_string());
        self.homes.insert(path.to_string(), handle);
        self.regions.push((handle, image_size as usize));
    }

    /// Queue the addresses the loader will "choose" for the next loads of
    /// `path`.
    pub fn script_loads(&mut self, path: &str, at: &[usize]) {
        self.placements
            .entry(path.to_string())
            .or_default()
            .extend(at.iter().copied());
    }

    pub fn load_count(&self, path: &str) -> usize {
        self.load_log.iter().filter(|(p, _, _)| p == path).count()
    }

    fn overlaps(ranges: &[(usize, usize)], base: usize, size: usize) -> bool {
        ranges.iter().any(|&(b, s)| base < b + s && b < base + size)
    }
}

impl HostEngine for MockHost {
    fn module_path(&self, handle: usize) -> Option<String> {
        self.paths.get(&handle).cloned()
    }

    fn query_region(&self, addr: usize) -> Option<RegionInfo> {
        for &(b, s) in &self.regions {
            if addr >= b && addr < b + s {
                return Some(RegionInfo {
                    alloc_base: b,
                    base: b,
                    size: s,
                    free: false,
                });
            }
        }
        for (&b, &s) in &self.reservations {
            if addr >= b && addr < b + s {
                return Some(RegionInfo {
                    alloc_base: b,
                    base: b,
                    size: s,
                    free: false,
                });
            }
        }
        Some(RegionInfo {
            alloc_base: 0,
            base: addr,
            size: DEFAULT_REGION_SIZE,
            free: true,
        })
    }

    fn reserve(&mut self, base: usize, size: usize) -> bool {
        if Self::overlaps(&self.occupied, base, size) {
            return false;
        }
        if self
            .reservations
            .iter()
            .any(|(&b, &s)| base < b + s && b < base + size)
        {
            return false;
        }
        self.reservations.insert(base, size);
        true
    }

    fn release(&mut self, base: usize) -> bool {
        self.reservations.remove(&base).is_some()
    }

    fn load_module(&mut self, path: &str, flags: LoadFlags) -> Option<usize> {
        let at = self
            .placements
            .get_mut(path)
            .and_then(|q| q.pop_front())
            .or_else(|| self.homes.get(path).copied())?;
        let entry = self
            .loaded
            .entry(at)
            .or_insert_with(|| (path.to_string(), 0));
        entry.1 += 1;
        self.load_log.push((path.to_string(), flags, at));
        Some(at)
    }

    fn unload_module(&mut self, handle: usize) -> bool {
        match self.loaded.get_mut(&handle) {
            Some(entry) => {
                entry.1 -= 1;
                if entry.1 == 0 {
                    self.loaded.remove(&handle);
                }
                true
            }
            None => false,
        }
    }
}

/// Stand-in for the emulation runtime's services.
pub struct MockRuntime {
    pub impure: *mut u8,
    pub environ: Environ,
    pub finalized: Vec<usize>,
    pub compat_ok: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            impure: Box::leak(Box::new(0u8)) as *mut u8,
            environ: Box::leak(Box::new(ptr::null_mut::<c_char>())) as Environ,
            finalized: Vec::new(),
            compat_ok: true,
        }
    }
}

impl RuntimeServices for MockRuntime {
    fn finalize(&mut self, handle: usize) {
        self.finalized.push(handle);
    }

    fn apply_pseudo_relocs(&mut self, _meta: &PerModule) {}

    fn check_compat(&self, meta: &PerModule) -> Result<(), ForklinkError> {
        if self.compat_ok && meta.api_major == 1 {
            Ok(())
        } else {
            Err(ForklinkErrorKind::RuntimeMismatch {
                name: "module".to_string(),
            }
            .into())
        }
    }

    fn impure_ptr(&self) -> *mut u8 {
        self.impure
    }

    fn environ(&self) -> Environ {
        self.environ
    }
}
