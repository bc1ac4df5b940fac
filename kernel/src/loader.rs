//! Program image loading seam.
//!
//! `spawn` needs the named program mapped into a fresh address space and
//! an entry point back. Real image parsing lives behind this trait; the
//! kernel core only cares about the resulting mappings.

use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::pmem::{PhysMem, PAGE_SIZE};
use crate::vm::{AddrSpace, MemPerm, RegionKind, Vaddr};

pub struct LoadedImage {
    pub entry: Vaddr,
}

pub trait ImageLoader: Send + Sync {
    /// Map program `name` into `aspace` and return its entry point.
    fn load(&self, name: &str, aspace: &mut AddrSpace, pmem: &PhysMem) -> Result<LoadedImage>;
}

/// Default load address for fixture programs.
pub const FIXTURE_BASE: Vaddr = 0x40_0000;

/// Loader backed by in-memory program blobs. Hosted builds and tests
/// register byte images by name; the bytes land in a fixed read-write
/// region and the entry point is the region base.
pub struct FixtureLoader {
    programs: crate::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl FixtureLoader {
    pub fn new() -> Self {
        FixtureLoader {
            programs: crate::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, image: &[u8]) {
        self.programs
            .lock()
            .insert(String::from(name), image.to_vec());
    }
}

impl ImageLoader for FixtureLoader {
    fn load(&self, name: &str, aspace: &mut AddrSpace, pmem: &PhysMem) -> Result<LoadedImage> {
        let programs = self.programs.lock();
        let image = programs.get(name).ok_or(Error::NotFound)?;
        let pages = (image.len().max(1)).div_ceil(PAGE_SIZE);
        let base = aspace.map_region(
            Some(FIXTURE_BASE),
            pages,
            MemPerm::URW,
            RegionKind::Fixed,
        )?;
        for (i, chunk) in image.chunks(PAGE_SIZE).enumerate() {
            let pfn = pmem.alloc()?;
            let frame = pmem.frame(pfn).expect("just allocated");
            frame.write(0, chunk);
            aspace.map_page(base + i * PAGE_SIZE, pfn, MemPerm::URW);
        }
        Ok(LoadedImage { entry: base })
    }
}

impl Default for FixtureLoader {
    fn default() -> Self {
        FixtureLoader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync;

    #[test]
    fn load_maps_the_image_bytes() {
        sync::init();
        let loader = FixtureLoader::new();
        loader.register("init", b"\x90\x90\xc3");
        let pmem = PhysMem::new();
        let mut aspace = AddrSpace::new();
        let image = loader.load("init", &mut aspace, &pmem).unwrap();
        assert_eq!(image.entry, FIXTURE_BASE);
        let mut buf = [0u8; 3];
        aspace.read_bytes(&pmem, image.entry, &mut buf).unwrap();
        assert_eq!(&buf, b"\x90\x90\xc3");
    }

    #[test]
    fn unknown_program_is_not_found() {
        sync::init();
        let loader = FixtureLoader::new();
        let pmem = PhysMem::new();
        let mut aspace = AddrSpace::new();
        assert!(matches!(
            loader.load("missing", &mut aspace, &pmem),
            Err(Error::NotFound)
        ));
    }
}
