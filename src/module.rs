//! Lookup of modules the dynamic linker has already mapped into this process.

use std::ffi::{CStr, CString, c_int, c_void};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::slice;

use goblin::elf::Elf;
use memmap2::Mmap;
use tracing::debug;

use crate::err::{Error, Result};

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;

/// Opaque token for a loaded module. The loader owns the module; it is never
/// closed through this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(NonZeroUsize);

impl ModuleHandle {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }
}

/// Absolute address of a symbol, valid while its module stays loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress(NonZeroUsize);

impl SymbolAddress {
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Reinterprets the address as a function pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer matching the symbol's real signature.
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        unsafe { std::mem::transmute_copy(&self.get()) }
    }
}

/// Base and size of a section in memory. `(0, 0)` means "not available yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionDescriptor {
    base: usize,
    size: usize,
}

impl SectionDescriptor {
    pub const EMPTY: Self = Self { base: 0, size: 0 };

    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.base == 0 || self.size == 0
    }

    /// Views the section as bytes.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped readable for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.base as *const u8, self.size) }
    }
}

/// Resolves modules, symbols and sections. Implemented by [`DynamicLinker`]
/// for the live process and by fakes in tests.
pub trait ModuleResolver {
    /// Returns `None` when the module is not loaded (yet).
    fn open(&self, module: &str) -> Option<ModuleHandle>;
    fn symbol(&self, handle: ModuleHandle, symbol: &str) -> Option<SymbolAddress>;
    /// Recomputed on every call; returns [`SectionDescriptor::EMPTY`] when the
    /// module is not loaded or has no such section.
    fn section(&self, module: &str, section: &str) -> SectionDescriptor;

    fn resolve(&self, module: &str, symbol: &str) -> Result<SymbolAddress> {
        let handle = self
            .open(module)
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))?;
        self.symbol(handle, symbol)
            .ok_or_else(|| Error::SymbolNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
    }
}

/// The process's dynamic linker (`dlopen`/`dlsym`/`dl_iterate_phdr`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLinker;

impl ModuleResolver for DynamicLinker {
    fn open(&self, module: &str) -> Option<ModuleHandle> {
        let name = CString::new(module).ok()?;
        // RTLD_NOLOAD: only hand out modules somebody else already loaded
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
        ModuleHandle::from_raw(handle)
    }

    fn symbol(&self, handle: ModuleHandle, symbol: &str) -> Option<SymbolAddress> {
        let name = CString::new(symbol).ok()?;
        let addr = unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) };
        SymbolAddress::new(addr as usize)
    }

    fn section(&self, module: &str, section: &str) -> SectionDescriptor {
        let Some(loaded) = LoadedModule::find(module) else {
            return SectionDescriptor::EMPTY;
        };
        match loaded.section_from_file(section) {
            Ok(desc) => desc,
            Err(e) => {
                debug!("{}: section {} unreadable from file: {}", module, section, e);
                if section == ".text" {
                    loaded.exec_segment.unwrap_or(SectionDescriptor::EMPTY)
                } else {
                    SectionDescriptor::EMPTY
                }
            }
        }
    }
}

/// A module as reported by `dl_iterate_phdr`.
#[derive(Debug)]
struct LoadedModule {
    bias: usize,
    path: PathBuf,
    exec_segment: Option<SectionDescriptor>,
}

struct Search<'a> {
    name: &'a str,
    found: Option<LoadedModule>,
}

fn matches_module(path: &str, name: &str) -> bool {
    path.rsplit('/').next() == Some(name)
}

unsafe extern "C" fn visit_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let search = unsafe { &mut *(data as *mut Search) };
    let info = unsafe { &*info };
    if info.dlpi_name.is_null() {
        return 0;
    }
    let path = unsafe { CStr::from_ptr(info.dlpi_name) }.to_string_lossy();
    if !matches_module(&path, search.name) {
        return 0;
    }

    let bias = info.dlpi_addr as usize;
    let phdrs = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
    };
    let exec_segment = phdrs
        .iter()
        .find(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
        .map(|ph| SectionDescriptor::new(bias + ph.p_vaddr as usize, ph.p_memsz as usize));

    search.found = Some(LoadedModule {
        bias,
        path: PathBuf::from(path.into_owned()),
        exec_segment,
    });
    1
}

impl LoadedModule {
    fn find(name: &str) -> Option<Self> {
        let mut search = Search { name, found: None };
        unsafe {
            libc::dl_iterate_phdr(
                Some(visit_module),
                &mut search as *mut Search as *mut c_void,
            )
        };
        search.found
    }

    fn section_from_file(&self, name: &str) -> Result<SectionDescriptor> {
        let file = File::open(&self.path)?;
        let map = unsafe { Mmap::map(&file) }?;
        let elf = Elf::parse(&map).map_err(io::Error::other)?;
        elf.section_headers
            .iter()
            .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(name))
            .map(|sh| SectionDescriptor::new(self.bias + sh.sh_addr as usize, sh.sh_size as usize))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no section {}", name)).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_module() {
        assert!(matches_module("/system/lib64/libEGL.so", "libEGL.so"));
        assert!(matches_module(
            "/data/app/x/base.apk!/lib/arm64-v8a/libgame.so",
            "libgame.so"
        ));
        assert!(matches_module("libc.so.6", "libc.so.6"));
        assert!(!matches_module("/usr/lib/libEGL.so.1", "libEGL.so"));
        assert!(!matches_module("", "libEGL.so"));
    }

    #[test]
    fn test_section_descriptor_empty() {
        assert!(SectionDescriptor::EMPTY.is_empty());
        assert!(SectionDescriptor::new(0x1000, 0).is_empty());
        assert!(!SectionDescriptor::new(0x1000, 1).is_empty());
        assert_eq!(unsafe { SectionDescriptor::EMPTY.as_slice() }.len(), 0);
    }

    #[test]
    fn test_missing_module() {
        let linker = DynamicLinker;
        assert!(linker.open("libdefinitely-not-loaded.so").is_none());
        assert!(linker
            .section("libdefinitely-not-loaded.so", ".text")
            .is_empty());
        assert!(matches!(
            linker.resolve("libdefinitely-not-loaded.so", "foo"),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_text_falls_back_to_exec_segment() {
        // the vdso has no file behind it
        let linker = DynamicLinker;
        let text = linker.section("linux-vdso.so.1", ".text");
        assert!(!text.is_empty());
        assert!(linker.section("linux-vdso.so.1", ".data").is_empty());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_libc_symbol_inside_text() {
        let linker = DynamicLinker;
        let handle = linker.open("libc.so.6").unwrap();
        let getpid = linker.symbol(handle, "getpid").unwrap();
        assert!(linker.symbol(handle, "no_such_symbol_here").is_none());

        let text = linker.section("libc.so.6", ".text");
        assert!(!text.is_empty());
        assert!(getpid.get() >= text.base());
        assert!(getpid.get() < text.base() + text.size());
        assert!(linker.section("libc.so.6", ".no_such_section").is_empty());
    }
}
