//! Page protection queries and scoped relaxation.
//!
//! The kernel does not report protection through `mprotect`, so the current
//! flags are read from `/proc/self/maps` and restored after the write. All
//! relaxations in the process are serialized by one lock so two writers on
//! the same page can not restore each other's flags mid-write.

use std::fs;
use std::sync::{Mutex, OnceLock, PoisonError};

use bitflags::bitflags;
use libc::{c_void, mprotect};
use regex::Regex;
use tracing::warn;

use crate::err::{Error, Result};

bitflags! {
    /// Page protection bits as understood by `mprotect`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

static PROTECT_LOCK: Mutex<()> = Mutex::new(());

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

fn maps_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^([0-9a-f]+)-([0-9a-f]+) ([r-])([w-])([x-])").expect("static regex")
    })
}

/// A page-aligned span with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
    pub protection: Protection,
}

fn parse_maps(maps: &str) -> Vec<Region> {
    maps_line_regex()
        .captures_iter(maps)
        .filter_map(|cap| {
            let start = usize::from_str_radix(&cap[1], 16).ok()?;
            let end = usize::from_str_radix(&cap[2], 16).ok()?;
            let mut protection = Protection::empty();
            protection.set(Protection::READ, &cap[3] == "r");
            protection.set(Protection::WRITE, &cap[4] == "w");
            protection.set(Protection::EXEC, &cap[5] == "x");
            Some(Region {
                start,
                len: end - start,
                protection,
            })
        })
        .collect()
}

fn regions_in(mappings: &[Region], addr: usize, len: usize) -> Result<Vec<Region>> {
    let page = page_size();
    let first = addr & !(page - 1);
    let last = addr
        .checked_add(len.max(1))
        .ok_or(Error::InvalidParameter)?
        .next_multiple_of(page);

    let mut cursor = first;
    let mut regions = vec![];
    for m in mappings {
        let m_end = m.start + m.len;
        if m_end <= cursor || m.start >= last {
            continue;
        }
        if m.start > cursor {
            return Err(Error::Unmapped(cursor));
        }
        let end = m_end.min(last);
        regions.push(Region {
            start: cursor,
            len: end - cursor,
            protection: m.protection,
        });
        cursor = end;
        if cursor >= last {
            return Ok(regions);
        }
    }
    Err(Error::Unmapped(cursor))
}

/// Current protection of every page overlapping `[addr, addr + len)`.
pub fn query(addr: usize, len: usize) -> Result<Vec<Region>> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    regions_in(&parse_maps(&maps), addr, len)
}

fn set_protection(start: usize, len: usize, protection: Protection) -> Result<()> {
    let ret = unsafe { mprotect(start as *mut c_void, len, protection.bits()) };
    if ret != 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Runs `func` while every page of `[addr, addr + len)` additionally carries
/// `extra`, then puts the previous protection back.
pub fn with_protection<T>(
    addr: usize,
    len: usize,
    extra: Protection,
    func: impl FnOnce() -> T,
) -> Result<T> {
    let _lock = PROTECT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let mut changed: Vec<Region> = vec![];
    for region in query(addr, len)? {
        if region.protection.contains(extra) {
            continue;
        }
        if let Err(e) = set_protection(region.start, region.len, region.protection | extra) {
            restore(&changed);
            return Err(e);
        }
        changed.push(region);
    }

    let ret = func();
    restore(&changed);
    Ok(ret)
}

/// Puts back each region's protection. Returns how many could not be put
/// back; those pages stay more permissive, never less.
fn restore(changed: &[Region]) -> usize {
    changed
        .iter()
        .filter(|region| match set_protection(region.start, region.len, region.protection) {
            Ok(()) => false,
            Err(e) => {
                warn!("restoring protection of {:#x} failed: {}", region.start, e);
                true
            }
        })
        .count()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An anonymous page owned by a test.
    pub(crate) struct TestPage {
        pub addr: usize,
    }

    impl TestPage {
        pub fn new(protection: Protection) -> Self {
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    page_size(),
                    protection.bits(),
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            Self {
                addr: addr as usize,
            }
        }

        pub fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
            unsafe { std::slice::from_raw_parts((self.addr + offset) as *const u8, len) }.to_vec()
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            unsafe { libc::munmap(self.addr as *mut c_void, page_size()) };
        }
    }

    #[test]
    fn test_parse_maps() {
        let maps = "\
7f0000000000-7f0000002000 r-xp 00000000 fd:01 123 /system/lib64/libEGL.so
7f0000002000-7f0000003000 rw-p 00002000 fd:01 123 /system/lib64/libEGL.so
7f0000004000-7f0000005000 ---p 00000000 00:00 0
";
        let regions = parse_maps(maps);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].start, 0x7f00_0000_0000);
        assert_eq!(regions[0].len, 0x2000);
        assert_eq!(regions[0].protection, Protection::READ | Protection::EXEC);
        assert_eq!(regions[1].protection, Protection::READ | Protection::WRITE);
        assert_eq!(regions[2].protection, Protection::empty());
    }

    #[test]
    fn test_regions_span_and_gap() {
        let page = page_size();
        let base = 0x1000_0000;
        let mappings = [
            Region {
                start: base,
                len: page,
                protection: Protection::READ | Protection::EXEC,
            },
            Region {
                start: base + page,
                len: page,
                protection: Protection::READ,
            },
        ];
        let span = regions_in(&mappings, base + page - 2, 4).unwrap();
        assert_eq!(span.len(), 2);
        assert_eq!(span[0].start, base);
        assert_eq!(span[1].start, base + page);
        assert_eq!(span[1].protection, Protection::READ);

        assert!(matches!(
            regions_in(&mappings, base + 2 * page, 4),
            Err(Error::Unmapped(_))
        ));
        assert!(matches!(
            regions_in(&mappings, base - 4, 8),
            Err(Error::Unmapped(_))
        ));
    }

    #[test]
    fn test_relax_and_restore() {
        let page = TestPage::new(Protection::READ);
        assert_eq!(query(page.addr, 1).unwrap()[0].protection, Protection::READ);

        with_protection(page.addr + 8, 4, Protection::WRITE, || unsafe {
            *((page.addr + 8) as *mut u32) = 0xdead_beef;
        })
        .unwrap();

        assert_eq!(page.bytes(8, 4), 0xdead_beefu32.to_le_bytes());
        assert_eq!(query(page.addr, 1).unwrap()[0].protection, Protection::READ);
    }

    #[test]
    fn test_restore_reports_failures() {
        let live = TestPage::new(Protection::READ | Protection::WRITE);
        let other = TestPage::new(Protection::READ | Protection::WRITE);

        // mprotect rejects an unaligned start
        let regions = [
            Region {
                start: live.addr,
                len: page_size(),
                protection: Protection::READ,
            },
            Region {
                start: other.addr + 1,
                len: page_size() - 1,
                protection: Protection::READ,
            },
        ];
        assert_eq!(restore(&regions), 1);
        assert_eq!(query(live.addr, 1).unwrap()[0].protection, Protection::READ);
        assert_eq!(
            query(other.addr, 1).unwrap()[0].protection,
            Protection::READ | Protection::WRITE
        );
    }
}
