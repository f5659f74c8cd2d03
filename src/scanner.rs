//! Exact byte-signature search over a module's code.

use memchr::memmem;
use tracing::{info, warn};

use crate::module::SectionDescriptor;
use crate::patch::{PatchSite, PatchSiteTable, read};

/// A literal byte sequence identifying one patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignaturePattern {
    pub label: &'static str,
    pub bytes: &'static [u8],
    span: usize,
}

impl SignaturePattern {
    pub const fn new(label: &'static str, bytes: &'static [u8]) -> Self {
        Self {
            label,
            bytes,
            span: bytes.len(),
        }
    }

    /// Snapshot `span` bytes at the match instead of just the pattern, for
    /// patches wider than the signature.
    pub const fn with_span(mut self, span: usize) -> Self {
        if span > self.span {
            self.span = span;
        }
        self
    }

    /// How many bytes are captured at the match.
    pub fn span(&self) -> usize {
        self.span
    }
}

/// Offset of the first occurrence of each pattern, `None` when absent.
pub fn scan_bytes(haystack: &[u8], patterns: &[SignaturePattern]) -> Vec<Option<usize>> {
    patterns
        .iter()
        .map(|p| {
            if p.bytes.is_empty() {
                return None;
            }
            memmem::find(haystack, p.bytes)
        })
        .collect()
}

/// Scans `section` and snapshots the bytes at every hit. The table keeps the
/// order of `patterns`.
///
/// # Safety
///
/// `section` must describe memory that is mapped readable and stays mapped
/// for the lifetime of the returned table.
pub unsafe fn scan(section: SectionDescriptor, patterns: &[SignaturePattern]) -> PatchSiteTable {
    let code = unsafe { section.as_slice() };
    let sites = scan_bytes(code, patterns)
        .into_iter()
        .zip(patterns)
        .map(|(offset, pattern)| match offset {
            Some(offset) => {
                let address = section.base() + offset;
                let len = pattern.span.min(code.len() - offset);
                info!("{} found at {:#x}", pattern.label, address);
                unsafe { PatchSite::discovered(pattern.label, address, read(address, len)) }
            }
            None => {
                warn!("{} not found", pattern.label);
                PatchSite::unavailable(pattern.label)
            }
        })
        .collect();
    PatchSiteTable::new(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Error;
    use crate::patch::PatchOutcome;
    use crate::protect::Protection;
    use crate::protect::tests::TestPage;

    const MARKER: SignaturePattern = SignaturePattern::new("marker", &[0xaa, 0xbb]);
    const ABSENT: SignaturePattern = SignaturePattern::new("absent", &[0xde, 0xad, 0xbe, 0xef]);

    #[test]
    fn test_scan_bytes_first_match() {
        let mut region = [0u8; 32];
        region[10..12].copy_from_slice(&[0xaa, 0xbb]);
        assert_eq!(scan_bytes(&region, &[MARKER]), [Some(10)]);

        region[20..22].copy_from_slice(&[0xaa, 0xbb]);
        assert_eq!(scan_bytes(&region, &[MARKER]), [Some(10)]);
    }

    #[test]
    fn test_scan_bytes_not_found() {
        let region = [0u8; 32];
        assert_eq!(scan_bytes(&region, &[MARKER, ABSENT]), [None, None]);
        assert_eq!(scan_bytes(&region[..1], &[MARKER]), [None]);
        assert_eq!(scan_bytes(&region, &[SignaturePattern::new("empty", &[])]), [None]);
    }

    #[test]
    fn test_scan_bytes_edges() {
        let region = [0xaa, 0xbb, 0, 0, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(scan_bytes(&region, &[ABSENT, MARKER]), [Some(4), Some(0)]);
    }

    #[test]
    fn test_scan_snapshots_in_declaration_order() {
        let page = TestPage::new(Protection::READ | Protection::WRITE);
        let mut region = [0u8; 32];
        region[10..12].copy_from_slice(&[0xaa, 0xbb]);
        unsafe { crate::patch::write(page.addr, &region, false) }.unwrap();

        let section = SectionDescriptor::new(page.addr, region.len());
        let table = unsafe { scan(section, &[ABSENT, MARKER.with_span(4)]) };

        assert_eq!(table.len(), 2);
        assert_eq!(table.available_count(), 1);
        assert_eq!(table.get(0).unwrap().address(), None);
        let site = table.get(1).unwrap();
        assert_eq!(site.label(), "marker");
        assert_eq!(site.address(), Some(page.addr + 10));
        assert_eq!(site.original(), [0xaa, 0xbb, 0, 0]);

        // scanning never writes
        assert_eq!(page.bytes(0, 32), region);
    }

    #[test]
    fn test_scan_apply_revert_round_trip() {
        let page = TestPage::new(Protection::READ | Protection::WRITE);
        let mut region = [0u8; 32];
        region[10..12].copy_from_slice(&[0xaa, 0xbb]);
        unsafe { crate::patch::write(page.addr, &region, false) }.unwrap();
        let section = SectionDescriptor::new(page.addr, region.len());

        // the bare pattern only snapshots two bytes
        let narrow = unsafe { scan(section, &[MARKER]) };
        assert!(matches!(
            narrow.apply(0, &[0x03, 0x00, 0x80, 0x52]),
            Err(Error::InvalidParameter)
        ));
        assert_eq!(page.bytes(0, 32), region);

        let table = unsafe { scan(section, &[MARKER.with_span(4)]) };
        assert_eq!(table.get(0).unwrap().address(), Some(page.addr + 10));
        assert_eq!(table.apply(0, &[0x03, 0x00, 0x80, 0x52]).unwrap(), PatchOutcome::Written);
        assert_eq!(page.bytes(10, 4), [0x03, 0x00, 0x80, 0x52]);
        assert_eq!(table.revert(0).unwrap(), PatchOutcome::Written);
        assert_eq!(page.bytes(0, 32), region);
    }

    #[test]
    fn test_span_clamped_to_section() {
        let page = TestPage::new(Protection::READ | Protection::WRITE);
        unsafe { crate::patch::write(page.addr + 6, &[0xaa, 0xbb], false) }.unwrap();
        let section = SectionDescriptor::new(page.addr, 8);
        let table = unsafe { scan(section, &[MARKER.with_span(16)]) };
        assert_eq!(table.get(0).unwrap().original(), [0xaa, 0xbb]);
    }
}
