//! The patch features the overlay exposes, and the signatures they act on.

use tracing::{debug, warn};

use crate::patch::{PatchOutcome, PatchSiteTable};
use crate::scanner::SignaturePattern;

/// Built-in signatures. The order is the patch site index every feature
/// below refers to.
pub const SIGNATURES: [SignaturePattern; 8] = [
    SignaturePattern::new(
        "InfinitySpread#1",
        &[0xe3, 0x03, 0x19, 0x2a, 0xe4, 0x03, 0x14, 0xaa, 0xa5, 0x00, 0x80, 0x52, 0x08, 0x05, 0x00, 0x51],
    ),
    SignaturePattern::new(
        "InfinitySpread#2",
        &[0xe3, 0x03, 0x19, 0x2a, 0x29, 0x05, 0x00, 0x51, 0xe4, 0x03, 0x14, 0xaa, 0x65, 0x00, 0x80, 0x52],
    ),
    SignaturePattern::new(
        "InfinitySpread#3",
        &[0xe3, 0x03, 0x19, 0x2a, 0xe4, 0x03, 0x14, 0xaa, 0x85, 0x00, 0x80, 0x52, 0x08, 0x05, 0x00, 0x11],
    ),
    SignaturePattern::new(
        "InfinitySpread#4",
        &[0xe3, 0x03, 0x19, 0x2a, 0x29, 0x05, 0x00, 0x11, 0xe4, 0x03, 0x14, 0xaa, 0x45, 0x00, 0x80, 0x52],
    ),
    SignaturePattern::new(
        "SpongeLimit+",
        &[0x62, 0x02, 0x00, 0x54, 0xfb, 0x13, 0x40, 0xf9, 0x7f, 0x17, 0x00, 0xf1],
    ),
    SignaturePattern::new("SpongeLimit++", &[0x5f, 0x51, 0x05, 0xf1, 0x8b, 0x2d, 0x0d, 0x9b]),
    SignaturePattern::new(
        "AbsorbType cmp #1",
        &[0x1f, 0x15, 0x00, 0x71, 0xa1, 0x01, 0x00, 0x54, 0x00, 0xe4, 0x00, 0x6f],
    ),
    SignaturePattern::new(
        "AbsorbType cmp #2",
        &[0x1f, 0x15, 0x00, 0x71, 0x01, 0xf8, 0xff, 0x54, 0x88, 0x02, 0x40, 0xf9],
    ),
];

const INFINITY_SPREAD_SITES: [usize; 4] = [0, 1, 2, 3];
const SPONGE_RANGE_PLUS_SITE: usize = 4;
const SPONGE_RANGE_PLUS_PLUS_SITE: usize = 5;
const ABSORB_TYPE_SITES: [usize; 2] = [6, 7];

// mov w3, #0
const INFINITY_SPREAD_PATCH: [u8; 4] = [0x03, 0x00, 0x80, 0x52];
const SPONGE_RANGE_PLUS_PATCH: [u8; 12] = [
    0x1f, 0x20, 0x03, 0xd5, 0xfb, 0x13, 0x40, 0xf9, 0x7f, 0x07, 0x00, 0xb1,
];
const SPONGE_RANGE_PLUS_PLUS_PATCH: [u8; 8] = [0x5f, 0xfd, 0x03, 0xf1, 0x8b, 0x2d, 0x0d, 0x9b];

pub const ABSORB_TYPE_MAX: u32 = 575;
pub const ABSORB_TYPE_DEFAULT: u32 = 5;

/// `cmp w8, #imm` (`subs wzr, w8, #imm`).
pub fn encode_cmp_w8_imm(imm: u32) -> Option<u32> {
    (imm <= ABSORB_TYPE_MAX).then(|| 0x7100_001f | (imm << 10) | (8 << 5))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    InfinitySpread,
    SpongeRangePlus,
    /// Only usable while [`Feature::SpongeRangePlus`] is on.
    SpongeRangePlusPlus,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::InfinitySpread,
        Feature::SpongeRangePlus,
        Feature::SpongeRangePlusPlus,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Feature::InfinitySpread => "InfinitySpread",
            Feature::SpongeRangePlus => "SpongeRange+",
            Feature::SpongeRangePlusPlus => "SpongeRange++",
        }
    }

    fn sites(self) -> &'static [usize] {
        match self {
            Feature::InfinitySpread => &INFINITY_SPREAD_SITES,
            Feature::SpongeRangePlus => &[SPONGE_RANGE_PLUS_SITE],
            Feature::SpongeRangePlusPlus => &[SPONGE_RANGE_PLUS_PLUS_SITE],
        }
    }

    fn patch(self) -> &'static [u8] {
        match self {
            Feature::InfinitySpread => &INFINITY_SPREAD_PATCH,
            Feature::SpongeRangePlus => &SPONGE_RANGE_PLUS_PATCH,
            Feature::SpongeRangePlusPlus => &SPONGE_RANGE_PLUS_PLUS_PATCH,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Edits to the absorb type value, as offered by the menu and the keypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorbEdit {
    Increment,
    Decrement,
    Digit(u8),
    Backspace,
}

/// Feature state driven by the overlay. Patches are written only when the
/// site table is ready; toggles made before that just change the state.
#[derive(Debug, Clone)]
pub struct Controls {
    enabled: [bool; 3],
    absorb_type: u32,
    applied_absorb_type: Option<u32>,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            enabled: [false; 3],
            absorb_type: ABSORB_TYPE_DEFAULT,
            applied_absorb_type: None,
        }
    }
}

/// Writes or reverts every site in `sites`, carrying on past failures.
/// Returns how many were written and how many failed.
fn write_sites(
    patches: &PatchSiteTable,
    sites: &[usize],
    on: bool,
    bytes: &[u8],
) -> (usize, usize) {
    let (mut written, mut failed) = (0, 0);
    for &index in sites {
        match patches.set(index, on, bytes) {
            Ok(PatchOutcome::Written) => written += 1,
            Ok(PatchOutcome::Skipped) => {}
            Err(e) => {
                warn!("patch site {} failed: {}", index, e);
                failed += 1;
            }
        }
    }
    (written, failed)
}

impl Controls {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled[feature.index()]
    }

    /// Whether the toggle for `feature` can currently be used.
    pub fn is_available(&self, feature: Feature) -> bool {
        match feature {
            Feature::SpongeRangePlusPlus => self.is_enabled(Feature::SpongeRangePlus),
            _ => true,
        }
    }

    /// Turns `feature` on or off and writes or reverts its patch sites.
    /// Returns whether the state changed.
    pub fn set(&mut self, feature: Feature, on: bool, patches: Option<&PatchSiteTable>) -> bool {
        if !self.is_available(feature) {
            debug!("{} unavailable", feature.label());
            return false;
        }
        if self.enabled[feature.index()] == on {
            return false;
        }
        self.enabled[feature.index()] = on;

        let Some(patches) = patches else {
            warn!("{} toggled before patch sites were ready", feature.label());
            return true;
        };
        let state = if on { "on" } else { "off" };
        match write_sites(patches, feature.sites(), on, feature.patch()) {
            (n, 0) => debug!("{} {} ({} sites)", feature.label(), state, n),
            (n, failed) => warn!("{} {}: {} sites written, {} failed", feature.label(), state, n, failed),
        }
        true
    }

    pub fn absorb_type(&self) -> u32 {
        self.absorb_type
    }

    pub fn edit_absorb_type(&mut self, edit: AbsorbEdit) {
        let v = self.absorb_type;
        self.absorb_type = match edit {
            AbsorbEdit::Increment if v < ABSORB_TYPE_MAX => v + 1,
            AbsorbEdit::Decrement if v > 0 => v - 1,
            AbsorbEdit::Digit(d) if d <= 9 => v.saturating_mul(10).saturating_add(d as u32),
            AbsorbEdit::Backspace => v / 10,
            _ => v,
        };
    }

    /// Writes `cmp w8, #absorb_type` at both compare sites when the value
    /// changed since the last write and is in range. Called once per frame.
    pub fn sync_absorb_type(&mut self, patches: Option<&PatchSiteTable>) {
        let Some(patches) = patches else {
            return;
        };
        if self.applied_absorb_type == Some(self.absorb_type) {
            return;
        }
        let Some(inst) = encode_cmp_w8_imm(self.absorb_type) else {
            return;
        };
        match write_sites(patches, &ABSORB_TYPE_SITES, true, &inst.to_le_bytes()) {
            (_, 0) => {
                debug!("absorb type {}", self.absorb_type);
                self.applied_absorb_type = Some(self.absorb_type);
            }
            (_, failed) => warn!("absorb type {}: {} sites failed", self.absorb_type, failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::SectionDescriptor;
    use crate::patch::PatchSite;
    use crate::protect::Protection;
    use crate::protect::tests::TestPage;
    use crate::scanner;

    /// A page of code laid out with every signature, 32 bytes apart.
    fn fake_code() -> (TestPage, PatchSiteTable) {
        let page = TestPage::new(Protection::READ | Protection::WRITE);
        let mut code = vec![0u8; SIGNATURES.len() * 32];
        for (i, sig) in SIGNATURES.iter().enumerate() {
            code[i * 32..i * 32 + sig.bytes.len()].copy_from_slice(sig.bytes);
        }
        unsafe { crate::patch::write(page.addr, &code, false) }.unwrap();
        let section = SectionDescriptor::new(page.addr, code.len());
        let table = unsafe { scanner::scan(section, &SIGNATURES) };
        (page, table)
    }

    #[test]
    fn test_encode_cmp() {
        // the instruction the signatures were taken with
        assert_eq!(encode_cmp_w8_imm(5).unwrap().to_le_bytes(), [0x1f, 0x15, 0x00, 0x71]);
        assert_eq!(encode_cmp_w8_imm(0), Some(0x7100_011f));
        assert_eq!(encode_cmp_w8_imm(64).unwrap().to_le_bytes(), [0x1f, 0x01, 0x01, 0x71]);
        assert_eq!(encode_cmp_w8_imm(575).unwrap().to_le_bytes(), [0x1f, 0xfd, 0x08, 0x71]);
        assert_eq!(encode_cmp_w8_imm(576), None);
    }

    #[test]
    fn test_signatures_are_distinct() {
        for (i, a) in SIGNATURES.iter().enumerate() {
            for b in &SIGNATURES[i + 1..] {
                assert_ne!(a.bytes, b.bytes);
            }
        }
    }

    #[test]
    fn test_feature_toggle_round_trip() {
        let (page, table) = fake_code();
        assert_eq!(table.available_count(), 8);
        let before = page.bytes(0, 256);
        let mut controls = Controls::default();

        assert!(controls.set(Feature::InfinitySpread, true, Some(&table)));
        for i in 0..4 {
            assert_eq!(page.bytes(i * 32, 4), INFINITY_SPREAD_PATCH);
        }
        assert!(!controls.set(Feature::InfinitySpread, true, Some(&table)));
        assert!(controls.set(Feature::InfinitySpread, false, Some(&table)));
        assert_eq!(page.bytes(0, 256), before);
    }

    #[test]
    fn test_failed_site_does_not_stop_the_rest() {
        let (page, _) = fake_code();
        // the first site remembers fewer bytes than the patch writes
        let sites = (0..4)
            .map(|i| {
                let len = if i == 0 { 2 } else { SIGNATURES[i].bytes.len() };
                let addr = page.addr + i * 32;
                unsafe { PatchSite::discovered(SIGNATURES[i].label, addr, page.bytes(i * 32, len)) }
            })
            .collect();
        let table = PatchSiteTable::new(sites);
        let mut controls = Controls::default();

        assert!(controls.set(Feature::InfinitySpread, true, Some(&table)));
        assert!(controls.is_enabled(Feature::InfinitySpread));
        assert_eq!(page.bytes(0, 4), &SIGNATURES[0].bytes[..4]);
        for i in 1..4 {
            assert_eq!(page.bytes(i * 32, 4), INFINITY_SPREAD_PATCH);
        }
    }

    #[test]
    fn test_sponge_plus_plus_needs_plus() {
        let (page, table) = fake_code();
        let mut controls = Controls::default();
        assert!(!controls.is_available(Feature::SpongeRangePlusPlus));
        assert!(!controls.set(Feature::SpongeRangePlusPlus, true, Some(&table)));
        assert_eq!(page.bytes(5 * 32, 8), SIGNATURES[5].bytes);

        assert!(controls.set(Feature::SpongeRangePlus, true, Some(&table)));
        assert_eq!(page.bytes(4 * 32, 12), SPONGE_RANGE_PLUS_PATCH);
        assert!(controls.set(Feature::SpongeRangePlusPlus, true, Some(&table)));
        assert_eq!(page.bytes(5 * 32, 8), SPONGE_RANGE_PLUS_PLUS_PATCH);
        assert!(controls.is_enabled(Feature::SpongeRangePlusPlus));
    }

    #[test]
    fn test_toggle_before_ready_only_changes_state() {
        let mut controls = Controls::default();
        assert!(controls.set(Feature::InfinitySpread, true, None));
        assert!(controls.is_enabled(Feature::InfinitySpread));
    }

    #[test]
    fn test_absorb_type_edits() {
        let mut controls = Controls::default();
        assert_eq!(controls.absorb_type(), 5);
        controls.edit_absorb_type(AbsorbEdit::Digit(7));
        assert_eq!(controls.absorb_type(), 57);
        controls.edit_absorb_type(AbsorbEdit::Digit(5));
        assert_eq!(controls.absorb_type(), 575);
        controls.edit_absorb_type(AbsorbEdit::Increment);
        assert_eq!(controls.absorb_type(), 575);
        controls.edit_absorb_type(AbsorbEdit::Backspace);
        controls.edit_absorb_type(AbsorbEdit::Backspace);
        assert_eq!(controls.absorb_type(), 5);
        for _ in 0..10 {
            controls.edit_absorb_type(AbsorbEdit::Decrement);
        }
        assert_eq!(controls.absorb_type(), 0);
        controls.edit_absorb_type(AbsorbEdit::Digit(12));
        assert_eq!(controls.absorb_type(), 0);
    }

    #[test]
    fn test_absorb_type_sync() {
        let (page, table) = fake_code();
        let mut controls = Controls::default();

        controls.sync_absorb_type(None);
        assert_eq!(page.bytes(6 * 32, 4), [0x1f, 0x15, 0x00, 0x71]);

        controls.edit_absorb_type(AbsorbEdit::Increment);
        controls.sync_absorb_type(Some(&table));
        let cmp6 = encode_cmp_w8_imm(6).unwrap().to_le_bytes();
        assert_eq!(page.bytes(6 * 32, 4), cmp6);
        assert_eq!(page.bytes(7 * 32, 4), cmp6);
        // the rest of the signature is untouched
        assert_eq!(page.bytes(6 * 32 + 4, 8), &SIGNATURES[6].bytes[4..]);

        // out of range values are not written
        controls.edit_absorb_type(AbsorbEdit::Digit(0));
        controls.edit_absorb_type(AbsorbEdit::Digit(0));
        assert_eq!(controls.absorb_type(), 600);
        controls.sync_absorb_type(Some(&table));
        assert_eq!(page.bytes(6 * 32, 4), cmp6);
    }
}
