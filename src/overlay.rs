//! The boundary between the engine and the overlay UI.
//!
//! The UI itself lives behind [`Overlay`]; each frame it receives a
//! [`FrameContext`] through which it reports where its windows were drawn
//! and drives the patch controls.

use std::ffi::c_void;

use crate::controls::{AbsorbEdit, Controls, Feature};
use crate::gfx::{NativeWindow, OverlayScale};
use crate::input::{BoundsTable, PointerState, WindowRect};
use crate::patch::PatchSiteTable;

/// Sub-windows whose bounds take part in input arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayWindow {
    Menu = 0,
    Info = 1,
    Keypad = 2,
}

pub const WINDOW_COUNT: usize = 3;

/// An immediate-mode UI rendered into the host's frames.
///
/// All methods run on the presentation thread, inside the host's context.
pub trait Overlay: Send {
    /// Called once, with a window and a current context.
    fn init(&mut self, window: NativeWindow, scale: &OverlayScale);

    /// The surface size changed.
    fn set_display_size(&mut self, width: f32, height: f32);

    /// Latest pointer, delivered before each frame.
    fn update_pointer(&mut self, _pointer: PointerState) {}

    fn render_frame(&mut self, frame: &mut FrameContext<'_>);

    /// A raw `AInputEvent*` seen by the fallback input path.
    fn handle_input_event(&mut self, _event: *const c_void) {}
}

/// What the overlay can touch during one frame.
pub struct FrameContext<'a> {
    bounds: &'a BoundsTable,
    drawn: [bool; WINDOW_COUNT],
    pointer: PointerState,
    controls: &'a mut Controls,
    patches: Option<&'a PatchSiteTable>,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(
        bounds: &'a BoundsTable,
        pointer: PointerState,
        controls: &'a mut Controls,
        patches: Option<&'a PatchSiteTable>,
    ) -> Self {
        Self {
            bounds,
            drawn: [false; WINDOW_COUNT],
            pointer,
            controls,
            patches,
        }
    }

    /// Records where `window` was drawn this frame.
    pub fn window_drawn(&mut self, window: OverlayWindow, rect: WindowRect) {
        self.drawn[window as usize] = true;
        self.bounds.set_drawn(window as usize, rect);
    }

    pub fn window_hidden(&mut self, window: OverlayWindow) {
        self.drawn[window as usize] = false;
        self.bounds.set_hidden(window as usize);
    }

    pub fn pointer(&self) -> PointerState {
        self.pointer
    }

    pub fn controls(&self) -> &Controls {
        self.controls
    }

    pub fn patches_ready(&self) -> bool {
        self.patches.is_some()
    }

    pub fn toggle(&mut self, feature: Feature, on: bool) -> bool {
        self.controls.set(feature, on, self.patches)
    }

    pub fn edit_absorb_type(&mut self, edit: AbsorbEdit) {
        self.controls.edit_absorb_type(edit);
    }

    /// Ends the frame: windows not drawn are no longer hit-testable, and a
    /// changed absorb type is written out.
    pub(crate) fn finish(self) {
        for (index, drawn) in self.drawn.iter().enumerate() {
            if !drawn {
                self.bounds.set_hidden(index);
            }
        }
        self.controls.sync_absorb_type(self.patches);
    }
}
