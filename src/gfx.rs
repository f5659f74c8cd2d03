//! Rendering the overlay inside the host's own graphics context.
//!
//! Every piece of GL state the overlay renderer may touch is captured before
//! a frame and put back afterwards, so the host never observes the overlay.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use tracing::{error, info};

use crate::config::OverlayConfig;
use crate::overlay::Overlay;

pub mod egl;
pub mod gles;

pub const GL_CURRENT_PROGRAM: u32 = 0x8b8d;
pub const GL_VERTEX_ARRAY_BINDING: u32 = 0x85b5;
pub const GL_FRAMEBUFFER_BINDING: u32 = 0x8ca6;
pub const GL_VIEWPORT: u32 = 0x0ba2;
pub const GL_SCISSOR_BOX: u32 = 0x0c10;
pub const GL_BLEND: u32 = 0x0be2;
pub const GL_SCISSOR_TEST: u32 = 0x0c11;
pub const GL_FRAMEBUFFER: u32 = 0x8d40;

/// The GL entry points needed to save and restore host state.
pub trait GlStateApi {
    fn get_integers(&self, pname: u32, out: &mut [i32]);
    fn is_enabled(&self, cap: u32) -> bool;
    fn use_program(&self, program: u32);
    fn bind_vertex_array(&self, array: u32);
    fn bind_framebuffer(&self, target: u32, framebuffer: u32);
    fn viewport(&self, rect: [i32; 4]);
    fn scissor(&self, rect: [i32; 4]);
    fn set_enabled(&self, cap: u32, enabled: bool);
}

/// Host-visible GL state around one overlay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlStateSnapshot {
    pub program: u32,
    pub vertex_array: u32,
    pub framebuffer: u32,
    pub viewport: [i32; 4],
    pub scissor: [i32; 4],
    pub blend: bool,
    pub scissor_test: bool,
}

impl GlStateSnapshot {
    pub fn capture<G: GlStateApi + ?Sized>(gl: &G) -> Self {
        let integer = |pname| {
            let mut value = [0];
            gl.get_integers(pname, &mut value);
            value[0] as u32
        };
        let mut viewport = [0; 4];
        let mut scissor = [0; 4];
        gl.get_integers(GL_VIEWPORT, &mut viewport);
        gl.get_integers(GL_SCISSOR_BOX, &mut scissor);
        Self {
            program: integer(GL_CURRENT_PROGRAM),
            vertex_array: integer(GL_VERTEX_ARRAY_BINDING),
            framebuffer: integer(GL_FRAMEBUFFER_BINDING),
            viewport,
            scissor,
            blend: gl.is_enabled(GL_BLEND),
            scissor_test: gl.is_enabled(GL_SCISSOR_TEST),
        }
    }

    pub fn restore<G: GlStateApi + ?Sized>(&self, gl: &G) {
        gl.use_program(self.program);
        gl.bind_vertex_array(self.vertex_array);
        gl.bind_framebuffer(GL_FRAMEBUFFER, self.framebuffer);
        gl.viewport(self.viewport);
        gl.scissor(self.scissor);
        gl.set_enabled(GL_BLEND, self.blend);
        gl.set_enabled(GL_SCISSOR_TEST, self.scissor_test);
    }
}

/// An `ANativeWindow*` obtained by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeWindow(pub NonNull<c_void>);

impl NativeWindow {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceSize {
    pub width: i32,
    pub height: i32,
}

impl SurfaceSize {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }
}

/// UI sizing derived from the surface height at initialisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayScale {
    pub scale: f32,
    pub font_px: f32,
    pub style_scale: f32,
}

impl OverlayScale {
    pub fn for_height(height: i32, config: &OverlayConfig) -> Self {
        let scale = (height as f32 / config.reference_height).clamp(config.min_scale, config.max_scale);
        Self {
            scale,
            font_px: config.base_font_px * scale,
            style_scale: scale * config.style_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No current context; nothing was touched.
    NoContext,
    /// The overlay has not been initialised yet.
    NotInitialized,
    Rendered,
    /// The overlay panicked mid-frame. GL state was restored anyway.
    Panicked,
}

/// Drives the overlay from the context-activation and presentation hooks.
#[derive(Debug)]
pub struct FrameDriver {
    config: OverlayConfig,
    initialized: bool,
    surface: SurfaceSize,
    pushed: Option<SurfaceSize>,
}

impl FrameDriver {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            initialized: false,
            surface: SurfaceSize::default(),
            pushed: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn surface(&self) -> SurfaceSize {
        self.surface
    }

    /// Called after the host made a context current. Initialises the overlay
    /// once, as soon as a native window is known and a draw surface is bound.
    pub fn activate(
        &mut self,
        window: Option<NativeWindow>,
        has_draw_surface: bool,
        query_size: impl FnOnce() -> SurfaceSize,
        overlay: &mut dyn Overlay,
    ) -> bool {
        if self.initialized || !has_draw_surface {
            return false;
        }
        let Some(window) = window else {
            return false;
        };

        self.surface = query_size();
        let scale = OverlayScale::for_height(self.surface.height, &self.config);
        let init = panic::catch_unwind(AssertUnwindSafe(|| overlay.init(window, &scale)));
        if init.is_err() {
            error!("overlay initialisation panicked");
            return false;
        }
        self.initialized = true;
        info!(
            "overlay initialised at {}x{}, scale {:.2}",
            self.surface.width, self.surface.height, scale.scale
        );
        true
    }

    /// Called from the presentation hook before the original runs.
    pub fn present<G: GlStateApi + ?Sized>(
        &mut self,
        gl: &G,
        has_context: bool,
        size: SurfaceSize,
        overlay: &mut dyn Overlay,
        draw: impl FnOnce(&mut dyn Overlay),
    ) -> FrameOutcome {
        if !has_context {
            return FrameOutcome::NoContext;
        }
        self.surface = size;
        if !self.initialized {
            return FrameOutcome::NotInitialized;
        }
        if self.pushed != Some(size) {
            overlay.set_display_size(size.width as f32, size.height as f32);
            self.pushed = Some(size);
        }

        let saved = GlStateSnapshot::capture(gl);
        let frame = panic::catch_unwind(AssertUnwindSafe(|| draw(overlay)));
        saved.restore(gl);
        match frame {
            Ok(()) => FrameOutcome::Rendered,
            Err(_) => {
                error!("overlay frame panicked");
                FrameOutcome::Panicked
            }
        }
    }
}
