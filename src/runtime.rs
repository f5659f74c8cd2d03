//! Process-wide state shared by the hooks, and the one-time initialisation
//! that installs them.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use anyhow::{Context, anyhow};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::controls::{self, Controls};
use crate::err::Result;
use crate::gfx::egl::{self, EglApi, EglDisplay, EglSurface};
use crate::gfx::gles::{self, GlesApi};
use crate::gfx::{FrameDriver, FrameOutcome, GlStateApi, NativeWindow, SurfaceSize};
use crate::hook::HookRegistry;
use crate::input::{BoundsTable, InputArbiter, PointerTracker, legacy, preloader};
use crate::logging;
use crate::module::{DynamicLinker, ModuleResolver};
use crate::overlay::{FrameContext, Overlay, WINDOW_COUNT};
use crate::patch::PatchSiteTable;
use crate::retry;
use crate::scanner;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The attached runtime, if any. Hooks that fire before [`attach`] see `None`.
pub fn get() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Runs `func` from a host callback. A panic must not unwind into the host,
/// so it is logged and turned into `None`.
pub(crate) fn guarded<T>(what: &str, func: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(func)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} panicked", what);
            None
        }
    }
}

/// Installs logging, publishes the runtime and starts initialisation on a
/// background thread. Only the first call in a process succeeds.
pub fn attach(config: Config, overlay: Box<dyn Overlay>) -> anyhow::Result<()> {
    logging::init_tracing(&config.log);
    RUNTIME
        .set(Runtime::new(config, overlay))
        .map_err(|_| anyhow!("runtime already attached"))?;

    thread::Builder::new()
        .name("hookpatch-init".to_string())
        .spawn(|| {
            let Some(rt) = get() else {
                return;
            };
            match rt.initialize() {
                Ok(()) => info!("initialisation finished"),
                Err(e) => error!("initialisation failed: {}", e),
            }
        })
        .context("spawning init thread")?;
    Ok(())
}

struct RenderState {
    driver: FrameDriver,
    overlay: Box<dyn Overlay>,
    controls: Controls,
}

pub struct Runtime {
    config: Config,
    resolver: DynamicLinker,
    hooks: HookRegistry,
    patches: OnceLock<PatchSiteTable>,
    bounds: Arc<BoundsTable>,
    pointer: Arc<PointerTracker>,
    arbiter: InputArbiter,
    render: Mutex<RenderState>,
    window: AtomicPtr<c_void>,
    egl: OnceLock<EglApi>,
    gles: OnceLock<GlesApi>,
}

impl Runtime {
    pub fn new(config: Config, overlay: Box<dyn Overlay>) -> Self {
        let bounds = Arc::new(BoundsTable::new(WINDOW_COUNT));
        let pointer = Arc::new(PointerTracker::default());
        Self {
            render: Mutex::new(RenderState {
                driver: FrameDriver::new(config.overlay.clone()),
                overlay,
                controls: Controls::default(),
            }),
            config,
            resolver: DynamicLinker,
            hooks: HookRegistry::default(),
            patches: OnceLock::new(),
            arbiter: InputArbiter::new(bounds.clone(), pointer.clone()),
            bounds,
            pointer,
            window: AtomicPtr::new(ptr::null_mut()),
            egl: OnceLock::new(),
            gles: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// `None` until the target module was scanned.
    pub fn patches(&self) -> Option<&PatchSiteTable> {
        self.patches.get()
    }

    pub fn bounds(&self) -> &BoundsTable {
        &self.bounds
    }

    /// Copy of the feature state. Takes the render lock, so an overlay has
    /// to use [`FrameContext::controls`] while drawing instead.
    pub(crate) fn controls(&self) -> Controls {
        self.render().controls.clone()
    }

    fn render(&self) -> MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs every initialisation step against the live process.
    pub fn initialize(&self) -> Result<()> {
        self.initialize_with(&self.resolver)
    }

    fn initialize_with(&self, resolver: &impl ModuleResolver) -> Result<()> {
        let hooking = match self.hooks.init() {
            Ok(()) => true,
            Err(e) => {
                error!("hook backend unavailable: {}", e);
                false
            }
        };
        if hooking {
            self.install_graphics(resolver);
        }
        self.install_input(resolver, hooking);
        self.scan_target(resolver)
    }

    fn install_graphics(&self, resolver: &impl ModuleResolver) {
        match unsafe { GlesApi::load(resolver, gles::MODULE) } {
            Ok(api) => {
                let _ = self.gles.set(api);
            }
            Err(e) => warn!("GL state can not be saved, overlay disabled: {}", e),
        }
        match unsafe { EglApi::load(resolver, egl::MODULE) } {
            Ok(api) => {
                let _ = self.egl.set(api);
                unsafe { egl::install(&self.hooks, resolver) };
            }
            Err(e) => warn!("EGL unavailable, overlay disabled: {}", e),
        }
    }

    /// Prefers the loader's touch interface, which needs no hooks. Returns
    /// whether it was taken.
    fn install_input(&self, resolver: &impl ModuleResolver, hooking: bool) -> bool {
        let registered = preloader::probe(resolver, &self.config.input)
            .is_some_and(|input| preloader::register(input, preloader::on_touch));
        if registered {
            return true;
        }
        if hooking {
            unsafe { legacy::install(&self.hooks, resolver, &self.config.input) };
        } else {
            warn!("no preloader input and no hooks, overlay will not see touches");
        }
        false
    }

    fn scan_target(&self, resolver: &impl ModuleResolver) -> Result<()> {
        let target = &self.config.target;
        let policy = self.config.wait.policy();
        let section = retry::wait_for_section(resolver, &target.module, &target.section, &policy)?;
        let table = unsafe { scanner::scan(section, &controls::SIGNATURES) };
        info!(
            "{} of {} patch sites found",
            table.available_count(),
            table.len()
        );
        if self.patches.set(table).is_err() {
            warn!("patch sites were already scanned");
        }
        Ok(())
    }

    pub fn set_window(&self, window: Option<NativeWindow>) {
        let raw = window.map_or(ptr::null_mut(), NativeWindow::as_ptr);
        self.window.store(raw, Ordering::Release);
    }

    pub fn window(&self) -> Option<NativeWindow> {
        NativeWindow::from_raw(self.window.load(Ordering::Acquire))
    }

    /// Whether the overlay consumes this touch.
    pub fn on_touch(&self, action: i32, pointer_id: i32, x: f32, y: f32) -> bool {
        self.arbiter.on_touch(action, pointer_id, x, y)
    }

    /// Hands a raw input event to the overlay once it is initialised.
    pub fn forward_input_event(&self, event: *const c_void) {
        let mut state = self.render();
        if state.driver.is_initialized() {
            state.overlay.handle_input_event(event);
        }
    }

    /// Context activation. `draw` being null means no surface is bound.
    ///
    /// # Safety
    ///
    /// `display` and `draw` are the handles just passed to `eglMakeCurrent`.
    pub unsafe fn on_make_current(&self, display: EglDisplay, draw: EglSurface) {
        let Some(egl) = self.egl.get() else {
            return;
        };
        self.activate_overlay(!draw.is_null(), || unsafe { egl.surface_size(display, draw) });
    }

    /// Presentation, before the host's frame is submitted.
    ///
    /// # Safety
    ///
    /// `display` and `surface` are the handles passed to `eglSwapBuffers`.
    pub unsafe fn on_present(&self, display: EglDisplay, surface: EglSurface) {
        let (Some(egl), Some(gl)) = (self.egl.get(), self.gles.get()) else {
            return;
        };
        let has_context = egl.has_current_context();
        let size = if has_context {
            unsafe { egl.surface_size(display, surface) }
        } else {
            SurfaceSize::default()
        };
        self.present_frame(has_context, size, gl);
    }

    pub fn activate_overlay(
        &self,
        has_draw_surface: bool,
        query_size: impl FnOnce() -> SurfaceSize,
    ) -> bool {
        let window = self.window();
        let mut state = self.render();
        let RenderState {
            driver, overlay, ..
        } = &mut *state;
        driver.activate(window, has_draw_surface, query_size, &mut **overlay)
    }

    pub fn present_frame(
        &self,
        has_context: bool,
        size: SurfaceSize,
        gl: &dyn GlStateApi,
    ) -> FrameOutcome {
        let pointer = self.pointer.get();
        let patches = self.patches.get();
        let bounds = &*self.bounds;
        let mut state = self.render();
        let RenderState {
            driver,
            overlay,
            controls,
        } = &mut *state;
        driver.present(gl, has_context, size, &mut **overlay, |overlay: &mut dyn Overlay| {
            overlay.update_pointer(pointer);
            let mut frame = FrameContext::new(bounds, pointer, controls, patches);
            overlay.render_frame(&mut frame);
            frame.finish();
        })
    }
}
