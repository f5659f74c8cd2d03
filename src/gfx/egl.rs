//! EGL presentation and context-activation hooks.

use std::ffi::{c_int, c_void};
use std::mem;
use std::ptr;

use tracing::{info, warn};

use crate::err::Result;
use crate::gfx::{NativeWindow, SurfaceSize};
use crate::hook::{HookBackend, HookId, HookRegistry};
use crate::module::ModuleResolver;
use crate::runtime;

pub const MODULE: &str = "libEGL.so";
pub const ANDROID_MODULE: &str = "libandroid.so";

pub const SWAP_BUFFERS: HookId = HookId("eglSwapBuffers");
pub const MAKE_CURRENT: HookId = HookId("eglMakeCurrent");
pub const WINDOW_FROM_SURFACE: HookId = HookId("ANativeWindow_fromSurface");

pub type EglDisplay = *mut c_void;
pub type EglSurface = *mut c_void;
pub type EglContext = *mut c_void;
pub type EglBoolean = u32;

pub const EGL_FALSE: EglBoolean = 0;
pub const EGL_HEIGHT: c_int = 0x3056;
pub const EGL_WIDTH: c_int = 0x3057;

type GetCurrentContext = unsafe extern "C" fn() -> EglContext;
type QuerySurface = unsafe extern "C" fn(EglDisplay, EglSurface, c_int, *mut c_int) -> EglBoolean;

type SwapBuffersFn = unsafe extern "C" fn(EglDisplay, EglSurface) -> EglBoolean;
type MakeCurrentFn =
    unsafe extern "C" fn(EglDisplay, EglSurface, EglSurface, EglContext) -> EglBoolean;
type WindowFromSurfaceFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;

/// The EGL queries made from inside the hooks.
#[derive(Debug, Clone, Copy)]
pub struct EglApi {
    get_current_context: GetCurrentContext,
    query_surface: QuerySurface,
}

impl EglApi {
    /// # Safety
    ///
    /// `module` must be an EGL implementation.
    pub unsafe fn load(resolver: &impl ModuleResolver, module: &str) -> Result<Self> {
        unsafe {
            Ok(Self {
                get_current_context: resolver.resolve(module, "eglGetCurrentContext")?.cast(),
                query_surface: resolver.resolve(module, "eglQuerySurface")?.cast(),
            })
        }
    }

    pub fn has_current_context(&self) -> bool {
        !unsafe { (self.get_current_context)() }.is_null()
    }

    /// Size of `surface`; a failed query leaves that dimension at zero.
    ///
    /// # Safety
    ///
    /// `display` and `surface` must be live EGL handles.
    pub unsafe fn surface_size(&self, display: EglDisplay, surface: EglSurface) -> SurfaceSize {
        let (mut w, mut h) = (0, 0);
        unsafe {
            (self.query_surface)(display, surface, EGL_WIDTH, &mut w);
            (self.query_surface)(display, surface, EGL_HEIGHT, &mut h);
        }
        SurfaceSize::new(w, h)
    }
}

unsafe extern "C" fn swap_buffers_detour(display: EglDisplay, surface: EglSurface) -> EglBoolean {
    let Some(rt) = runtime::get() else {
        return EGL_FALSE;
    };
    let Some(original) = rt.hooks().original_of(SWAP_BUFFERS) else {
        return EGL_FALSE;
    };
    let original: SwapBuffersFn = unsafe { mem::transmute(original) };
    runtime::guarded("present hook", || unsafe { rt.on_present(display, surface) });
    unsafe { original(display, surface) }
}

unsafe extern "C" fn make_current_detour(
    display: EglDisplay,
    draw: EglSurface,
    read: EglSurface,
    context: EglContext,
) -> EglBoolean {
    let Some(rt) = runtime::get() else {
        return EGL_FALSE;
    };
    let Some(original) = rt.hooks().original_of(MAKE_CURRENT) else {
        return EGL_FALSE;
    };
    let original: MakeCurrentFn = unsafe { mem::transmute(original) };
    let result = unsafe { original(display, draw, read, context) };
    runtime::guarded("context activation hook", || unsafe { rt.on_make_current(display, draw) });
    result
}

unsafe extern "C" fn window_from_surface_detour(env: *mut c_void, surface: *mut c_void) -> *mut c_void {
    let Some(rt) = runtime::get() else {
        return ptr::null_mut();
    };
    let Some(original) = rt.hooks().original_of(WINDOW_FROM_SURFACE) else {
        return ptr::null_mut();
    };
    let original: WindowFromSurfaceFn = unsafe { mem::transmute(original) };
    let window = unsafe { original(env, surface) };
    rt.set_window(NativeWindow::from_raw(window));
    window
}

/// Hooks presentation, context activation and native window creation.
/// Returns how many of the three were installed.
///
/// # Safety
///
/// The symbols, when present, must be the functions their names describe.
pub unsafe fn install<B: HookBackend>(hooks: &HookRegistry<B>, resolver: &impl ModuleResolver) -> usize {
    let installed = [
        (SWAP_BUFFERS, MODULE, swap_buffers_detour as usize),
        (MAKE_CURRENT, MODULE, make_current_detour as usize),
        (WINDOW_FROM_SURFACE, ANDROID_MODULE, window_from_surface_detour as usize),
    ]
    .into_iter()
    .filter(|&(id, module, detour)| {
        unsafe { hooks.install_symbol(resolver, id, module, id.0, detour) }.is_some()
    })
    .count();

    if hooks.is_installed(SWAP_BUFFERS) {
        info!("graphics hooks: {} of 3", installed);
    } else {
        warn!("no presentation hook, overlay disabled");
    }
    installed
}
