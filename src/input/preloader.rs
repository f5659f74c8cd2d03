//! The optional touch interface exported by the mod loader.

use std::ffi::c_int;

use tracing::{info, warn};

use crate::config::InputConfig;
use crate::module::ModuleResolver;
use crate::runtime;

/// `(action, pointer_id, x, y) -> consumed`
pub type TouchCallback = extern "C" fn(c_int, c_int, f32, f32) -> bool;

#[repr(C)]
pub struct PreloaderInput {
    pub register_touch_callback: Option<unsafe extern "C" fn(TouchCallback)>,
}

type GetPreloaderInput = unsafe extern "C" fn() -> *mut PreloaderInput;

/// Looks up the loader's input interface. `None` means the fallback path
/// has to be used.
pub fn probe(resolver: &impl ModuleResolver, config: &InputConfig) -> Option<&'static PreloaderInput> {
    let Some(handle) = resolver.open(&config.preloader_module) else {
        warn!("{} not found", config.preloader_module);
        return None;
    };
    let Some(sym) = resolver.symbol(handle, &config.preloader_symbol) else {
        warn!(
            "{} not found in {}",
            config.preloader_symbol, config.preloader_module
        );
        return None;
    };
    let get_input: GetPreloaderInput = unsafe { sym.cast() };
    let input = unsafe { get_input().as_ref() };
    match input {
        Some(input) if input.register_touch_callback.is_some() => Some(input),
        _ => {
            warn!("{} returned no usable interface", config.preloader_symbol);
            None
        }
    }
}

/// Registers `callback` and reports whether it went through.
pub fn register(input: &PreloaderInput, callback: TouchCallback) -> bool {
    match input.register_touch_callback {
        Some(register) => {
            unsafe { register(callback) };
            info!("using preloader touch input");
            true
        }
        None => false,
    }
}

/// Feeds the loader's touch events into the arbiter of the live runtime.
pub(crate) extern "C" fn on_touch(action: c_int, pointer_id: c_int, x: f32, y: f32) -> bool {
    runtime::guarded("touch callback", || {
        runtime::get().is_some_and(|rt| rt.on_touch(action, pointer_id, x, y))
    })
    .unwrap_or(false)
}
