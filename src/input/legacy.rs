//! Fallback input path: observe events inside the platform input library.
//!
//! These hooks can not stop the host from seeing an event; they only let
//! the overlay follow the pointer.

use std::ffi::c_void;
use std::mem;

use tracing::{info, warn};

use crate::config::InputConfig;
use crate::hook::{HookBackend, HookId, HookRegistry};
use crate::module::ModuleResolver;
use crate::runtime;

pub const INIT_MOTION_EVENT: HookId = HookId("InputConsumer::initializeMotionEvent");
pub const CONSUME: HookId = HookId("InputConsumer::consume");

const INIT_MOTION_EVENT_SYMBOL: &str =
    "_ZN7android13InputConsumer21initializeMotionEventEPNS_11MotionEventEPKNS_12InputMessageE";
const CONSUME_SYMBOL: &str =
    "_ZN7android13InputConsumer7consumeEPNS_26InputEventFactoryInterfaceEblPjPPNS_10InputEventE";

type InitMotionEventFn = unsafe extern "C" fn(*mut c_void, *const c_void);
type ConsumeFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, bool, i64, *mut u32, *mut *mut c_void) -> i32;

fn forward(event: *const c_void) {
    if event.is_null() {
        return;
    }
    if let Some(rt) = runtime::get() {
        runtime::guarded("input event forwarding", || rt.forward_input_event(event));
    }
}

unsafe extern "C" fn init_motion_event_detour(event: *mut c_void, msg: *const c_void) {
    let Some(original) = runtime::get().and_then(|rt| rt.hooks().original_of(INIT_MOTION_EVENT))
    else {
        return;
    };
    let original: InitMotionEventFn = unsafe { mem::transmute(original) };
    unsafe { original(event, msg) };
    forward(event);
}

unsafe extern "C" fn consume_detour(
    this: *mut c_void,
    factory: *mut c_void,
    consume_batches: bool,
    frame_time: i64,
    out_seq: *mut u32,
    out_event: *mut *mut c_void,
) -> i32 {
    let Some(original) = runtime::get().and_then(|rt| rt.hooks().original_of(CONSUME)) else {
        return 0;
    };
    let original: ConsumeFn = unsafe { mem::transmute(original) };
    let result = unsafe { original(this, factory, consume_batches, frame_time, out_seq, out_event) };
    if result == 0 && !out_event.is_null() {
        forward(unsafe { *out_event });
    }
    result
}

/// Hooks both input functions. Returns how many were installed.
///
/// # Safety
///
/// The symbols, when present, must be the functions their names describe.
pub unsafe fn install<B: HookBackend>(
    hooks: &HookRegistry<B>,
    resolver: &impl ModuleResolver,
    config: &InputConfig,
) -> usize {
    let module = config.legacy_module.as_str();
    let installed = [
        (INIT_MOTION_EVENT, INIT_MOTION_EVENT_SYMBOL, init_motion_event_detour as usize),
        (CONSUME, CONSUME_SYMBOL, consume_detour as usize),
    ]
    .into_iter()
    .filter(|&(id, symbol, detour)| {
        unsafe { hooks.install_symbol(resolver, id, module, symbol, detour) }.is_some()
    })
    .count();

    if installed == 0 {
        warn!("no input hooks in {}, overlay will not see touches", module);
    } else {
        info!("legacy input: {} of 2 hooks in {}", installed, module);
    }
    installed
}
