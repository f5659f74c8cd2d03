//! Library entry point for the Java VM.
//!
//! A cdylib crate exports `JNI_OnLoad`/`JNI_OnUnload` with
//! [`declare_entry!`](crate::declare_entry), naming the constructor of its
//! overlay.

use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::overlay::Overlay;
use crate::runtime;

pub const JNI_OK: c_int = 0;
pub const JNI_ERR: c_int = -1;
pub const JNI_VERSION_1_6: c_int = 0x0001_0006;

pub type GetEnv = unsafe extern "C" fn(*mut JavaVm, *mut *mut c_void, c_int) -> c_int;

/// `JNIInvokeInterface`. Only `GetEnv` is called.
#[repr(C)]
pub struct InvokeInterface {
    pub reserved: [*mut c_void; 3],
    pub destroy_java_vm: *mut c_void,
    pub attach_current_thread: *mut c_void,
    pub detach_current_thread: *mut c_void,
    pub get_env: Option<GetEnv>,
    pub attach_current_thread_as_daemon: *mut c_void,
}

/// `JavaVM`, a pointer to the invoke interface.
pub type JavaVm = *const InvokeInterface;

/// Whether `vm` hands out a 1.6 environment on this thread.
unsafe fn has_env(vm: *mut JavaVm) -> bool {
    let Some(interface) = (unsafe { vm.as_ref().and_then(|vm| (*vm).as_ref()) }) else {
        return false;
    };
    let Some(get_env) = interface.get_env else {
        return false;
    };
    let mut env = ptr::null_mut();
    unsafe { get_env(vm, &mut env, JNI_VERSION_1_6) == JNI_OK && !env.is_null() }
}

/// Body of `JNI_OnLoad`: checks the VM, then attaches the runtime with the
/// configuration found through `$HOOKPATCH_CONFIG`.
///
/// # Safety
///
/// `vm` must be the pointer the VM passed to `JNI_OnLoad`.
pub unsafe fn on_load(vm: *mut JavaVm, make_overlay: impl FnOnce() -> Box<dyn Overlay>) -> c_int {
    if !unsafe { has_env(vm) } {
        return JNI_ERR;
    }

    let attached = panic::catch_unwind(AssertUnwindSafe(|| {
        let (config, config_error) = match Config::from_env() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        };
        let result = runtime::attach(config, make_overlay());
        if let Some(e) = config_error {
            warn!("bad config, using defaults: {}", e);
        }
        result
    }));
    match attached {
        Ok(Ok(())) => info!("JNI_OnLoad: attached, v{}", env!("CARGO_PKG_VERSION")),
        Ok(Err(e)) => error!("JNI_OnLoad: {:#}", e),
        Err(_) => error!("JNI_OnLoad: attach panicked"),
    }
    JNI_VERSION_1_6
}

/// Exports `JNI_OnLoad` and `JNI_OnUnload` for a cdylib. The argument is
/// called once to build the overlay.
///
/// ```ignore
/// hookpatch::declare_entry!(MyMenu::new);
/// ```
#[macro_export]
macro_rules! declare_entry {
    ($make_overlay:expr) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn JNI_OnLoad(
            vm: *mut $crate::entry::JavaVm,
            _reserved: *mut ::std::ffi::c_void,
        ) -> ::std::ffi::c_int {
            unsafe {
                $crate::entry::on_load(vm, || {
                    ::std::boxed::Box::new(($make_overlay)())
                        as ::std::boxed::Box<dyn $crate::overlay::Overlay>
                })
            }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn JNI_OnUnload(
            _vm: *mut $crate::entry::JavaVm,
            _reserved: *mut ::std::ffi::c_void,
        ) {
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn env_ok(_: *mut JavaVm, env: *mut *mut c_void, version: c_int) -> c_int {
        assert_eq!(version, JNI_VERSION_1_6);
        unsafe { *env = 0x1234 as *mut c_void };
        JNI_OK
    }

    unsafe extern "C" fn env_detached(_: *mut JavaVm, _: *mut *mut c_void, _: c_int) -> c_int {
        -2
    }

    fn interface(get_env: Option<GetEnv>) -> InvokeInterface {
        InvokeInterface {
            reserved: [ptr::null_mut(); 3],
            destroy_java_vm: ptr::null_mut(),
            attach_current_thread: ptr::null_mut(),
            detach_current_thread: ptr::null_mut(),
            get_env,
            attach_current_thread_as_daemon: ptr::null_mut(),
        }
    }

    #[test]
    fn test_get_env_slot() {
        // GetEnv is the seventh pointer of the table
        assert_eq!(
            std::mem::offset_of!(InvokeInterface, get_env),
            6 * std::mem::size_of::<*mut c_void>()
        );
    }

    #[test]
    fn test_has_env() {
        let ok = interface(Some(env_ok));
        let mut vm: JavaVm = &ok;
        assert!(unsafe { has_env(&mut vm) });

        let detached = interface(Some(env_detached));
        let mut vm: JavaVm = &detached;
        assert!(!unsafe { has_env(&mut vm) });

        let empty = interface(None);
        let mut vm: JavaVm = &empty;
        assert!(!unsafe { has_env(&mut vm) });

        assert!(!unsafe { has_env(ptr::null_mut()) });
    }

    #[test]
    fn test_on_load_rejects_vm_without_env() {
        let detached = interface(Some(env_detached));
        let mut vm: JavaVm = &detached;
        let version = unsafe { on_load(&mut vm, || unreachable!("overlay built for a bad VM")) };
        assert_eq!(version, JNI_ERR);
    }
}
