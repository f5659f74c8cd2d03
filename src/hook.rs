//! Function interception.
//!
//! A [`HookBackend`] overwrites the entry of a target function with a jump to
//! a replacement and hands back a trampoline that runs the displaced
//! instructions before continuing in the original body. The [`HookRegistry`]
//! keeps one record per logical hook so the same target is never hooked
//! twice, and lets detours look up their original entry by name.
//!
//! Replacements are expected to call through the original entry themselves;
//! nothing is chained automatically.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tracing::{info, warn};

use crate::err::{Error, Result};
use crate::module::ModuleResolver;
use crate::patch;

#[cfg(any(target_arch = "aarch64", test))]
pub mod aarch64;
mod exec_mem;
#[cfg(any(target_arch = "x86_64", test))]
pub mod x64;

pub(crate) use exec_mem::ExecMemory;

#[cfg(target_arch = "x86_64")]
pub type DefaultBackend = x64::X64Backend;
#[cfg(target_arch = "aarch64")]
pub type DefaultBackend = aarch64::Arm64Backend;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type DefaultBackend = UnsupportedBackend;

/// Logical name of a hook, e.g. `"eglSwapBuffers"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub &'static str);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The mechanism that actually rewrites code.
pub trait HookBackend: Send + Sync {
    /// Prepares the backend. Called once before the first hook.
    fn init(&self) -> Result<()>;

    /// Redirects `target` to `replacement`.
    ///
    /// # Safety
    ///
    /// `target` must be the first instruction of a function, and no other
    /// thread may be executing its first few instructions while they are
    /// rewritten. `replacement` must have the same calling convention.
    unsafe fn hook(&self, target: usize, replacement: usize) -> Result<HookPoint>;
}

/// An installed redirection. Dropping it puts the original bytes back.
#[derive(Debug)]
pub struct HookPoint {
    target: usize,
    original: usize,
    stolen: Vec<u8>,
    _trampoline: Option<ExecMemory>,
    active: bool,
}

impl HookPoint {
    pub(crate) fn new(
        target: usize,
        original: usize,
        stolen: Vec<u8>,
        trampoline: Option<ExecMemory>,
    ) -> Self {
        Self {
            target,
            original,
            stolen,
            _trampoline: trampoline,
            active: true,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Entry that behaves like the unhooked function.
    pub fn original(&self) -> usize {
        self.original
    }

    /// Consume self and unhook the address.
    ///
    /// # Safety
    ///
    /// No thread may be running inside the trampoline, which is freed.
    pub unsafe fn unhook(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if !self.active || self.stolen.is_empty() {
            return Ok(());
        }
        unsafe { patch::write(self.target, &self.stolen, true) }?;
        self.active = false;
        Ok(())
    }
}

// When the HookPoint drops, it should unhook automatically.
impl Drop for HookPoint {
    fn drop(&mut self) {
        self.restore().unwrap_or_default();
    }
}

/// What is known about an installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub target: usize,
    pub replacement: usize,
    pub original: usize,
}

/// Backend for architectures without an inline hooker.
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl HookBackend for UnsupportedBackend {
    fn init(&self) -> Result<()> {
        Err(Error::UnsupportedArch)
    }

    unsafe fn hook(&self, _target: usize, _replacement: usize) -> Result<HookPoint> {
        Err(Error::UnsupportedArch)
    }
}

/// At most one hook per id and per target address.
pub struct HookRegistry<B: HookBackend = DefaultBackend> {
    backend: B,
    hooks: RwLock<HashMap<HookId, (HookRecord, HookPoint)>>,
}

impl Default for HookRegistry<DefaultBackend> {
    fn default() -> Self {
        Self::new(DefaultBackend::default())
    }
}

impl<B: HookBackend> HookRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    pub fn init(&self) -> Result<()> {
        self.backend.init()
    }

    /// Installs `id` and returns the original entry.
    ///
    /// # Safety
    ///
    /// See [`HookBackend::hook`].
    pub unsafe fn install(&self, id: HookId, target: usize, replacement: usize) -> Result<usize> {
        if target == 0 || replacement == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((record, _)) = hooks.get(&id) {
            return Err(Error::AlreadyHooked {
                id: id.0,
                target: record.target,
            });
        }
        if let Some((other, _)) = hooks.iter().find(|(_, (r, _))| r.target == target) {
            return Err(Error::AlreadyHooked {
                id: other.0,
                target,
            });
        }

        let point = unsafe { self.backend.hook(target, replacement) }?;
        let record = HookRecord {
            target,
            replacement,
            original: point.original(),
        };
        info!(
            "hooked {} at {:#x}, original entry {:#x}",
            id, target, record.original
        );
        hooks.insert(id, (record, point));
        Ok(record.original)
    }

    /// Resolves `module!symbol` and hooks it. Failures are logged and
    /// reported as `None` so the dependent feature can stay disabled.
    ///
    /// # Safety
    ///
    /// See [`HookBackend::hook`].
    pub unsafe fn install_symbol(
        &self,
        resolver: &impl ModuleResolver,
        id: HookId,
        module: &str,
        symbol: &str,
        replacement: usize,
    ) -> Option<usize> {
        let installed = resolver
            .resolve(module, symbol)
            .and_then(|addr| unsafe { self.install(id, addr.get(), replacement) });
        match installed {
            Ok(original) => Some(original),
            Err(e) => {
                warn!("hook {} ({}!{}) unavailable: {}", id, module, symbol, e);
                None
            }
        }
    }

    pub fn is_installed(&self, id: HookId) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn original_of(&self, id: HookId) -> Option<usize> {
        self.record(id).map(|r| r.original)
    }

    pub fn record(&self, id: HookId) -> Option<HookRecord> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|(record, _)| *record)
    }

    /// Restores the target's bytes. Returns whether `id` was installed.
    ///
    /// # Safety
    ///
    /// See [`HookPoint::unhook`].
    pub unsafe fn uninstall(&self, id: HookId) -> Result<bool> {
        let removed = self
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some((record, point)) => {
                unsafe { point.unhook() }?;
                info!("unhooked {} at {:#x}", id, record.target);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
