/*!
In-process hooking and patching for a host application, with an overlay
rendered inside the host's own graphics context.

Once loaded into the process, the crate

* resolves modules, symbols and sections through the dynamic linker
  ([`module`]),
* redirects functions to detours with inline hooks and keeps a registry of
  what it hooked ([`hook`]),
* finds patch sites by byte signature in the target module's code
  ([`scanner`]) and toggles them between replacement and original bytes
  ([`patch`], [`controls`]),
* renders an [`Overlay`] on every presented frame without leaking GL state
  into the host ([`gfx`]),
* decides whether each touch belongs to the overlay or the host
  ([`input`]).

# Usage

A `cdylib` that implements [`Overlay`] exports the VM entry points:

```ignore
struct Menu { /* ... */ }

impl hookpatch::Overlay for Menu {
    // ...
}

hookpatch::declare_entry!(|| Menu::default());
```

`JNI_OnLoad` reads the configuration named by `$HOOKPATCH_CONFIG` (all
defaults when unset), installs logging, and starts a background thread
that hooks the graphics and input entry points and waits for the target
module to be scanned. See [`runtime`] for the individual steps.

Only 64-bit targets are supported. Inline hooking is implemented for
`x86_64` and `aarch64`.
*/

#[cfg(not(target_pointer_width = "64"))]
compile_error!("hookpatch only supports 64-bit targets");

pub mod config;
pub mod controls;
pub mod entry;
mod err;
pub mod gfx;
pub mod hook;
pub mod input;
pub mod logging;
pub mod module;
pub mod overlay;
pub mod patch;
pub mod protect;
pub mod retry;
pub mod runtime;
pub mod scanner;

pub use config::Config;
pub use err::{Error, Result};
pub use hook::{HookBackend, HookId, HookPoint, HookRegistry};
pub use module::{DynamicLinker, ModuleHandle, ModuleResolver, SectionDescriptor, SymbolAddress};
pub use overlay::{FrameContext, Overlay, OverlayWindow};
pub use patch::{PatchSite, PatchSiteTable};
pub use scanner::SignaturePattern;
