//! GLES entry points, resolved from the loaded `libGLESv2.so`.

use std::ffi::c_int;

use crate::err::Result;
use crate::gfx::GlStateApi;
use crate::module::ModuleResolver;

pub const MODULE: &str = "libGLESv2.so";

type GetIntegerv = unsafe extern "C" fn(u32, *mut c_int);
type IsEnabled = unsafe extern "C" fn(u32) -> u8;
type UseProgram = unsafe extern "C" fn(u32);
type BindVertexArray = unsafe extern "C" fn(u32);
type BindFramebuffer = unsafe extern "C" fn(u32, u32);
type Rect = unsafe extern "C" fn(c_int, c_int, c_int, c_int);
type Capability = unsafe extern "C" fn(u32);

/// Function table for the GL calls used around an overlay frame. Only valid
/// on a thread with a current context.
#[derive(Debug, Clone, Copy)]
pub struct GlesApi {
    get_integerv: GetIntegerv,
    is_enabled: IsEnabled,
    use_program: UseProgram,
    bind_vertex_array: BindVertexArray,
    bind_framebuffer: BindFramebuffer,
    viewport: Rect,
    scissor: Rect,
    enable: Capability,
    disable: Capability,
}

impl GlesApi {
    /// # Safety
    ///
    /// `module` must be a GLES 3 implementation.
    pub unsafe fn load(resolver: &impl ModuleResolver, module: &str) -> Result<Self> {
        let sym = |name| resolver.resolve(module, name);
        unsafe {
            Ok(Self {
                get_integerv: sym("glGetIntegerv")?.cast(),
                is_enabled: sym("glIsEnabled")?.cast(),
                use_program: sym("glUseProgram")?.cast(),
                bind_vertex_array: sym("glBindVertexArray")?.cast(),
                bind_framebuffer: sym("glBindFramebuffer")?.cast(),
                viewport: sym("glViewport")?.cast(),
                scissor: sym("glScissor")?.cast(),
                enable: sym("glEnable")?.cast(),
                disable: sym("glDisable")?.cast(),
            })
        }
    }
}

impl GlStateApi for GlesApi {
    fn get_integers(&self, pname: u32, out: &mut [i32]) {
        // callers size `out` for `pname`
        unsafe { (self.get_integerv)(pname, out.as_mut_ptr()) }
    }

    fn is_enabled(&self, cap: u32) -> bool {
        unsafe { (self.is_enabled)(cap) != 0 }
    }

    fn use_program(&self, program: u32) {
        unsafe { (self.use_program)(program) }
    }

    fn bind_vertex_array(&self, array: u32) {
        unsafe { (self.bind_vertex_array)(array) }
    }

    fn bind_framebuffer(&self, target: u32, framebuffer: u32) {
        unsafe { (self.bind_framebuffer)(target, framebuffer) }
    }

    fn viewport(&self, [x, y, w, h]: [i32; 4]) {
        unsafe { (self.viewport)(x, y, w, h) }
    }

    fn scissor(&self, [x, y, w, h]: [i32; 4]) {
        unsafe { (self.scissor)(x, y, w, h) }
    }

    fn set_enabled(&self, cap: u32, enabled: bool) {
        unsafe {
            if enabled {
                (self.enable)(cap)
            } else {
                (self.disable)(cap)
            }
        }
    }
}
