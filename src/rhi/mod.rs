//! Render hardware interface
//!
//! The pipeline talks to the GPU through the [`Rhi`] trait. Commands are
//! asynchronous: each returns immediately and executes later, in
//! submission order, on the RHI thread. Completion is observed either by
//! polling the returned [`GpuFence`] or by enqueueing a lambda, which runs
//! after every command submitted before it.

pub mod fence;
pub mod software;
pub mod texture;

use std::sync::Arc;

pub use fence::GpuFence;
pub use software::SoftwareRhi;
pub use texture::{Texture, TextureDesc, TextureFormat, TextureRef};

/// Work scheduled on the RHI thread
pub type RhiCommand = Box<dyn FnOnce() + Send + 'static>;

pub trait Rhi: Send + Sync {
    /// Allocate a texture
    fn create_texture(&self, desc: TextureDesc) -> TextureRef;

    /// Copy `src` into `dst`, scaling to the destination size and
    /// swizzling to its format
    fn copy_texture(&self, src: &TextureRef, dst: &TextureRef) -> Arc<GpuFence>;

    /// Compute-pass conversion of a colour texture into three R8 planes
    fn convert_to_i420(
        &self,
        src: &TextureRef,
        y: &TextureRef,
        u: &TextureRef,
        v: &TextureRef,
    ) -> Arc<GpuFence>;

    /// Run `command` on the RHI thread after all previously issued commands
    fn enqueue(&self, command: RhiCommand);

    /// Copy texture contents to CPU memory
    ///
    /// Only meaningful once the commands writing `texture` have completed,
    /// so callers read back from an enqueued lambda.
    fn read_texture(&self, texture: &TextureRef) -> Vec<u8> {
        texture.pixels().clone()
    }

    /// Fence signalled once every command issued so far has executed
    fn flush(&self) -> Arc<GpuFence> {
        let fence = Arc::new(GpuFence::new("flush"));
        let signal = fence.clone();
        self.enqueue(Box::new(move || signal.signal()));
        fence
    }
}
