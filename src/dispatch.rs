//! Render-thread marshaling.
//!
//! The graphics context is single-thread-affine: every GPU-touching call
//! must run on the render thread. Other threads hand closures to a
//! [`RenderThreadDispatcher`]; the frame driver drains them at the start of
//! each frame, giving each closure the backend.

use crate::backend::GraphicsBackend;
use std::sync::mpsc;

/// Type-erased work closure executed on the render thread.
pub type GpuWork = Box<dyn FnOnce(&mut dyn GraphicsBackend) + Send>;

/// Sending half, cloneable across threads.
#[derive(Clone)]
pub struct RenderThreadDispatcher {
    sender: mpsc::Sender<GpuWork>,
}

/// Receiving half, owned by the frame driver.
pub struct GpuWorkQueue {
    receiver: mpsc::Receiver<GpuWork>,
}

/// Create a connected dispatcher/queue pair.
pub fn render_thread_channel() -> (RenderThreadDispatcher, GpuWorkQueue) {
    let (sender, receiver) = mpsc::channel();
    (
        RenderThreadDispatcher { sender },
        GpuWorkQueue { receiver },
    )
}

impl RenderThreadDispatcher {
    /// Fire-and-forget: the closure runs at the start of some upcoming frame.
    pub fn dispatch(&self, work: impl FnOnce(&mut dyn GraphicsBackend) + Send + 'static) {
        self.sender
            .send(Box::new(work))
            .expect("render thread work queue disconnected");
    }

    /// Blocking submission for synchronous needs: waits until the render
    /// thread has executed the closure and returns its result.
    pub fn dispatch_blocking<R, F>(&self, work: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn GraphicsBackend) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.dispatch(move |backend| {
            let _ = result_tx.send(work(backend));
        });
        result_rx
            .recv()
            .expect("render thread dropped marshaled work")
    }
}

impl GpuWorkQueue {
    /// Run all pending work against the backend. Returns the number of
    /// closures executed.
    pub fn drain(&self, backend: &mut dyn GraphicsBackend) -> usize {
        let mut count = 0;
        while let Ok(work) = self.receiver.try_recv() {
            work(backend);
            count += 1;
        }
        if count > 0 {
            log::trace!("drained {count} marshaled GPU calls");
        }
        count
    }
}
