use std::sync::{Arc, RwLock};
use std::time::Duration;

use display_link::{DisplayHandle, PresentationPump, create_display_link};
use refresh::{DisplayDetached, DisplaySurface};

pub use bitmap::{Bitmap, BitmapDecodeError, BitmapDecoder, BitmapError, EncodedImageDecoder};
pub use refresh::{RefreshConfig, RefreshCoordinator};
pub use render_service::{
    RenderClient, RenderQuality, RenderRequest, RenderResponse, RenderServiceError, SurfaceSize,
    ViewId,
};

/// The currently displayed bitmap, latest-wins.
///
/// Written only by the presentation loop when it applies a finished
/// frame; read by the paint path at any time. The lock is held just
/// long enough to clone or swap the `Arc`, so a concurrent paint never
/// observes a half-replaced frame.
#[derive(Default)]
pub struct CanvasState {
    displayed: RwLock<Option<Arc<Bitmap>>>,
}

impl CanvasState {
    pub fn new() -> Self {
        Self {
            displayed: RwLock::new(None),
        }
    }

    /// Replaces the displayed bitmap, returning the frame it displaced.
    pub fn replace(&self, frame: Arc<Bitmap>) -> Option<Arc<Bitmap>> {
        self.displayed
            .write()
            .unwrap_or_else(|_| panic!("displayed bitmap lock poisoned"))
            .replace(frame)
    }

    /// Clears the displayed bitmap, returning it.
    pub fn take(&self) -> Option<Arc<Bitmap>> {
        self.displayed
            .write()
            .unwrap_or_else(|_| panic!("displayed bitmap lock poisoned"))
            .take()
    }

    pub fn current(&self) -> Option<Arc<Bitmap>> {
        self.displayed
            .read()
            .unwrap_or_else(|_| panic!("displayed bitmap lock poisoned"))
            .clone()
    }

    pub fn has_bitmap(&self) -> bool {
        self.displayed
            .read()
            .unwrap_or_else(|_| panic!("displayed bitmap lock poisoned"))
            .is_some()
    }
}

/// `DisplaySurface` over the worker side of a display link: size
/// queries and publishes become channel traffic serviced by the
/// presentation loop, and disposal follows the pump's lifetime.
pub struct LinkedSurface {
    handle: DisplayHandle,
}

impl LinkedSurface {
    pub fn new(handle: DisplayHandle) -> Self {
        Self { handle }
    }
}

impl DisplaySurface for LinkedSurface {
    fn surface_size(&self) -> Result<SurfaceSize, DisplayDetached> {
        self.handle.request_size()
    }

    fn is_disposed(&self) -> bool {
        self.handle.is_disposed()
    }

    fn publish(&self, frame: Arc<Bitmap>) -> Result<(), DisplayDetached> {
        self.handle.publish_bitmap(frame)
    }
}

/// Presentation-side facade over the refresh machinery.
///
/// Owned and driven by the single-threaded presentation loop: resize
/// and explicit refresh notifications come in, `service` answers
/// worker traffic and applies finished frames, and the paint path
/// reads `current_bitmap`. None of these calls wait on the remote
/// renderer.
pub struct SurfaceAdapter {
    // Declared before the coordinator: teardown must detach the link
    // first so a worker blocked in a size query errors out before the
    // coordinator joins it.
    pump: PresentationPump,
    canvas: Arc<CanvasState>,
    coordinator: RefreshCoordinator,
}

impl SurfaceAdapter {
    pub fn new(decoder: Arc<dyn BitmapDecoder>, config: RefreshConfig) -> Self {
        let (pump, handle) = create_display_link();
        let surface = Arc::new(LinkedSurface::new(handle));
        let coordinator = RefreshCoordinator::new(surface, decoder, config);
        Self {
            pump,
            canvas: Arc::new(CanvasState::new()),
            coordinator,
        }
    }

    /// Replaces the remote client; observed on the next fetch, never
    /// mid-flight. Returns whether the value actually changed.
    pub fn set_client(&self, client: Option<Arc<dyn RenderClient>>) -> bool {
        self.coordinator.set_client(client)
    }

    /// Replaces the rendered view id; observed on the next fetch.
    /// Returns whether the value actually changed.
    pub fn set_view_id(&self, view_id: ViewId) -> bool {
        self.coordinator.set_view_id(view_id)
    }

    /// Call on any surface resize.
    pub fn resized(&self) {
        self.coordinator.invalidate();
    }

    /// Explicit invalidation, for when the view content changed
    /// remotely without a resize.
    pub fn refresh(&self) {
        self.coordinator.invalidate();
    }

    /// One presentation-loop tick: answers pending size queries with
    /// `current_size` and applies the newest finished frame, if any.
    /// Returns whether a repaint is needed.
    pub fn service(&self, current_size: SurfaceSize) -> bool {
        self.pump.answer_size_requests(current_size);
        match self.pump.take_published() {
            Some(frame) => {
                self.canvas.replace(frame);
                true
            }
            None => false,
        }
    }

    /// Parks the presentation loop until a worker needs servicing or
    /// `timeout` elapses. Returns whether activity was signaled.
    pub fn wait_activity(&self, timeout: Duration) -> bool {
        self.pump.wait_activity(timeout)
    }

    /// Bitmap for the paint path to draw, stretched or cropped to the
    /// paint region. `None` until the first fetch completes; drawing
    /// nothing is valid.
    pub fn current_bitmap(&self) -> Option<Arc<Bitmap>> {
        self.canvas.current()
    }

    /// Shared canvas state, for paint callbacks that hold their own
    /// reference.
    pub fn canvas(&self) -> Arc<CanvasState> {
        Arc::clone(&self.canvas)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}
