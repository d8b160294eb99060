use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bitmap::{Bitmap, BitmapDecoder};
use render_service::{RenderClient, RenderQuality, RenderRequest, SurfaceSize, ViewId};

pub use display_link::DisplayDetached;

pub const DEFAULT_WORKER_THREAD_NAME: &str = "canvas_refresh";

/// Shared dirty marker for the displayed image.
///
/// Any number of invalidations while the flag is already set cost one
/// boolean store and are served together by the next fetch iteration.
#[derive(Debug, Default)]
pub struct StalenessFlag {
    stale: AtomicBool,
}

impl StalenessFlag {
    pub fn new() -> Self {
        Self {
            stale: AtomicBool::new(false),
        }
    }

    /// Test-and-set. True means this call made the false to true
    /// transition, the edge on which a fetch loop is spawned.
    pub fn mark(&self) -> bool {
        !self.stale.swap(true, Ordering::AcqRel)
    }

    /// Test-and-clear. Returns whether the flag was set.
    pub fn take(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    /// Unconditional set without edge reporting: used when the server
    /// marks its own response stale while a loop is already running.
    pub fn force(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub quality: RenderQuality,
    pub worker_thread_name: &'static str,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            quality: RenderQuality::MAX,
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME,
        }
    }
}

/// What the coordinator requires of the presentation layer. The real
/// implementation marshals across the display link; tests supply
/// in-process fakes.
pub trait DisplaySurface: Send + Sync {
    /// Fresh surface size, sampled synchronously at the start of every
    /// fetch attempt. `Err` means the surface is gone for good.
    fn surface_size(&self) -> Result<SurfaceSize, DisplayDetached>;

    fn is_disposed(&self) -> bool;

    /// Hands a decoded frame toward the presentation thread. The frame
    /// is applied by the presentation loop, or discarded if the surface
    /// is torn down first.
    fn publish(&self, frame: Arc<Bitmap>) -> Result<(), DisplayDetached>;
}

struct CoordinatorInner {
    config: RefreshConfig,
    stale: StalenessFlag,
    // Serializes fetch-loop instances. Only covers the narrow window
    // between a finishing loop's last flag check and its actual exit.
    worker_gate: Mutex<()>,
    shutdown_requested: AtomicBool,
    client: RwLock<Option<Arc<dyn RenderClient>>>,
    view_id: AtomicI64,
    display: Arc<dyn DisplaySurface>,
    decoder: Arc<dyn BitmapDecoder>,
    spawned_fetch_loops: AtomicU64,
    completed_fetch_iterations: AtomicU64,
    skipped_fetch_iterations: AtomicU64,
    failed_fetch_iterations: AtomicU64,
}

impl CoordinatorInner {
    fn active_client(&self) -> Option<Arc<dyn RenderClient>> {
        self.client
            .read()
            .unwrap_or_else(|_| panic!("active client lock poisoned"))
            .clone()
    }

    fn active_view_id(&self) -> ViewId {
        ViewId::new(self.view_id.load(Ordering::Acquire))
    }
}

/// Decides when to fetch a new image from the remote renderer.
///
/// `invalidate` may be called from any thread and never waits on fetch
/// work; at most one render call is outstanding at any time, and every
/// invalidation is served by at least one further fetch iteration.
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
    worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl RefreshCoordinator {
    pub fn new(
        display: Arc<dyn DisplaySurface>,
        decoder: Arc<dyn BitmapDecoder>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                stale: StalenessFlag::new(),
                worker_gate: Mutex::new(()),
                shutdown_requested: AtomicBool::new(false),
                client: RwLock::new(None),
                view_id: AtomicI64::new(ViewId::UNSET.raw()),
                display,
                decoder,
                spawned_fetch_loops: AtomicU64::new(0),
                completed_fetch_iterations: AtomicU64::new(0),
                skipped_fetch_iterations: AtomicU64::new(0),
                failed_fetch_iterations: AtomicU64::new(0),
            }),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the remote client. Returns whether the value actually
    /// changed. Observed at the start of the next fetch, never
    /// mid-flight.
    pub fn set_client(&self, client: Option<Arc<dyn RenderClient>>) -> bool {
        let mut active_client = self
            .inner
            .client
            .write()
            .unwrap_or_else(|_| panic!("active client lock poisoned"));
        let changed = match (active_client.as_ref(), client.as_ref()) {
            (None, None) => false,
            (Some(current), Some(replacement)) => !Arc::ptr_eq(current, replacement),
            _ => true,
        };
        if changed {
            *active_client = client;
        }
        changed
    }

    /// Replaces the logical view id. Returns whether the value actually
    /// changed. An invalid id (`ViewId::UNSET` or any negative raw id)
    /// makes fetches skip instead of fault.
    pub fn set_view_id(&self, view_id: ViewId) -> bool {
        let previous_raw = self.inner.view_id.swap(view_id.raw(), Ordering::AcqRel);
        previous_raw != view_id.raw()
    }

    /// Marks the displayed image stale. Returns immediately when a
    /// fetch loop already has the invalidation covered; otherwise
    /// spawns exactly one fetch-loop worker.
    pub fn invalidate(&self) {
        if !self.inner.stale.mark() {
            return;
        }
        self.spawn_fetch_loop();
    }

    pub fn is_stale(&self) -> bool {
        self.inner.stale.is_stale()
    }

    pub fn spawned_fetch_loops(&self) -> u64 {
        self.inner.spawned_fetch_loops.load(Ordering::Relaxed)
    }

    pub fn completed_fetch_iterations(&self) -> u64 {
        self.inner.completed_fetch_iterations.load(Ordering::Relaxed)
    }

    pub fn skipped_fetch_iterations(&self) -> u64 {
        self.inner.skipped_fetch_iterations.load(Ordering::Relaxed)
    }

    pub fn failed_fetch_iterations(&self) -> u64 {
        self.inner.failed_fetch_iterations.load(Ordering::Relaxed)
    }

    fn spawn_fetch_loop(&self) {
        let worker_inner = Arc::clone(&self.inner);
        let join_handle = std::thread::Builder::new()
            .name(self.inner.config.worker_thread_name.to_owned())
            .spawn(move || fetch_loop(worker_inner))
            .expect("spawn canvas refresh thread");
        // Registration is append-only: concurrent spawners may land in
        // either order, and neither must displace a handle whose loop
        // is still running. Finished loops are pruned here; whatever
        // remains is joined on drop.
        let mut worker_handles = self
            .worker_handles
            .lock()
            .unwrap_or_else(|_| panic!("refresh worker handle lock poisoned"));
        worker_handles.retain(|handle| !handle.is_finished());
        worker_handles.push(join_handle);
        self.inner.spawned_fetch_loops.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for RefreshCoordinator {
    // Cooperative teardown: no in-flight render is cancelled, each loop
    // observes shutdown at its next condition check. The presentation
    // pump must be torn down first, or a worker blocked in a size query
    // would stall this join.
    fn drop(&mut self) {
        self.inner
            .shutdown_requested
            .store(true, Ordering::Release);
        let worker_handles = std::mem::take(
            &mut *self
                .worker_handles
                .lock()
                .unwrap_or_else(|_| panic!("refresh worker handle lock poisoned")),
        );
        for join_handle in worker_handles {
            join_handle.join().expect("join canvas refresh thread");
        }
    }
}

fn fetch_loop(inner: Arc<CoordinatorInner>) {
    let _gate = inner
        .worker_gate
        .lock()
        .unwrap_or_else(|_| panic!("refresh worker gate poisoned"));

    while !inner.shutdown_requested.load(Ordering::Acquire)
        && !inner.display.is_disposed()
        && inner.stale.take()
    {
        let current_size = match inner.display.surface_size() {
            Ok(size) => size,
            Err(DisplayDetached) => break,
        };
        let view_id = inner.active_view_id();
        let Some(client) = inner.active_client() else {
            inner
                .skipped_fetch_iterations
                .fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if current_size.is_empty() || !view_id.is_valid() {
            inner
                .skipped_fetch_iterations
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let request = RenderRequest::for_surface(view_id, inner.config.quality, current_size);
        tracing::debug!(
            view = view_id.raw(),
            width = request.width,
            height = request.height,
            "requesting remote render"
        );
        let response = match client.render(request) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(view = view_id.raw(), %error, "remote render failed");
                inner
                    .failed_fetch_iterations
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        tracing::debug!(
            view = view_id.raw(),
            payload_bytes = response.payload.len(),
            server_stale = response.server_stale,
            "received remote render"
        );

        if response.server_stale {
            // The remote already considers this image out of date.
            // Guarantee another iteration even if decode fails below.
            inner.stale.force();
        }

        let frame = match inner.decoder.decode(&response.payload) {
            Ok(decoded) => Arc::new(decoded),
            Err(error) => {
                tracing::warn!(view = view_id.raw(), %error, "render payload decode failed");
                inner
                    .failed_fetch_iterations
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if let Err(DisplayDetached) = inner.display.publish(frame) {
            tracing::debug!("surface torn down before publish");
        }
        inner
            .completed_fetch_iterations
            .fetch_add(1, Ordering::Relaxed);
    }
    // Releasing the gate is the loop's final action; nothing may touch
    // shared state after it.
}
