use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bitmap::Bitmap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use crossbeam_queue::ArrayQueue;
use render_service::SurfaceSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayDetached;

impl fmt::Display for DisplayDetached {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "presentation side of the display link is gone")
    }
}

impl std::error::Error for DisplayDetached {}

struct SizeRequest {
    reply: Sender<SurfaceSize>,
}

// Both activity endpoints live here so the channel can never disconnect
// while either link half is alive; a disconnect is therefore a bug.
struct LinkShared {
    disposed: AtomicBool,
    // Single slot; a publish that finds it full evicts the older frame.
    published: ArrayQueue<Arc<Bitmap>>,
    activity_sender: Sender<()>,
    activity_receiver: Receiver<()>,
    published_frames: AtomicU64,
    replaced_frames: AtomicU64,
}

/// Worker-side endpoint of the link. Held behind `Arc` by the refresh
/// machinery; all methods take `&self` and are safe from any thread.
/// The `Arc<LinkShared>` inside is not exposed, so no additional
/// endpoints can be created.
pub struct DisplayHandle {
    shared: Arc<LinkShared>,
    size_request_sender: Sender<SizeRequest>,
}

impl DisplayHandle {
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Synchronous size query: blocks until the presentation loop
    /// answers via `PresentationPump::answer_size_requests`, or until
    /// the pump is dropped.
    pub fn request_size(&self) -> Result<SurfaceSize, DisplayDetached> {
        if self.is_disposed() {
            return Err(DisplayDetached);
        }
        let (reply_sender, reply_receiver) = bounded(1);
        self.size_request_sender
            .send(SizeRequest {
                reply: reply_sender,
            })
            .map_err(|_| DisplayDetached)?;
        self.notify_activity();
        reply_receiver.recv().map_err(|_| DisplayDetached)
    }

    /// Fire-and-forget publish. An undelivered predecessor is replaced,
    /// not queued behind; the presentation loop only ever applies the
    /// newest frame.
    pub fn publish_bitmap(&self, frame: Arc<Bitmap>) -> Result<(), DisplayDetached> {
        if self.is_disposed() {
            return Err(DisplayDetached);
        }
        let mut pending_frame = frame;
        loop {
            match self.shared.published.push(pending_frame) {
                Ok(()) => break,
                Err(returned_frame) => {
                    pending_frame = returned_frame;
                    if self.shared.published.pop().is_some() {
                        self.shared.replaced_frames.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
        self.shared.published_frames.fetch_add(1, Ordering::Relaxed);
        self.notify_activity();
        Ok(())
    }

    pub fn published_frames(&self) -> u64 {
        self.shared.published_frames.load(Ordering::Relaxed)
    }

    pub fn replaced_frames(&self) -> u64 {
        self.shared.replaced_frames.load(Ordering::Relaxed)
    }

    fn notify_activity(&self) {
        match self.shared.activity_sender.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                panic!("display link activity channel disconnected")
            }
        }
    }
}

/// Presentation-side endpoint, owned and driven by the single-threaded
/// presentation loop. Dropping it detaches the link: workers see
/// `is_disposed`, a blocked size query errors out, and any undelivered
/// publish is discarded instead of applied.
pub struct PresentationPump {
    shared: Arc<LinkShared>,
    size_request_receiver: Receiver<SizeRequest>,
}

impl PresentationPump {
    /// Answers every pending size query with `current_size`; returns how
    /// many were answered.
    pub fn answer_size_requests(&self, current_size: SurfaceSize) -> usize {
        let mut answered = 0;
        while let Ok(request) = self.size_request_receiver.try_recv() {
            let _ = request.reply.send(current_size);
            answered += 1;
        }
        answered
    }

    /// Removes the newest published frame, if any.
    pub fn take_published(&self) -> Option<Arc<Bitmap>> {
        let mut latest_frame = None;
        while let Some(frame) = self.shared.published.pop() {
            latest_frame = Some(frame);
        }
        latest_frame
    }

    /// Parks the presentation loop until a worker needs servicing or
    /// `wait_timeout` elapses. Returns whether activity was signaled.
    pub fn wait_activity(&self, wait_timeout: Duration) -> bool {
        match self.shared.activity_receiver.recv_timeout(wait_timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                panic!("display link activity channel disconnected")
            }
        }
    }

    pub fn published_frames(&self) -> u64 {
        self.shared.published_frames.load(Ordering::Relaxed)
    }

    pub fn replaced_frames(&self) -> u64 {
        self.shared.replaced_frames.load(Ordering::Relaxed)
    }
}

impl Drop for PresentationPump {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
    }
}

pub fn create_display_link() -> (PresentationPump, DisplayHandle) {
    let (activity_sender, activity_receiver) = bounded(1);
    let shared = Arc::new(LinkShared {
        disposed: AtomicBool::new(false),
        published: ArrayQueue::new(1),
        activity_sender,
        activity_receiver,
        published_frames: AtomicU64::new(0),
        replaced_frames: AtomicU64::new(0),
    });

    // Serialized fetch loops keep at most one size query outstanding.
    let (size_request_sender, size_request_receiver) = bounded(1);

    let pump = PresentationPump {
        shared: shared.clone(),
        size_request_receiver,
    };
    let handle = DisplayHandle {
        shared,
        size_request_sender,
    };
    (pump, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_frame(width: u32, height: u32, fill: u8) -> Arc<Bitmap> {
        let pixel_count = (width * height * 4) as usize;
        Arc::new(
            Bitmap::from_rgba8(width, height, vec![fill; pixel_count]).expect("build test frame"),
        )
    }

    #[test]
    fn size_request_round_trips_through_the_pump() {
        let (pump, handle) = create_display_link();

        let worker = std::thread::spawn(move || handle.request_size());

        let start = Instant::now();
        let mut answered = 0;
        while answered == 0 && start.elapsed() < Duration::from_secs(1) {
            pump.wait_activity(Duration::from_millis(10));
            answered = pump.answer_size_requests(SurfaceSize::new(800, 600));
        }
        assert_eq!(answered, 1);

        let size = worker
            .join()
            .expect("join size request worker")
            .expect("size request must succeed while pump is alive");
        assert_eq!(size, SurfaceSize::new(800, 600));
    }

    #[test]
    fn dropping_the_pump_unblocks_a_waiting_size_request() {
        let (pump, handle) = create_display_link();

        let worker = std::thread::spawn(move || handle.request_size());

        // Give the worker time to block inside the reply wait.
        std::thread::sleep(Duration::from_millis(50));
        drop(pump);

        let result = worker.join().expect("join size request worker");
        assert_eq!(result, Err(DisplayDetached));
    }

    #[test]
    fn publish_keeps_only_the_newest_frame() {
        let (pump, handle) = create_display_link();

        handle
            .publish_bitmap(test_frame(2, 2, 1))
            .expect("publish first frame");
        handle
            .publish_bitmap(test_frame(2, 2, 9))
            .expect("publish second frame");

        let delivered = pump.take_published().expect("a frame must be pending");
        assert_eq!(delivered.rgba()[0], 9);
        assert!(pump.take_published().is_none());
        assert_eq!(pump.published_frames(), 2);
        assert_eq!(pump.replaced_frames(), 1);
    }

    #[test]
    fn publish_after_dispose_reports_detached() {
        let (pump, handle) = create_display_link();
        drop(pump);

        assert!(handle.is_disposed());
        assert_eq!(
            handle.publish_bitmap(test_frame(1, 1, 3)),
            Err(DisplayDetached)
        );
        assert_eq!(handle.request_size(), Err(DisplayDetached));
    }

    #[test]
    fn wait_activity_times_out_when_idle() {
        let (pump, _handle) = create_display_link();
        let start = Instant::now();
        assert!(!pump.wait_activity(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_activity_wakes_on_publish() {
        let (pump, handle) = create_display_link();

        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle
                .publish_bitmap(test_frame(1, 1, 5))
                .expect("publish frame");
        });

        assert!(pump.wait_activity(Duration::from_secs(1)));
        assert!(pump.take_published().is_some());
        publisher.join().expect("join publisher thread");
    }
}
