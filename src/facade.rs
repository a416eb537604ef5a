//! Public capture façade.
//!
//! `Capturer` is thin glue: it owns a boxed platform backend, holds the
//! consumer's frame callback, and enforces call-order discipline (a stream
//! cannot start without a callback installed). Everything else forwards.

use std::sync::Arc;

use crate::backend::{self, CaptureBackend, CaptureTarget};
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, ImageData, Region};

/// A capture session against one display, window, or screen rectangle.
///
/// The handle is movable but not copyable; the backend and all its native
/// resources are owned exclusively. Dropping a running capturer stops the
/// stream and joins the producer.
pub struct Capturer {
    backend: Box<dyn CaptureBackend>,
    callback: Option<FrameCallback>,
    running: bool,
}

impl Capturer {
    /// Builds the platform backend for `target`.
    pub fn new(target: CaptureTarget) -> CaptureResult<Self> {
        Ok(Self {
            backend: backend::create_backend(target)?,
            callback: None,
            running: false,
        })
    }

    /// Installs (or replaces) the frame callback.
    ///
    /// The callback is invoked from a capture thread, never from the caller's
    /// thread. Replacement only takes effect for the next `start`.
    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// One-shot capture. An unset region captures the configured region, or
    /// failing that the full source.
    pub fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
        self.backend.screenshot(region)
    }

    /// Starts streaming frames to the installed callback.
    pub fn start(&mut self) -> CaptureResult<()> {
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| CaptureError::Resource("no frame callback set".to_string()))?;
        self.backend.start(callback)?;
        self.running = true;
        Ok(())
    }

    /// Stops the stream and releases capture resources. Idempotent; a no-op
    /// before the first `start`.
    pub fn stop(&mut self) {
        self.backend.stop();
        self.running = false;
    }

    pub fn pause(&mut self) {
        self.backend.pause();
    }

    pub fn resume(&mut self) {
        self.backend.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.backend.is_paused()
    }

    /// Updates the crop rectangle; the next frame reflects it.
    pub fn set_region(&mut self, region: Region) -> CaptureResult<()> {
        self.backend.set_region(region)
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        if self.running {
            self.backend.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Records lifecycle calls so the façade's ordering rules can be checked
    /// without a live display.
    #[derive(Default)]
    struct MockState {
        started: AtomicU32,
        stopped: AtomicU32,
        paused: AtomicBool,
    }

    struct MockBackend {
        state: Arc<MockState>,
        region: Region,
    }

    impl CaptureBackend for MockBackend {
        fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
            let active = if region.is_set() { region } else { self.region };
            match active.clamp_to(1920, 1080) {
                Some((_, _, w, h)) => ImageData::alloc(w, h),
                None => ImageData::alloc(1920, 1080),
            }
        }

        fn start(&mut self, callback: FrameCallback) -> CaptureResult<()> {
            self.state.started.fetch_add(1, Ordering::SeqCst);
            callback(&Frame::default());
            Ok(())
        }

        fn stop(&mut self) {
            self.state.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn pause(&mut self) {
            self.state.paused.store(true, Ordering::Release);
        }

        fn resume(&mut self) {
            self.state.paused.store(false, Ordering::Release);
        }

        fn is_paused(&self) -> bool {
            self.state.paused.load(Ordering::Acquire)
        }

        fn set_region(&mut self, region: Region) -> CaptureResult<()> {
            self.region = region;
            Ok(())
        }
    }

    fn mock_capturer() -> (Capturer, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let capturer = Capturer {
            backend: Box::new(MockBackend {
                state: Arc::clone(&state),
                region: Region::unset(),
            }),
            callback: None,
            running: false,
        };
        (capturer, state)
    }

    #[test]
    fn start_without_callback_fails() {
        let (mut capturer, state) = mock_capturer();
        let err = capturer.start().unwrap_err();
        assert!(err.to_string().contains("no frame callback set"));
        assert_eq!(state.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_delivers_frames_to_callback() {
        let (mut capturer, _state) = mock_capturer();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        capturer.on_frame(move |_frame| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        capturer.start().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent_and_stop_before_start_is_a_noop() {
        let (mut capturer, state) = mock_capturer();
        capturer.stop();
        capturer.stop();
        // The backend tolerates redundant stops; the façade forwards them.
        assert_eq!(state.started.load(Ordering::SeqCst), 0);

        capturer.on_frame(|_| {});
        capturer.start().unwrap();
        capturer.stop();
        capturer.stop();
        assert_eq!(state.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_stops_a_running_capturer() {
        let (mut capturer, state) = mock_capturer();
        capturer.on_frame(|_| {});
        capturer.start().unwrap();
        drop(capturer);
        assert!(state.stopped.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn pause_resume_round_trip() {
        let (mut capturer, _state) = mock_capturer();
        assert!(!capturer.is_paused());
        capturer.pause();
        assert!(capturer.is_paused());
        capturer.resume();
        assert!(!capturer.is_paused());
    }

    #[test]
    fn screenshot_uses_explicit_then_configured_region() {
        let (mut capturer, _state) = mock_capturer();
        let img = capturer.screenshot(Region::new(0.0, 0.0, 100.0, 100.0)).unwrap();
        assert_eq!((img.width, img.height), (100, 100));
        assert_eq!(img.pixels.len(), 40_000);

        capturer.set_region(Region::new(0.0, 0.0, 64.0, 32.0)).unwrap();
        let img = capturer.screenshot(Region::unset()).unwrap();
        assert_eq!((img.width, img.height), (64, 32));

        capturer.set_region(Region::unset()).unwrap();
        let img = capturer.screenshot(Region::unset()).unwrap();
        assert_eq!((img.width, img.height), (1920, 1080));
    }
}
