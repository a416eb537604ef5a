//! Wayland capture backend: XDG portal session + PipeWire stream.
//!
//! The portal dance (and its interactive picker) happens lazily on the
//! first `start()` or `screenshot()`, not at construction, so building a
//! capturer never pops a dialog. The session is torn down on `stop()`;
//! the portal session owns the bus connection and the duplicated
//! media-graph descriptor for exactly as long as a stream can exist.

pub(crate) mod outputs;
pub(crate) mod portal;
pub(crate) mod stream;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::error::{CaptureError, CaptureResult};
use crate::model::{FrameCallback, ImageData, Region};

pub(crate) struct WaylandBackend {
    target: CaptureTarget,
    shared: Arc<stream::StreamShared>,
    session: Option<portal::PortalSession>,
    stream: Option<stream::StreamHandle>,
}

impl WaylandBackend {
    pub(crate) fn new(target: CaptureTarget) -> CaptureResult<Self> {
        Ok(Self {
            target,
            shared: Arc::new(stream::StreamShared::new(target.initial_region())),
            session: None,
            stream: None,
        })
    }

    fn source_types(&self) -> u32 {
        match self.target {
            CaptureTarget::Window(_) => portal::SOURCE_WINDOW,
            _ => portal::SOURCE_MONITOR,
        }
    }

    fn ensure_session(&mut self) -> CaptureResult<&portal::PortalSession> {
        if self.session.is_none() {
            self.session = Some(portal::PortalSession::open(self.source_types())?);
        }
        Ok(self.session.as_ref().expect("session just ensured"))
    }
}

impl CaptureBackend for WaylandBackend {
    fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
        let configured = self.shared.state.lock().region;
        let effective = if region.is_set() { region } else { configured };

        let grabbed = {
            let session = self.ensure_session()?;
            let fd = session.duplicate_fd()?;
            stream::grab_one_frame(fd, session.node_id())
        };

        let image = match grabbed {
            Ok(image) => image,
            Err(stream_err) => {
                // The screenshot portal is a serviceable alternative when
                // the stream path cannot produce a frame.
                tracing::debug!("stream screenshot failed ({stream_err}); trying the portal");
                let path = portal::take_portal_screenshot()?;
                let decoded = image::open(&path)
                    .map_err(|e| {
                        CaptureError::Protocol(format!(
                            "decoding the portal screenshot at {} failed: {e}",
                            path.display()
                        ))
                    })?
                    .to_rgba8();
                let _ = std::fs::remove_file(&path);
                ImageData {
                    width: decoded.width(),
                    height: decoded.height(),
                    pixels: decoded.into_raw(),
                }
            }
        };

        match effective.clamp_to(image.width, image.height) {
            Some((x, y, w, h)) => image.cropped(x, y, w, h),
            None => Ok(image),
        }
    }

    fn start(&mut self, callback: FrameCallback) -> CaptureResult<()> {
        if self.stream.is_some() {
            return Err(CaptureError::Resource(
                "capture stream already running".to_string(),
            ));
        }
        let (fd, node_id) = {
            let session = self.ensure_session()?;
            (session.duplicate_fd()?, session.node_id())
        };
        self.shared.state.lock().clock.reset();
        self.stream = Some(stream::spawn_stream(
            fd,
            node_id,
            Arc::clone(&self.shared),
            callback,
        )?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.stream.take() {
            handle.stop();
        }
        // Dropping the session issues the portal Close and releases the
        // duplicated fd ahead of the bus connection (PortalSession declares
        // its fields in that order).
        self.session = None;
        self.shared.state.lock().clock.reset();
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    fn set_region(&mut self, region: Region) -> CaptureResult<()> {
        self.shared.state.lock().region = region;
        Ok(())
    }
}

impl Drop for WaylandBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
