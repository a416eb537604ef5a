//! PipeWire client stream consuming the portal's screen-cast node.
//!
//! PipeWire's Rust types (`MainLoop`, `Context`, `Stream`) are deliberately
//! `!Send`, so everything lives on one dedicated loop thread; the backend
//! talks to it through shared atomics/mutexes and a `pipewire::channel`
//! whose receiver is attached to the loop and quits it on stop. All
//! per-stream callback state travels through the listener's user-data
//! struct — never through globals or thread-locals, which would break with
//! two concurrent instances.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libspa::param::ParamType;
use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::format_utils;
use libspa::param::video::{VideoFormat, VideoInfoRaw};
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{self, Pod};
use libspa::utils::{Direction, SpaTypes};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use pipewire::context::Context;
use pipewire::main_loop::MainLoop;
use pipewire::properties::properties;
use pipewire::stream::{Stream, StreamFlags, StreamRef};

use crate::constants;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, FrameClock, ImageData, Region};
use crate::pixel;

static PIPEWIRE_INIT: OnceCell<()> = OnceCell::new();

fn init_pipewire() {
    PIPEWIRE_INIT.get_or_init(pipewire::init);
}

/// State shared between the backend and the loop thread.
pub(crate) struct StreamShared {
    pub(crate) paused: AtomicBool,
    pub(crate) state: Mutex<StreamState>,
}

pub(crate) struct StreamState {
    pub(crate) region: Region,
    pub(crate) clock: FrameClock,
}

impl StreamShared {
    pub(crate) fn new(region: Region) -> Self {
        Self {
            paused: AtomicBool::new(false),
            state: Mutex::new(StreamState {
                region,
                clock: FrameClock::new(),
            }),
        }
    }
}

/// Per-instance callback data handed to the stream listener.
struct ProcessData {
    format: VideoInfoRaw,
    shared: Arc<StreamShared>,
    callback: FrameCallback,
}

/// A running loop thread plus the channel that quits it.
pub(crate) struct StreamHandle {
    quit: pipewire::channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub(crate) fn stop(mut self) {
        let _ = self.quit.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns the loop thread and blocks until the stream is connected (or the
/// setup failed, in which case the error is returned here).
pub(crate) fn spawn_stream(
    fd: OwnedFd,
    node_id: u32,
    shared: Arc<StreamShared>,
    callback: FrameCallback,
) -> CaptureResult<StreamHandle> {
    init_pipewire();

    let (quit_tx, quit_rx) = pipewire::channel::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<CaptureResult<()>>();

    let thread = std::thread::Builder::new()
        .name("framegrab-pipewire".to_string())
        .spawn(move || {
            run_stream_loop(fd, node_id, shared, callback, quit_rx, ready_tx);
        })
        .map_err(|e| CaptureError::Resource(format!("stream thread spawn failed: {e}")))?;

    match ready_rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Ok(())) => Ok(StreamHandle {
            quit: quit_tx,
            thread: Some(thread),
        }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = quit_tx.send(());
            let _ = thread.join();
            Err(CaptureError::Timeout(
                "media-graph stream did not come up within 10s".to_string(),
            ))
        }
    }
}

fn run_stream_loop(
    fd: OwnedFd,
    node_id: u32,
    shared: Arc<StreamShared>,
    callback: FrameCallback,
    quit_rx: pipewire::channel::Receiver<()>,
    ready_tx: std::sync::mpsc::Sender<CaptureResult<()>>,
) {
    let setup = (|| -> CaptureResult<(MainLoop, Stream, Vec<u8>)> {
        let mainloop = MainLoop::new(None).map_err(|e| {
            CaptureError::Environment(format!(
                "media-graph main loop creation failed: {e}; is the PipeWire service running?"
            ))
        })?;
        let context = Context::new(&mainloop)
            .map_err(|e| CaptureError::Resource(format!("media-graph context failed: {e}")))?;
        // connect_fd consumes the duplicate; a failed connect drops (and so
        // closes) it.
        let core = context.connect_fd(fd, None).map_err(|e| {
            CaptureError::Protocol(format!("media-graph connection over the portal fd failed: {e}"))
        })?;
        let stream = Stream::new(
            &core,
            "framegrab",
            properties! {
                *pipewire::keys::MEDIA_TYPE => "Video",
                *pipewire::keys::MEDIA_CATEGORY => "Capture",
                *pipewire::keys::MEDIA_ROLE => "Screen",
            },
        )
        .map_err(|e| CaptureError::Resource(format!("media-graph stream creation failed: {e}")))?;
        let params = format_params()?;
        Ok((mainloop, stream, params))
    })();

    let (mainloop, stream, params) = match setup {
        Ok(v) => v,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let data = ProcessData {
        format: VideoInfoRaw::default(),
        shared,
        callback,
    };

    let _listener = match stream
        .add_local_listener_with_user_data(data)
        .state_changed(|_stream, _data, old, new| {
            tracing::debug!(?old, ?new, "media-graph stream state changed");
        })
        .param_changed(|_stream, data, id, param| {
            handle_param_changed(data, id, param);
        })
        .process(|stream, data| {
            process_frame(stream, data);
        })
        .register()
    {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready_tx.send(Err(CaptureError::Resource(format!(
                "stream listener registration failed: {err}"
            ))));
            return;
        }
    };

    let Some(pod) = Pod::from_bytes(&params) else {
        let _ = ready_tx.send(Err(CaptureError::Resource(
            "format parameter encoding produced an invalid pod".to_string(),
        )));
        return;
    };
    if let Err(err) = stream.connect(
        Direction::Input,
        Some(node_id),
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
        &mut [pod],
    ) {
        let _ = ready_tx.send(Err(CaptureError::Protocol(format!(
            "connecting the stream to node {node_id} failed: {err}"
        ))));
        return;
    }

    // Stop request from the backend: quit the loop from inside it.
    let loop_for_quit = mainloop.clone();
    let _receiver = quit_rx.attach(mainloop.loop_(), move |()| {
        loop_for_quit.quit();
    });

    let _ = ready_tx.send(Ok(()));
    mainloop.run();
}

fn handle_param_changed(data: &mut ProcessData, id: u32, param: Option<&Pod>) {
    let Some(param) = param else { return };
    if id != ParamType::Format.as_raw() {
        return;
    }
    let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
        return;
    };
    if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
        return;
    }
    let mut info = VideoInfoRaw::default();
    if info.parse(param).is_ok() {
        tracing::debug!(
            format = ?info.format(),
            width = info.size().width,
            height = info.size().height,
            "media-graph format negotiated"
        );
        data.format = info;
    }
}

fn process_frame(stream: &StreamRef, data: &mut ProcessData) {
    // Paused: drain the buffer and hand it straight back so the server's
    // small pool never stalls, but deliver nothing.
    if data.shared.paused.load(Ordering::Acquire) {
        if let Some(buffer) = stream.dequeue_buffer() {
            drop(buffer);
        }
        return;
    }

    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    let width = data.format.size().width;
    let height = data.format.size().height;
    let format = data.format.format();

    let image = {
        let datas = buffer.datas_mut();
        let Some(plane) = datas.first_mut() else {
            return; // buffer drop requeues
        };
        let stride = {
            let s = plane.chunk().stride();
            if s > 0 { s as usize } else { width as usize * 4 }
        };
        let Some(slice) = plane.data() else {
            return;
        };
        match copy_out(slice, stride, width, height, format) {
            Some(image) => image,
            None => return,
        }
    };
    // Requeue as soon as the pixels are copied out; everything below runs
    // against our own buffer.
    drop(buffer);

    let (region, duration_ms) = {
        let mut state = data.shared.state.lock();
        (state.region, state.clock.tick())
    };
    let image = match region.clamp_to(width, height) {
        Some((x, y, w, h)) => match image.cropped(x, y, w, h) {
            Ok(cropped) => cropped,
            Err(err) => {
                tracing::warn!("cropping streamed frame failed: {err}");
                return;
            }
        },
        None => image,
    };

    (data.callback)(&Frame { image, duration_ms });
}

/// Converts one mapped buffer into canonical RGBA. Returns `None` when the
/// negotiated dimensions and the chunk do not line up (frame is skipped).
fn copy_out(
    src: &[u8],
    stride: usize,
    width: u32,
    height: u32,
    format: VideoFormat,
) -> Option<ImageData> {
    if width == 0 || height == 0 {
        return None;
    }
    let row_bytes = width as usize * 4;
    if stride < row_bytes || src.len() < stride * (height as usize - 1) + row_bytes {
        return None;
    }

    let mut image = ImageData::alloc(width, height).ok()?;
    for row in 0..height as usize {
        let src_row = &src[row * stride..row * stride + row_bytes];
        let dst_row = &mut image.pixels[row * row_bytes..(row + 1) * row_bytes];
        match format {
            VideoFormat::BGRx | VideoFormat::BGRA => {
                pixel::convert_bgra_to_rgba(src_row, dst_row);
            }
            VideoFormat::RGBx | VideoFormat::RGBA => {
                dst_row.copy_from_slice(src_row);
            }
            other => {
                tracing::warn!(?other, "unsupported negotiated pixel format");
                return None;
            }
        }
    }
    // The padded formats carry garbage in byte 3.
    if matches!(format, VideoFormat::BGRx | VideoFormat::RGBx) {
        for px in image.pixels.chunks_exact_mut(4) {
            px[3] = 0xFF;
        }
    }
    Some(image)
}

/// EnumFormat parameter: raw video, the four accepted byte orders, and the
/// negotiable size range.
fn format_params() -> CaptureResult<Vec<u8>> {
    let obj = pod::object!(
        SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(
            FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            VideoFormat::BGRx,
            VideoFormat::BGRx,
            VideoFormat::BGRA,
            VideoFormat::RGBx,
            VideoFormat::RGBA
        ),
        pod::property!(
            FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            libspa::utils::Rectangle {
                width: 1920,
                height: 1080
            },
            libspa::utils::Rectangle {
                width: 1,
                height: 1
            },
            libspa::utils::Rectangle {
                width: 8192,
                height: 8192
            }
        ),
    );
    let (cursor, _) = PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pod::Value::Object(obj),
    )
    .map_err(|e| CaptureError::Resource(format!("format parameter encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// One-shot capture: a throwaway loop + stream on a duplicated fd, stopped
/// by the first delivered frame or by a safety timer.
pub(crate) fn grab_one_frame(fd: OwnedFd, node_id: u32) -> CaptureResult<ImageData> {
    init_pipewire();

    let mainloop = MainLoop::new(None).map_err(|e| {
        CaptureError::Environment(format!(
            "media-graph main loop creation failed: {e}; is the PipeWire service running?"
        ))
    })?;
    let context = Context::new(&mainloop)
        .map_err(|e| CaptureError::Resource(format!("media-graph context failed: {e}")))?;
    let core = context.connect_fd(fd, None).map_err(|e| {
        CaptureError::Protocol(format!("media-graph connection over the portal fd failed: {e}"))
    })?;
    let stream = Stream::new(
        &core,
        "framegrab-screenshot",
        properties! {
            *pipewire::keys::MEDIA_TYPE => "Video",
            *pipewire::keys::MEDIA_CATEGORY => "Capture",
            *pipewire::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|e| CaptureError::Resource(format!("media-graph stream creation failed: {e}")))?;

    struct OneShotData {
        format: VideoInfoRaw,
        result: std::rc::Rc<std::cell::RefCell<Option<ImageData>>>,
    }

    let result = std::rc::Rc::new(std::cell::RefCell::new(None));
    let data = OneShotData {
        format: VideoInfoRaw::default(),
        result: std::rc::Rc::clone(&result),
    };

    let loop_for_process = mainloop.clone();
    let _listener = stream
        .add_local_listener_with_user_data(data)
        .param_changed(|_stream, data, id, param| {
            let Some(param) = param else { return };
            if id != ParamType::Format.as_raw() {
                return;
            }
            let mut info = VideoInfoRaw::default();
            if info.parse(param).is_ok() {
                data.format = info;
            }
        })
        .process(move |stream, data| {
            if data.result.borrow().is_some() {
                if let Some(buffer) = stream.dequeue_buffer() {
                    drop(buffer);
                }
                return;
            }
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let width = data.format.size().width;
            let height = data.format.size().height;
            let format = data.format.format();
            let image = {
                let datas = buffer.datas_mut();
                let Some(plane) = datas.first_mut() else { return };
                let stride = {
                    let s = plane.chunk().stride();
                    if s > 0 { s as usize } else { width as usize * 4 }
                };
                let Some(slice) = plane.data() else { return };
                copy_out(slice, stride, width, height, format)
            };
            drop(buffer);
            if let Some(image) = image {
                *data.result.borrow_mut() = Some(image);
                loop_for_process.quit();
            }
        })
        .register()
        .map_err(|e| {
            CaptureError::Resource(format!("stream listener registration failed: {e}"))
        })?;

    let params = format_params()?;
    let Some(pod) = Pod::from_bytes(&params) else {
        return Err(CaptureError::Resource(
            "format parameter encoding produced an invalid pod".to_string(),
        ));
    };
    stream
        .connect(
            Direction::Input,
            Some(node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut [pod],
        )
        .map_err(|e| {
            CaptureError::Protocol(format!("connecting the stream to node {node_id} failed: {e}"))
        })?;

    // Safety stop: a session that never produces a frame must not hang the
    // caller.
    let loop_for_timer = mainloop.clone();
    let timer = mainloop.loop_().add_timer(move |_| {
        loop_for_timer.quit();
    });
    timer
        .update_timer(Some(constants::screenshot_timeout()), None)
        .into_result()
        .map_err(|e| CaptureError::Resource(format!("screenshot timer setup failed: {e}")))?;

    mainloop.run();

    result.borrow_mut().take().ok_or_else(|| {
        CaptureError::Timeout(format!(
            "no frame arrived from the media-graph stream within {}s",
            constants::screenshot_timeout().as_secs()
        ))
    })
}
