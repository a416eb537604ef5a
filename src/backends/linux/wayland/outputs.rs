//! Monitor enumeration through a minimal Wayland client connection.
//!
//! Binds `wl_output` globals from the registry and collects geometry, the
//! current mode, scale, and (protocol v4) the connector name. Two
//! roundtrips: one for the registry, one for the bound outputs' events.

use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::{Connection, Dispatch, QueueHandle, WEnum};

use crate::error::{CaptureError, CaptureResult};
use crate::model::Monitor;

#[derive(Default)]
struct OutputInfo {
    name: Option<String>,
    description: Option<String>,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    scale: i32,
}

#[derive(Default)]
struct OutputState {
    outputs: Vec<(WlOutput, OutputInfo)>,
}

impl Dispatch<WlRegistry, ()> for OutputState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            if interface == "wl_output" {
                let output = registry.bind::<WlOutput, _, _>(name, version.min(4), qh, ());
                state.outputs.push((
                    output,
                    OutputInfo {
                        scale: 1,
                        ..Default::default()
                    },
                ));
            }
        }
    }
}

impl Dispatch<WlOutput, ()> for OutputState {
    fn event(
        state: &mut Self,
        output: &WlOutput,
        event: wl_output::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some((_, info)) = state.outputs.iter_mut().find(|(o, _)| o == output) else {
            return;
        };
        match event {
            wl_output::Event::Geometry { x, y, .. } => {
                info.x = x;
                info.y = y;
            }
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                ..
            } if flags.contains(wl_output::Mode::Current) => {
                info.width = width.max(0) as u32;
                info.height = height.max(0) as u32;
            }
            wl_output::Event::Scale { factor } => {
                info.scale = factor.max(1);
            }
            wl_output::Event::Name { name } => {
                info.name = Some(name);
            }
            wl_output::Event::Description { description } => {
                info.description = Some(description);
            }
            _ => {}
        }
    }
}

pub(crate) fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    let conn = Connection::connect_to_env().map_err(|e| {
        CaptureError::Environment(format!(
            "cannot connect to the Wayland compositor: {e}; check WAYLAND_DISPLAY"
        ))
    })?;
    let display = conn.display();
    let mut queue = conn.new_event_queue();
    let qh = queue.handle();
    let _registry = display.get_registry(&qh, ());

    let mut state = OutputState::default();
    // First roundtrip announces globals; second drains the bound outputs'
    // property events.
    queue
        .roundtrip(&mut state)
        .and_then(|_| queue.roundtrip(&mut state))
        .map_err(|e| CaptureError::Protocol(format!("compositor roundtrip failed: {e}")))?;

    Ok(state
        .outputs
        .into_iter()
        .enumerate()
        .map(|(idx, (_, info))| Monitor {
            id: idx as u32,
            name: info
                .name
                .or(info.description)
                .unwrap_or_else(|| format!("output-{idx}")),
            x: info.x,
            y: info.y,
            width: info.width,
            height: info.height,
            scale: info.scale as f32,
        })
        .collect())
}
