//! Push-mode streaming loop shared by the sources.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::Element;
use crate::error::Result;
use crate::event::{Event, EventType, Segment, StreamStart};
use crate::format::Format;
use crate::observability::span_element;
use crate::pad::{FlowError, Pad, TaskState};
use tracing::{debug, error, trace};

/// Stream header for the first iteration after activation.
#[derive(Debug, Clone)]
pub(crate) struct StreamHeader {
    pub caps: Option<Caps>,
    pub format: Format,
}

/// Start the streaming task on `pad`.
///
/// Each iteration calls `create` and pushes the buffer. A fresh stream (no
/// sticky `StreamStart` on the pad) is preceded by `StreamStart`, optional
/// `Caps` and `Segment` events. Flow errors pause the task; `Eos` is pushed
/// downstream, fatal errors are also posted as an `Error` message.
pub(crate) fn start_push_loop<F>(pad: &Pad, header: StreamHeader, mut create: F) -> Result<()>
where
    F: FnMut(&Element, &Pad) -> std::result::Result<Buffer, FlowError> + Send + 'static,
{
    let weak = pad.downgrade();
    pad.start_task(move || {
        let Some(pad) = weak.upgrade() else {
            return;
        };
        let Some(element) = pad.parent_element() else {
            let _ = pad.pause_task();
            return;
        };
        let _span = span_element(&element).entered();

        if pad.sticky_event(EventType::StreamStart).is_none()
            && let Err(e) = push_header(&element, &pad, &header)
        {
            pause_on_flow(&element, &pad, e);
            return;
        }

        let res = create(&element, &pad).and_then(|buffer| {
            trace!(pad = %pad.name(), size = buffer.len(), "pushing buffer");
            pad.push(buffer)
        });
        if let Err(e) = res {
            pause_on_flow(&element, &pad, e);
        }
    })
}

fn push_header(
    element: &Element,
    pad: &Pad,
    header: &StreamHeader,
) -> std::result::Result<(), FlowError> {
    let stream_id = pad.create_stream_id(element, None);
    debug!(pad = %pad.path(), %stream_id, "starting stream");
    pad.push_event(Event::StreamStart(StreamStart::new(stream_id)));
    if let Some(caps) = &header.caps
        && !pad.push_event(Event::Caps(caps.clone()))
    {
        return Err(FlowError::NotNegotiated);
    }
    pad.push_event(Event::Segment(Segment::new(header.format)));
    Ok(())
}

/// React to a flow error from inside a streaming task and pause it.
pub(crate) fn pause_on_flow(element: &Element, pad: &Pad, err: FlowError) {
    match err {
        FlowError::Flushing => {
            debug!(pad = %pad.path(), "pausing task, flushing");
        }
        FlowError::Eos => {
            debug!(pad = %pad.path(), "pausing task, end of stream");
            pad.push_event(Event::Eos);
        }
        e => {
            error!(pad = %pad.path(), reason = %e, "streaming stopped");
            element.post_error(
                "Internal data stream error",
                Some(format!("{}: streaming stopped, reason {e}", pad.path())),
            );
            pad.push_event(Event::Eos);
        }
    }
    // A task stopped by deactivation stays stopped.
    if pad.task_state() == TaskState::Started {
        let _ = pad.pause_task();
    }
}
