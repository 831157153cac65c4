//! Frame sources.
//!
//! - `rtsp`: IP cameras. `stub://` URLs yield synthetic pixels; real streams
//!   need the `rtsp-gstreamer` feature.
//! - `synthetic`: deterministic frames with an optional moving object, for
//!   tests and demos.
//!
//! Sources are responsible for:
//! - Stamping frame ids, capture time and cascade identity
//! - Rate limiting / frame decimation
//!
//! Sources MUST NOT:
//! - Retry internally forever; a failed read is returned so the element loop can back off

pub mod rtsp;
pub mod synthetic;

pub use rtsp::{RtspConfig, RtspSource};
pub use synthetic::{SyntheticConfig, SyntheticObject, SyntheticSource};

use crate::cascade::Identity;
use crate::frame::Frame;

pub(crate) fn stamp(frame: &mut Frame, identity: &Identity) {
    frame.instance_id = identity.instance_id.clone();
    frame.skill_id = identity.skill_id.clone();
    frame.device_id = identity.device_id.clone();
}
