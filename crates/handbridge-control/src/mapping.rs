//! Pure mapping from tracked finger extensions to desired joint targets.
//!
//! Deliberately tolerant of garbage input: extensions outside [0, 100],
//! NaNs, and missing spread values all land inside the joint limits
//! because the output is clamped against the open/closed envelope per
//! joint, not against trust in the tracking client.

use handbridge_types::{
    ExtensionFrame, Finger, JointMatrix, JOINTS_PER_FINGER, LATERAL_JOINT,
};

/// Curl for one extension value: `clamp(1 − ext/100, 0, max_curl)`.
pub fn curl_for(extension: f64, max_curl: f64) -> f64 {
    let ext = if extension.is_finite() { extension } else { 0.0 };
    let ext = ext.clamp(0.0, 100.0);
    let max_curl = if (0.0..=1.0).contains(&max_curl) { max_curl } else { 1.0 };
    (1.0 - ext / 100.0).clamp(0.0, max_curl)
}

/// Map one pose frame onto desired joint targets.
///
/// Per joint: `open + curl · weight · (closed − open)`.  The thumb's
/// lateral joint takes its curl from the frame's spread value when one is
/// present; otherwise it follows the thumb curl like every other joint.
/// The result is clamped elementwise into `[min(open, closed),
/// max(open, closed)]`, which guarantees the target stays inside the
/// hardware limits regardless of input.
pub fn map_frame(
    frame: &ExtensionFrame,
    open: &JointMatrix,
    closed: &JointMatrix,
    weights: &JointMatrix,
    max_curl: f64,
) -> JointMatrix {
    let mut target = *open;

    for finger in Finger::ALL {
        let fi = finger.index();
        let curl = curl_for(frame.extension(finger), max_curl);
        for ji in 0..JOINTS_PER_FINGER {
            let o = open.get(fi, ji);
            let c = closed.get(fi, ji);
            target.set(fi, ji, o + curl * weights.get(fi, ji) * (c - o));
        }
    }

    if let Some(spread) = frame.spread {
        let fi = Finger::Thumb.index();
        let o = open.get(fi, LATERAL_JOINT);
        let c = closed.get(fi, LATERAL_JOINT);
        let lateral_curl = curl_for(spread, max_curl);
        target.set(
            fi,
            LATERAL_JOINT,
            o + lateral_curl * weights.get(fi, LATERAL_JOINT) * (c - o),
        );
    }

    target.clamp(&open.elementwise_min(closed), &open.elementwise_max(closed))
}
