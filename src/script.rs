//! Play scripts: the declarative description of what each screen shows.
//!
//! A script arrives as JSON on the control plane and is immutable once
//! installed. Per screen it lists layered media clips whose placement,
//! size, source offset and opacity are time curves evaluated against script
//! time (`real clock - zero_time`). The script runner projects the active
//! script into concrete per-screen timelines every main-loop tick.
//!
//! # Curves
//!
//! A [`Curve`] is either a constant or a list of `[time, value]` breakpoints
//! interpolated linearly and clamped outside the defined range:
//!
//! ```json
//! "opacity": 0.8
//! "to_size": [[[0.0, 1920], [12.5, 960]], 1080]
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default main-loop tick rate when a script does not name one.
pub const DEFAULT_MAIN_LOOP_HZ: f64 = 30.0;

/// Scalar-valued function of script time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Curve {
    Constant(f64),
    /// `[t, value]` breakpoints, strictly increasing in `t`.
    Points(Vec<[f64; 2]>),
}

impl Curve {
    /// Value at script time `t`: linear interpolation between breakpoints,
    /// clamped to the first/last value outside the range. An empty point
    /// list evaluates to zero.
    pub fn at(&self, t: f64) -> f64 {
        match self {
            Curve::Constant(v) => *v,
            Curve::Points(points) => {
                let Some(first) = points.first() else { return 0.0 };
                if t <= first[0] {
                    return first[1];
                }
                let last = points[points.len() - 1];
                if t >= last[0] {
                    return last[1];
                }
                for window in points.windows(2) {
                    let [t0, v0] = window[0];
                    let [t1, v1] = window[1];
                    if t >= t0 && t <= t1 {
                        if t1 <= t0 {
                            return v1;
                        }
                        return v0 + (v1 - v0) * (t - t0) / (t1 - t0);
                    }
                }
                last[1]
            }
        }
    }
}

impl Default for Curve {
    fn default() -> Self {
        Curve::Constant(0.0)
    }
}

/// One media layer on one screen.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LayerScript {
    /// Media path relative to the media root.
    pub media: String,

    /// Script-seconds when the layer appears.
    #[serde(default)]
    pub start: f64,

    /// Script-seconds when the layer disappears; absent means unbounded.
    #[serde(default)]
    pub end: Option<f64>,

    /// Seconds into the source as a function of script time. Absent means
    /// the source plays linearly from its head beginning at `start`.
    #[serde(default)]
    pub source_time: Option<Curve>,

    /// Source crop origin and size in source pixels; absent means the full
    /// frame.
    #[serde(default)]
    pub from_xy: Option<[Curve; 2]>,
    #[serde(default)]
    pub from_size: Option<[Curve; 2]>,

    /// Destination origin and size on the screen; absent means fullscreen.
    #[serde(default)]
    pub to_xy: Option<[Curve; 2]>,
    #[serde(default)]
    pub to_size: Option<[Curve; 2]>,

    /// Layer opacity; absent means fully opaque.
    #[serde(default)]
    pub opacity: Option<Curve>,
}

impl LayerScript {
    /// True when the layer is visible at script time `t`.
    pub fn covers(&self, t: f64) -> bool {
        t >= self.start && self.end.map_or(true, |end| t < end)
    }

    /// Seconds into the source at script time `t`; negative values mean the
    /// source has not started yet.
    pub fn source_time_at(&self, t: f64) -> f64 {
        match &self.source_time {
            Some(curve) => curve.at(t),
            None => t - self.start,
        }
    }
}

/// Requested display mode, `[width, height, hz]` in the JSON.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModeRequest(pub u32, pub u32, pub u32);

/// Everything a script says about one screen.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScreenScript {
    /// Requested mode; absent means the connector's active mode.
    #[serde(default)]
    pub mode: Option<ModeRequest>,

    /// Timeline evaluation rate; absent means the mode's refresh rate.
    #[serde(default)]
    pub update_hz: Option<f64>,

    #[serde(default)]
    pub layers: Vec<LayerScript>,
}

/// The installed playback program. Immutable after parse; shared by
/// reference between the control plane and the main loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Script {
    #[serde(default = "default_main_loop_hz")]
    pub main_loop_hz: f64,

    /// Wall-clock anchor (seconds since the Unix epoch) script times are
    /// measured from; absent means the server's start time.
    #[serde(default)]
    pub zero_time: Option<f64>,

    /// Keyed by connector name.
    #[serde(default)]
    pub screens: HashMap<String, ScreenScript>,
}

fn default_main_loop_hz() -> f64 {
    DEFAULT_MAIN_LOOP_HZ
}

#[derive(Debug)]
pub enum ScriptError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Parse(e) => write!(f, "Script parse error: {}", e),
            ScriptError::Invalid(e) => write!(f, "Invalid script: {}", e),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Parse and validate a script body. `default_zero_time` fills an absent
/// `zero_time` so downstream code never re-derives the anchor.
pub fn parse_script(body: &str, default_zero_time: f64) -> Result<Script, ScriptError> {
    let mut script: Script = serde_json::from_str(body).map_err(ScriptError::Parse)?;

    if !(script.main_loop_hz.is_finite() && script.main_loop_hz > 0.0) {
        return Err(ScriptError::Invalid(format!(
            "main_loop_hz must be > 0, got {}",
            script.main_loop_hz
        )));
    }

    for (name, screen) in &script.screens {
        if let Some(hz) = screen.update_hz {
            if !(hz.is_finite() && hz > 0.0) {
                return Err(ScriptError::Invalid(format!(
                    "screen {}: update_hz must be > 0, got {}",
                    name, hz
                )));
            }
        }
        for layer in &screen.layers {
            if layer.media.is_empty() {
                return Err(ScriptError::Invalid(format!(
                    "screen {}: layer with empty media path",
                    name
                )));
            }
            if let Some(end) = layer.end {
                if end < layer.start {
                    return Err(ScriptError::Invalid(format!(
                        "screen {}: layer {} ends before it starts ({} < {})",
                        name, layer.media, end, layer.start
                    )));
                }
            }
        }
    }

    if script.zero_time.is_none() {
        script.zero_time = Some(default_zero_time);
    }
    Ok(script)
}
