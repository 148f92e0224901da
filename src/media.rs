//! Media gateway: file probing and decoded-frame access for the runner.
//!
//! The playback core never decodes video itself. It consumes
//! [`MediaSource`], which hands back [`Frame`] handles already imported into
//! the display driver's memory domain. Deployments wrap their decode stack
//! in this trait; the bundled [`PatternSource`] serves synthetic frames so a
//! server with the virtual display backend runs end to end without one.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::display::Frame;

/// Probe result for one media file. Optional fields are omitted from JSON
/// when the source cannot report them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileInfo {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_name: Option<String>,
    /// Width and height in pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u64>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug)]
pub enum MediaError {
    NotFound(PathBuf),
    /// Path escapes the media root.
    OutsideRoot(String),
    Decode(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::NotFound(path) => write!(f, "Media not found: {}", path.display()),
            MediaError::OutsideRoot(path) => {
                write!(f, "Media path escapes the media root: {}", path)
            }
            MediaError::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for MediaError {}

impl MediaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MediaError::NotFound(_))
    }
}

/// Decoded-media gateway consumed by the script runner.
pub trait MediaSource: Send + Sync {
    /// Probe a media file, relative to the source's root.
    fn file_info(&self, path: &str) -> Result<FileInfo, MediaError>;

    /// Frame of `path` at `offset` seconds into the source, imported and
    /// ready for scan-out.
    fn frame_at(&self, path: &str, offset: f64) -> Result<Frame, MediaError>;
}

/// Resolve a script-supplied media path against `root`, rejecting anything
/// that would escape it. Leading separators are treated as root-relative.
pub fn resolve_media_path(root: &Path, path: &str) -> Result<PathBuf, MediaError> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MediaError::OutsideRoot(path.to_string()));
            }
        }
    }
    Ok(resolved)
}

/// Development media source: synthetic full-HD frames for any file present
/// under the media root. Stands in for a real decode stack behind the same
/// trait.
pub struct PatternSource {
    root: PathBuf,
    frame_rate: f64,
}

impl PatternSource {
    pub fn new(root: impl Into<PathBuf>) -> PatternSource {
        PatternSource { root: root.into(), frame_rate: 30.0 }
    }
}

impl MediaSource for PatternSource {
    fn file_info(&self, path: &str) -> Result<FileInfo, MediaError> {
        let resolved = resolve_media_path(&self.root, path)?;
        if !resolved.is_file() {
            return Err(MediaError::NotFound(resolved));
        }
        debug!("Probing {}", resolved.display());
        Ok(FileInfo {
            filename: resolved.display().to_string(),
            container_type: Some("pattern".to_string()),
            pixel_format: Some("rgba".to_string()),
            codec_name: Some("pattern".to_string()),
            size: Some((1920, 1080)),
            frame_rate: Some(self.frame_rate),
            bit_rate: None,
            duration: None,
        })
    }

    fn frame_at(&self, path: &str, offset: f64) -> Result<Frame, MediaError> {
        let resolved = resolve_media_path(&self.root, path)?;
        if !resolved.is_file() {
            return Err(MediaError::NotFound(resolved));
        }
        // Quantize to the pattern frame rate so equal script instants map to
        // the same nominal source frame.
        let quantized = (offset.max(0.0) * self.frame_rate).floor() / self.frame_rate;
        Ok(Frame::new(1920, 1080, path, quantized))
    }
}
