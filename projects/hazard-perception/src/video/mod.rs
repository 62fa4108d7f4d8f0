pub mod connection;
pub mod manager;
pub mod opencv_reader;
pub mod preprocess;

use anyhow::Result;
use opencv::core::Mat;
use serde::Serialize;

/// Fallback when a backend reports no usable frame rate
pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    /// Frames in the source, or <= 0 when unknown
    pub frame_count: i64,
    /// Live camera or network stream rather than a finite file
    pub is_stream: bool,
}

pub trait VideoReader: Send {
    fn properties(&self) -> VideoProperties;

    /// Next frame. For files an error means the end was reached.
    fn read_frame(&mut self) -> Result<Mat>;

    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()>;
}
