use super::{VideoProperties, VideoReader, DEFAULT_FPS};
use crate::config::VideoSourceConfig;
use anyhow::{anyhow, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH, CAP_PROP_HW_ACCELERATION, CAP_PROP_POS_FRAMES,
        VIDEO_ACCELERATION_ANY,
    },
};

pub struct OpencvReader {
    capture: VideoCapture,
    properties: VideoProperties,
}

impl OpencvReader {
    /// Open a camera index, file path or stream URL
    pub fn open(config: &VideoSourceConfig) -> Result<Self> {
        let is_camera = config.camera_index().is_some();
        let mut capture = match config.camera_index() {
            Some(index) => VideoCapture::new(index, CAP_ANY)?,
            None => VideoCapture::from_file(&config.source, CAP_ANY)?,
        };
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video source: {}", config.source));
        }

        if is_camera {
            capture.set(CAP_PROP_FRAME_WIDTH, config.width as f64)?;
            capture.set(CAP_PROP_FRAME_HEIGHT, config.height as f64)?;
            capture.set(CAP_PROP_FPS, config.fps)?;
        } else {
            // Try to enable hardware decoding (VideoToolbox, VA-API, ...)
            match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
                Ok(true) => tracing::debug!("Hardware acceleration enabled"),
                _ => tracing::debug!("Hardware acceleration not available"),
            }
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!(
                "OpencvReader: Failed to get FPS from metadata, falling back to {}",
                DEFAULT_FPS
            );
            fps = DEFAULT_FPS;
        }
        let frame_count = capture.get(CAP_PROP_FRAME_COUNT)? as i64;
        let properties = VideoProperties {
            width: capture.get(CAP_PROP_FRAME_WIDTH)? as i32,
            height: capture.get(CAP_PROP_FRAME_HEIGHT)? as i32,
            fps,
            frame_count,
            is_stream: is_camera || frame_count <= 0,
        };

        tracing::info!(
            "OpencvReader: opened {}, {}x{}, fps={:.2}, frames={}, stream={}",
            config.source,
            properties.width,
            properties.height,
            properties.fps,
            properties.frame_count,
            properties.is_stream
        );

        Ok(Self {
            capture,
            properties,
        })
    }
}

impl VideoReader for OpencvReader {
    fn properties(&self) -> VideoProperties {
        self.properties
    }

    fn read_frame(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success {
            return Err(anyhow!("Failed to read frame"));
        }
        Ok(frame)
    }

    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()> {
        if self.properties.is_stream {
            return Err(anyhow!("Cannot seek in a live stream"));
        }
        self.capture.set(CAP_PROP_POS_FRAMES, frame_num as f64)?;
        Ok(())
    }
}
