use crate::config::DetectorConfig;
use crate::pipeline::types::{BBox, Detection, ObjectClass};
use anyhow::{anyhow, Result};
use crossbeam::channel::{self, Receiver, Sender};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use usls::models::RTDETR;
use usls::{Config, Image};
use std::panic::{self, AssertUnwindSafe};

const COCO_ANIMALS: [&str; 10] = [
    "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe",
];

pub trait Detector: Send {
    /// Detect road users in a BGR frame captured at `timestamp`
    fn detect(&mut self, frame: &Mat, timestamp: u64) -> Result<Vec<Detection>>;

    fn detect_batch(&mut self, frames: &[(Mat, u64)]) -> Result<Vec<Vec<Detection>>> {
        frames.iter().map(|(f, ts)| self.detect(f, *ts)).collect()
    }
}

/// Map a COCO-80 label onto the road-user classes
pub fn classify_coco(name: &str) -> ObjectClass {
    match name {
        "person" => ObjectClass::Pedestrian,
        "bicycle" => ObjectClass::Bicycle,
        "motorcycle" => ObjectClass::Motorcycle,
        n if COCO_ANIMALS.contains(&n) => ObjectClass::Animal,
        _ => ObjectClass::Unknown,
    }
}

/// RT-DETR through usls. Boxes are rescaled to undo the square-padding offset
/// the library leaves on non-square inputs.
pub struct RtDetrDetector {
    model: RTDETR,
    min_conf: f32,
}

impl RtDetrDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let model_config = Config::default()
            .with_model_file(&config.model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let model_config = model_config.with_model_device(usls::Device::CoreMl);

        let model_config = model_config.commit()?;
        let model = RTDETR::new(model_config)?;
        tracing::info!(model = %config.model_path, "RT-DETR detector loaded");

        Ok(Self {
            model,
            min_conf: config.confidence_threshold,
        })
    }

    fn to_detection(
        &self,
        hbb: &usls::Hbb,
        scale: (f32, f32),
        timestamp: u64,
    ) -> Option<Detection> {
        let confidence = hbb.confidence().unwrap_or(0.0);
        if confidence < self.min_conf {
            return None;
        }
        let name = hbb.name().unwrap_or("unknown");
        let (sx, sy) = scale;
        let bbox = BBox::new(
            hbb.xmin() * sx,
            hbb.ymin() * sy,
            hbb.width() * sx,
            hbb.height() * sy,
        );
        Some(Detection::new(classify_coco(name), confidence, bbox, timestamp).with_class_name(name))
    }
}

impl Detector for RtDetrDetector {
    fn detect(&mut self, frame: &Mat, timestamp: u64) -> Result<Vec<Detection>> {
        let mut batch = self.detect_batch(&[(frame.clone(), timestamp)])?;
        Ok(batch.pop().unwrap_or_default())
    }

    fn detect_batch(&mut self, frames: &[(Mat, u64)]) -> Result<Vec<Vec<Detection>>> {
        let mut images = Vec::with_capacity(frames.len());
        let mut scales = Vec::with_capacity(frames.len());

        for (frame, _) in frames {
            let size = frame.size()?;
            let (w, h) = (size.width as f32, size.height as f32);
            scales.push(if w > h {
                (w / h, 1.0)
            } else if h > w {
                (1.0, h / w)
            } else {
                (1.0, 1.0)
            });
            images.push(Image::from(mat_to_rgb_image(frame)?));
        }

        let outputs = self.model.forward(&images)?;

        Ok(outputs
            .into_iter()
            .zip(scales)
            .zip(frames.iter().map(|(_, ts)| *ts))
            .map(|((y, scale), ts)| {
                y.hbbs
                    .iter()
                    .filter_map(|hbb| self.to_detection(hbb, scale, ts))
                    .collect()
            })
            .collect())
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_rgb_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb.size()?;
    if !rgb.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb.data_bytes()?.to_vec();
    let img = ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img))
}

/// Detectors shared between pipeline workers. A worker holds one for the
/// duration of a frame, so inference runs in parallel up to the pool size.
pub struct DetectorPool {
    idle_tx: Sender<Box<dyn Detector>>,
    idle_rx: Receiver<Box<dyn Detector>>,
    size: usize,
}

impl DetectorPool {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        let size = detectors.len();
        let (idle_tx, idle_rx) = channel::bounded(size.max(1));
        for detector in detectors {
            // Capacity equals the number of detectors
            let _ = idle_tx.send(detector);
        }
        Self {
            idle_tx,
            idle_rx,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` with the next free detector, blocking until one is returned.
    /// `None` only for an empty pool. The detector goes back to the pool
    /// even if `f` panics.
    pub fn with_detector<R>(&self, f: impl FnOnce(&mut dyn Detector) -> R) -> Option<R> {
        if self.size == 0 {
            return None;
        }
        let mut detector = self.idle_rx.recv().ok()?;
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(detector.as_mut())));
        let _ = self.idle_tx.send(detector);
        match result {
            Ok(result) => Some(result),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
