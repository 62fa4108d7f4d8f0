// System configuration
//
// Loaded once from a JSON document before the pipeline starts. Every section
// has explicit defaults, so a partial file only overrides what it names.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::error::FaultPolicy;
use crate::video::connection::ConnectionPolicy;

/// Pixel rectangle used for the region of interest
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RoiRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VideoSourceConfig {
    /// Camera index ("0") or a file path / stream URL
    pub source: String,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub enable_roi: bool,
    pub roi: RoiRect,
    pub correct_distortion: bool,
    pub connection_timeout_sec: u64,
    pub retry_interval_sec: u64,
    pub max_retry_attempts: u32,
    pub wait_for_device: bool,
}

impl Default for VideoSourceConfig {
    fn default() -> Self {
        Self {
            source: "0".to_string(),
            width: 640,
            height: 480,
            fps: 30.0,
            enable_roi: false,
            roi: RoiRect::default(),
            correct_distortion: false,
            connection_timeout_sec: 60,
            retry_interval_sec: 5,
            max_retry_attempts: 12,
            wait_for_device: true,
        }
    }
}

impl VideoSourceConfig {
    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            timeout: Duration::from_secs(self.connection_timeout_sec),
            retry_interval: Duration::from_secs(self.retry_interval_sec),
            max_attempts: self.max_retry_attempts,
            wait_for_device: self.wait_for_device,
        }
    }

    /// Camera index when `source` is purely numeric
    pub fn camera_index(&self) -> Option<i32> {
        if !self.source.is_empty() && self.source.chars().all(|c| c.is_ascii_digit()) {
            self.source.parse().ok()
        } else {
            None
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/rtdetr.onnx".to_string(),
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Frames a track may go unmatched before it is dropped
    pub max_age: u32,
    /// Matches needed before a track is reported
    pub min_hits: u32,
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            iou_threshold: 0.3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BehaviorConfig {
    /// Meters
    pub high_risk_distance: f32,
    /// Seconds
    pub collision_risk_ttc: f32,
    pub trajectory_history_length: usize,
    pub pedestrian_running_threshold: f32,
    pub non_motor_speeding_threshold: f32,
    /// K in `distance = K / (box_height + 1)`
    pub distance_scale: f32,
    pub min_distance: f32,
    pub max_distance: f32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            high_risk_distance: 10.0,
            collision_risk_ttc: 3.0,
            trajectory_history_length: 30,
            pedestrian_running_threshold: 2.5,
            non_motor_speeding_threshold: 5.0,
            distance_scale: 1000.0,
            min_distance: 1.0,
            max_distance: 50.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub enable: bool,
    /// Run the enhancer every N processed frames
    pub analysis_interval: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enable: false,
            analysis_interval: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub save_results: bool,
    pub results_path: String,
    pub save_video: bool,
    pub video_path: String,
    pub draw_bboxes: bool,
    pub draw_labels: bool,
    pub draw_trails: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_results: true,
            results_path: "output/results".to_string(),
            save_video: false,
            video_path: "output/videos".to_string(),
            draw_bboxes: true,
            draw_labels: true,
            draw_trails: true,
        }
    }
}

/// Camera intrinsics and lens distortion
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CameraParams {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Vec<f64>,
}

impl CameraParams {
    pub fn has_intrinsics(&self) -> bool {
        self.fx > 0.0 && self.fy > 0.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VehicleParams {
    pub width: f32,
    pub length: f32,
    pub height: f32,
    pub front_overhang: f32,
    pub wheelbase: f32,
    /// km/h
    pub max_speed: f32,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self {
            width: 1.8,
            length: 4.5,
            height: 1.5,
            front_overhang: 0.9,
            wheelbase: 2.7,
            max_speed: 120.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Frames allowed to wait for a worker before new ones are dropped
    pub queue_depth: usize,
    pub max_consecutive_frame_faults: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 8,
            max_consecutive_frame_faults: 5,
        }
    }
}

impl PipelineConfig {
    pub fn fault_policy(&self) -> FaultPolicy {
        FaultPolicy {
            max_consecutive_frame_faults: self.max_consecutive_frame_faults,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    pub video: VideoSourceConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub behavior: BehaviorConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
    pub camera: CameraParams,
    pub vehicle: VehicleParams,
    pub pipeline: PipelineConfig,
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: SystemConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let video = &self.video;
        if video.source.trim().is_empty() {
            bail!("video.source must not be empty");
        }
        if video.fps <= 0.0 {
            bail!("video.fps must be positive, got {}", video.fps);
        }
        if video.enable_roi && (video.roi.width <= 0 || video.roi.height <= 0) {
            bail!("video.roi must have a positive extent when enable_roi is set");
        }
        if video.max_retry_attempts == 0 {
            bail!("video.max_retry_attempts must be at least 1");
        }

        let tracker = &self.tracker;
        if tracker.min_hits == 0 {
            bail!("tracker.min_hits must be at least 1");
        }
        if !(0.0..1.0).contains(&tracker.iou_threshold) {
            bail!(
                "tracker.iou_threshold must be in [0, 1), got {}",
                tracker.iou_threshold
            );
        }

        let behavior = &self.behavior;
        if behavior.high_risk_distance <= 0.0 || behavior.collision_risk_ttc <= 0.0 {
            bail!("behavior distance and TTC thresholds must be positive");
        }
        if behavior.pedestrian_running_threshold <= 0.0
            || behavior.non_motor_speeding_threshold <= 0.0
        {
            bail!("behavior speed thresholds must be positive");
        }
        if behavior.trajectory_history_length < 2 {
            bail!("behavior.trajectory_history_length must be at least 2");
        }
        if behavior.distance_scale <= 0.0
            || behavior.min_distance <= 0.0
            || behavior.min_distance > behavior.max_distance
        {
            bail!("behavior distance model is inconsistent");
        }

        if self.vehicle.max_speed <= 0.0 {
            bail!("vehicle.max_speed must be positive, got {}", self.vehicle.max_speed);
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            bail!("detector.confidence_threshold must be in [0, 1]");
        }
        if self.llm.enable && self.llm.analysis_interval == 0 {
            bail!("llm.analysis_interval must be at least 1");
        }
        if self.pipeline.workers == 0 || self.pipeline.queue_depth == 0 {
            bail!("pipeline.workers and pipeline.queue_depth must be at least 1");
        }

        Ok(())
    }
}
