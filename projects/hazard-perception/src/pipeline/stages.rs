// Stage construction
//
// The orchestrator never names a concrete stage type. Everything it runs is
// built through a `StageFactory`, which is how tests swap in scripted
// sources, detectors and sinks.

use crate::config::SystemConfig;
use crate::pipeline::behavior::{Analyzer, KinematicAnalyzer};
use crate::pipeline::detection::{Detector, RtDetrDetector};
use crate::pipeline::enhancer::{NarrativeEnhancer, TemplateEnhancer};
use crate::pipeline::sink::{OverlaySink, ResultSink};
use crate::pipeline::tracker::{IouTracker, Tracker};
use crate::video::manager::VideoSourceManager;
use anyhow::{Context, Result};
use tracing::Span;

pub trait StageFactory: Send + Sync {
    /// An unconnected source manager; the orchestrator runs `initialize`
    fn video_source(&self, config: &SystemConfig, span: Span) -> Result<VideoSourceManager>;

    fn detectors(&self, config: &SystemConfig, count: usize) -> Result<Vec<Box<dyn Detector>>>;

    fn sink(&self, config: &SystemConfig, fps: f64) -> Result<Box<dyn ResultSink>>;

    fn tracker(&self, config: &SystemConfig, span: Span) -> Result<Box<dyn Tracker>> {
        Ok(Box::new(IouTracker::new(
            &config.tracker,
            config.behavior.trajectory_history_length,
            span,
        )))
    }

    fn analyzer(&self, config: &SystemConfig, span: Span) -> Result<Box<dyn Analyzer>> {
        Ok(Box::new(KinematicAnalyzer::new(
            &config.behavior,
            &config.vehicle,
            span,
        )))
    }

    fn enhancer(&self, config: &SystemConfig) -> Result<Option<Box<dyn NarrativeEnhancer>>> {
        if config.llm.enable {
            Ok(Some(Box::new(TemplateEnhancer::new())))
        } else {
            Ok(None)
        }
    }
}

/// Camera/file input through OpenCV, RT-DETR detection and the overlay sink
pub struct OpencvStageFactory;

impl StageFactory for OpencvStageFactory {
    fn video_source(&self, config: &SystemConfig, span: Span) -> Result<VideoSourceManager> {
        Ok(VideoSourceManager::new(&config.video, &config.camera, span))
    }

    fn detectors(&self, config: &SystemConfig, count: usize) -> Result<Vec<Box<dyn Detector>>> {
        (0..count)
            .map(|_| {
                RtDetrDetector::new(&config.detector)
                    .map(|d| Box::new(d) as Box<dyn Detector>)
                    .with_context(|| {
                        format!("Failed to load model: {}", config.detector.model_path)
                    })
            })
            .collect()
    }

    fn sink(&self, config: &SystemConfig, fps: f64) -> Result<Box<dyn ResultSink>> {
        Ok(Box::new(OverlaySink::new(&config.output, fps)?))
    }
}
