// Narrative enhancement
//
// An enhancer only ever contributes text. `apply_narratives` copies the
// narrative field back by track id, so nothing else an enhancer returns can
// reach the results.

use crate::pipeline::types::{BehaviorAnalysis, RiskLevel, TrackedObject};
use std::collections::HashMap;

pub trait NarrativeEnhancer: Send {
    fn enhance(
        &mut self,
        analyses: &[BehaviorAnalysis],
        objects: &[TrackedObject],
    ) -> anyhow::Result<Vec<BehaviorAnalysis>>;

    fn set_vehicle_speed(&mut self, _kmh: f32) {}
}

/// Merge narratives from `enhanced` into `analyses`, matching on track id
pub fn apply_narratives(analyses: &mut [BehaviorAnalysis], enhanced: Vec<BehaviorAnalysis>) {
    let mut by_track: HashMap<u64, String> = enhanced
        .into_iter()
        .filter_map(|a| a.narrative.map(|n| (a.track_id, n)))
        .collect();

    for analysis in analyses.iter_mut() {
        if let Some(narrative) = by_track.remove(&analysis.track_id) {
            analysis.narrative = Some(narrative);
        }
    }
}

/// Offline enhancer that phrases each assessment from fixed templates
#[derive(Default)]
pub struct TemplateEnhancer {
    vehicle_speed_kmh: f32,
}

impl TemplateEnhancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn describe(&self, analysis: &BehaviorAnalysis, object: Option<&TrackedObject>) -> String {
        let subject = object
            .map(|o| o.detection.class_name.clone())
            .unwrap_or_else(|| format!("{:?}", analysis.class).to_lowercase());
        let behavior = analysis.behavior_name.replace('_', " ");
        let distance = analysis.distance_to_vehicle;

        let mut text = match analysis.risk_level {
            RiskLevel::Critical => format!(
                "URGENT: {} {} only {:.1} m ahead. Brake now.",
                subject, behavior, distance
            ),
            RiskLevel::High => format!(
                "HIGH ALERT: {} {} at {:.1} m. Slow down and be ready to stop.",
                subject, behavior, distance
            ),
            RiskLevel::Medium => format!(
                "CAUTION: {} {} at {:.1} m. Watch its movement.",
                subject, behavior, distance
            ),
            RiskLevel::Low => format!(
                "NOTICE: {} {} at {:.1} m.",
                subject, behavior, distance
            ),
            RiskLevel::Safe => format!("{} {}, no risk.", subject, behavior),
        };

        if analysis.has_collision_course() {
            text.push_str(&format!(
                " Time to collision {:.1} s at {:.0} km/h.",
                analysis.time_to_collision, self.vehicle_speed_kmh
            ));
        }
        text
    }
}

impl NarrativeEnhancer for TemplateEnhancer {
    fn enhance(
        &mut self,
        analyses: &[BehaviorAnalysis],
        objects: &[TrackedObject],
    ) -> anyhow::Result<Vec<BehaviorAnalysis>> {
        Ok(analyses
            .iter()
            .map(|analysis| {
                let object = objects.iter().find(|o| o.track_id == analysis.track_id);
                let mut out = analysis.clone();
                out.narrative = Some(self.describe(analysis, object));
                out
            })
            .collect())
    }

    fn set_vehicle_speed(&mut self, kmh: f32) {
        self.vehicle_speed_kmh = kmh;
    }
}
