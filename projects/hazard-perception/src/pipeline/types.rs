use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Add, Sub};

/// Time-to-collision value meaning "no collision risk modeled"
pub const NO_COLLISION: f32 = -1.0;

/// A 2D point (or displacement) in pixel coordinates
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean length when used as a vector
    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Angle of the vector in degrees, in (-180, 180]
    pub fn angle_deg(&self) -> f32 {
        self.y.atan2(self.x).to_degrees()
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Axis-aligned bounding box: top-left corner plus width/height, in pixels
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.h > 0.0 {
            self.w / self.h
        } else {
            0.0
        }
    }

    /// Same extent, moved so that its center sits on `center`
    pub fn centered_at(&self, center: Point) -> BBox {
        BBox::new(center.x - self.w / 2.0, center.y - self.h / 2.0, self.w, self.h)
    }

    /// Intersection over Union. Disjoint and zero-area boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Object categories the detector can report
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    #[default]
    Unknown,
    Pedestrian,
    Cyclist,
    Motorcyclist,
    Bicycle,
    Motorcycle,
    Tricycle,
    Animal,
}

/// Coarse grouping used to pick a behavior model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCategory {
    Pedestrian,
    NonMotorized,
    Animal,
    Other,
}

impl ObjectClass {
    pub fn category(&self) -> ObjectCategory {
        match self {
            ObjectClass::Pedestrian => ObjectCategory::Pedestrian,
            ObjectClass::Cyclist
            | ObjectClass::Motorcyclist
            | ObjectClass::Bicycle
            | ObjectClass::Motorcycle
            | ObjectClass::Tricycle => ObjectCategory::NonMotorized,
            ObjectClass::Animal => ObjectCategory::Animal,
            ObjectClass::Unknown => ObjectCategory::Other,
        }
    }
}

/// A single identity-less observation produced by the detector
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: ObjectClass,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Capture timestamp (ms)
    pub timestamp: u64,
}

impl Detection {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BBox, timestamp: u64) -> Self {
        Self {
            class,
            class_name: format!("{:?}", class).to_lowercase(),
            confidence,
            bbox,
            timestamp,
        }
    }

    pub fn with_class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = name.into();
        self
    }

    pub fn center(&self) -> Point {
        self.bbox.center()
    }

    pub fn area(&self) -> f32 {
        self.bbox.area()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.bbox.aspect_ratio()
    }
}

/// Persistent identity maintained across frames by the tracker
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub track_id: u64,
    pub detection: Detection,
    /// Center points, oldest first
    pub trajectory: VecDeque<Point>,
    /// Pixels per frame
    pub velocity: Point,
    pub acceleration: Point,
    pub speed: f32,
    /// Heading of the velocity vector in degrees
    pub direction: f32,
    pub age: u32,
    pub consecutive_misses: u32,
    pub is_confirmed: bool,
    pub first_seen: u64,
    pub last_updated: u64,
}

impl TrackedObject {
    pub fn position(&self) -> Point {
        self.trajectory
            .back()
            .copied()
            .unwrap_or_else(|| self.detection.center())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorType {
    PedestrianStanding,
    PedestrianWalking,
    PedestrianRunning,
    PedestrianCrossing,
    NonMotorStopped,
    NonMotorMoving,
    NonMotorSpeeding,
    NonMotorSuddenBrake,
    NonMotorSuddenTurn,
    AnimalStationary,
    AnimalMoving,
    AnimalEnteringRoad,
    Unknown,
}

impl BehaviorType {
    pub fn name(&self) -> &'static str {
        match self {
            BehaviorType::PedestrianStanding => "standing",
            BehaviorType::PedestrianWalking => "walking",
            BehaviorType::PedestrianRunning => "running",
            BehaviorType::PedestrianCrossing => "crossing",
            BehaviorType::NonMotorStopped => "stopped",
            BehaviorType::NonMotorMoving => "moving",
            BehaviorType::NonMotorSpeeding => "speeding",
            BehaviorType::NonMotorSuddenBrake => "sudden_brake",
            BehaviorType::NonMotorSuddenTurn => "sudden_turn",
            BehaviorType::AnimalStationary => "stationary",
            BehaviorType::AnimalMoving => "moving",
            BehaviorType::AnimalEnteringRoad => "entering_road",
            BehaviorType::Unknown => "unknown",
        }
    }

    /// Behaviors that raise risk to at least MEDIUM on their own
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            BehaviorType::PedestrianRunning
                | BehaviorType::PedestrianCrossing
                | BehaviorType::NonMotorSpeeding
                | BehaviorType::NonMotorSuddenBrake
                | BehaviorType::NonMotorSuddenTurn
                | BehaviorType::AnimalEnteringRoad
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Safe,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "Safe",
            RiskLevel::Low => "Low risk",
            RiskLevel::Medium => "Medium risk - attention required",
            RiskLevel::High => "High risk - caution advised",
            RiskLevel::Critical => "Critical risk - immediate action required",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "Safe",
            RiskLevel::Low => "Low Risk",
            RiskLevel::Medium => "Medium Risk",
            RiskLevel::High => "High Risk",
            RiskLevel::Critical => "Critical",
        }
    }
}

/// Per-object, per-frame behavior and risk assessment
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BehaviorAnalysis {
    pub track_id: u64,
    pub class: ObjectClass,
    pub behavior: BehaviorType,
    pub behavior_name: String,
    pub confidence: f32,
    pub risk_level: RiskLevel,
    pub risk_description: String,
    pub location: Point,
    pub bbox: BBox,
    /// Meters (approximate)
    pub distance_to_vehicle: f32,
    /// Seconds, or `NO_COLLISION`
    pub time_to_collision: f32,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
}

impl BehaviorAnalysis {
    pub fn has_collision_course(&self) -> bool {
        self.time_to_collision > 0.0
    }
}

/// A frame delivered by the video source, tagged with its capture order
pub struct RawFrame {
    pub id: u64,
    pub timestamp: u64,
    pub mat: Mat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Stopped,
    Initializing,
    Running,
    Paused,
    Error,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Stopped => "STOPPED",
            SystemState::Initializing => "INITIALIZING",
            SystemState::Running => "RUNNING",
            SystemState::Paused => "PAUSED",
            SystemState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Wall-clock cost of each stage for one frame
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub detection_ms: f64,
    pub tracking_ms: f64,
    pub analysis_ms: f64,
    pub total_ms: f64,
}

/// Rolling pipeline statistics
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemPerformance {
    pub fps: f64,
    pub detection_time_ms: f64,
    pub tracking_time_ms: f64,
    pub analysis_time_ms: f64,
    pub total_latency_ms: f64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub frame_faults: u64,
}

const PERFORMANCE_ALPHA: f64 = 0.2;

fn smooth(previous: f64, sample: f64, seeded: bool) -> f64 {
    if seeded {
        PERFORMANCE_ALPHA * sample + (1.0 - PERFORMANCE_ALPHA) * previous
    } else {
        sample
    }
}

impl SystemPerformance {
    /// Fold one completed frame into the moving averages
    pub fn record(&mut self, timings: StageTimings) {
        let seeded = self.frames_processed > 0;
        self.detection_time_ms = smooth(self.detection_time_ms, timings.detection_ms, seeded);
        self.tracking_time_ms = smooth(self.tracking_time_ms, timings.tracking_ms, seeded);
        self.analysis_time_ms = smooth(self.analysis_time_ms, timings.analysis_ms, seeded);
        self.total_latency_ms = smooth(self.total_latency_ms, timings.total_ms, seeded);
        if timings.total_ms > 0.0 {
            self.fps = smooth(self.fps, 1000.0 / timings.total_ms, seeded);
        }
        self.frames_processed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_disjoint_symmetric() {
        let a = BBox::new(10.0, 10.0, 40.0, 40.0);
        let b = BBox::new(30.0, 20.0, 40.0, 40.0);
        let far = BBox::new(500.0, 500.0, 10.0, 10.0);

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
        assert_eq!(a.iou(&b), b.iou(&a));
        assert!(a.iou(&b) > 0.0 && a.iou(&b) < 1.0);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let zero = BBox::new(5.0, 5.0, 0.0, 0.0);
        assert_eq!(zero.iou(&zero), 0.0);

        let line = BBox::new(0.0, 0.0, 10.0, 0.0);
        assert_eq!(line.iou(&BBox::new(0.0, 0.0, 10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_touching_boxes_do_not_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_centered_at_keeps_extent() {
        let b = BBox::new(0.0, 0.0, 20.0, 10.0).centered_at(Point::new(50.0, 50.0));
        assert_eq!(b, BBox::new(40.0, 45.0, 20.0, 10.0));
        assert_eq!(b.center(), Point::new(50.0, 50.0));
    }

    #[test]
    fn test_risk_level_ordering() {
        for pair in RiskLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_performance_seeds_then_smooths() {
        let mut perf = SystemPerformance::default();
        perf.record(StageTimings {
            detection_ms: 10.0,
            tracking_ms: 1.0,
            analysis_ms: 1.0,
            total_ms: 20.0,
        });
        assert_eq!(perf.total_latency_ms, 20.0);
        assert_eq!(perf.fps, 50.0);

        perf.record(StageTimings {
            detection_ms: 10.0,
            tracking_ms: 1.0,
            analysis_ms: 1.0,
            total_ms: 40.0,
        });
        assert!((perf.total_latency_ms - 24.0).abs() < 1e-9);
        assert!((perf.fps - 45.0).abs() < 1e-9);
        assert_eq!(perf.frames_processed, 2);
    }
}
