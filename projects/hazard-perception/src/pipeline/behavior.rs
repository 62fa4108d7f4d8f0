// Behavior classification and risk scoring
//
// Works purely from the tracker's kinematics (pixels/frame) plus a monocular
// distance estimate derived from box height.

use crate::config::{BehaviorConfig, VehicleParams};
use crate::pipeline::types::{
    BehaviorAnalysis, BehaviorType, ObjectCategory, Point, RiskLevel, TrackedObject, NO_COLLISION,
};
use tracing::Span;

/// Pixels/frame below which an object counts as not moving
const IDLE_SPEED: f32 = 0.5;
/// Below this, object or vehicle speed is treated as zero for TTC
const MIN_TTC_SPEED: f32 = 0.1;
/// Distance under which risk is always CRITICAL (meters)
const CRITICAL_DISTANCE: f32 = 5.0;
/// Share of the object's pixel speed folded into the closing speed
const OBJECT_SPEED_WEIGHT: f32 = 0.1;
const SUDDEN_BRAKE_ACCEL: f32 = 5.0;
const SUDDEN_TURN_DEGREES: f32 = 45.0;
const CROSSING_MIN_DX: f32 = 20.0;

pub trait Analyzer: Send {
    fn analyze(&self, objects: &[TrackedObject]) -> Vec<BehaviorAnalysis>;

    fn set_vehicle_speed(&mut self, kmh: f32);

    fn vehicle_speed(&self) -> f32;
}

pub struct KinematicAnalyzer {
    config: BehaviorConfig,
    vehicle_speed_kmh: f32,
    max_speed_kmh: f32,
    span: Span,
}

impl KinematicAnalyzer {
    pub fn new(config: &BehaviorConfig, vehicle: &VehicleParams, span: Span) -> Self {
        Self {
            config: config.clone(),
            vehicle_speed_kmh: 0.0,
            max_speed_kmh: vehicle.max_speed,
            span,
        }
    }

    /// Monocular estimate: taller boxes are closer
    pub fn estimate_distance(&self, obj: &TrackedObject) -> f32 {
        let height = obj.detection.bbox.h.max(0.0);
        (self.config.distance_scale / (height + 1.0))
            .clamp(self.config.min_distance, self.config.max_distance)
    }

    /// Seconds until collision, or `NO_COLLISION` when nothing is closing in
    pub fn time_to_collision(&self, obj: &TrackedObject, distance: f32) -> f32 {
        if obj.speed <= MIN_TTC_SPEED || self.vehicle_speed_kmh <= MIN_TTC_SPEED {
            return NO_COLLISION;
        }

        let mut closing_speed = self.vehicle_speed_kmh / 3.6;
        let direction = obj.direction;
        if direction > -45.0 && direction < 45.0 {
            // Heading the same way as the image x axis: moving away
            closing_speed -= obj.speed * OBJECT_SPEED_WEIGHT;
        } else if direction > 135.0 || direction < -135.0 {
            closing_speed += obj.speed * OBJECT_SPEED_WEIGHT;
        }

        if closing_speed <= 0.0 {
            NO_COLLISION
        } else {
            distance / closing_speed
        }
    }

    fn classify(&self, obj: &TrackedObject, distance: f32) -> (BehaviorType, f32) {
        match obj.detection.class.category() {
            ObjectCategory::Pedestrian => self.classify_pedestrian(obj),
            ObjectCategory::NonMotorized => self.classify_non_motor(obj),
            ObjectCategory::Animal => self.classify_animal(obj, distance),
            ObjectCategory::Other => (BehaviorType::Unknown, 0.5),
        }
    }

    fn classify_pedestrian(&self, obj: &TrackedObject) -> (BehaviorType, f32) {
        let mut result = if obj.speed < IDLE_SPEED {
            (BehaviorType::PedestrianStanding, 0.9)
        } else if obj.speed < self.config.pedestrian_running_threshold {
            (BehaviorType::PedestrianWalking, 0.8)
        } else {
            (BehaviorType::PedestrianRunning, 0.8)
        };

        if is_lateral_crossing(obj) {
            result = (BehaviorType::PedestrianCrossing, 0.7);
        }
        result
    }

    fn classify_non_motor(&self, obj: &TrackedObject) -> (BehaviorType, f32) {
        let mut result = if obj.speed < IDLE_SPEED {
            (BehaviorType::NonMotorStopped, 0.9)
        } else if obj.speed < self.config.non_motor_speeding_threshold {
            (BehaviorType::NonMotorMoving, 0.8)
        } else {
            (BehaviorType::NonMotorSpeeding, 0.8)
        };

        if obj.trajectory.len() >= 3 && obj.acceleration.norm() > SUDDEN_BRAKE_ACCEL {
            result = (BehaviorType::NonMotorSuddenBrake, 0.7);
        }
        if has_sudden_turn(obj) {
            result = (BehaviorType::NonMotorSuddenTurn, 0.6);
        }
        result
    }

    fn classify_animal(&self, obj: &TrackedObject, distance: f32) -> (BehaviorType, f32) {
        if obj.speed < IDLE_SPEED {
            (BehaviorType::AnimalStationary, 0.9)
        } else if distance < self.config.high_risk_distance {
            (BehaviorType::AnimalEnteringRoad, 0.7)
        } else {
            (BehaviorType::AnimalMoving, 0.8)
        }
    }

    fn assess_risk(&self, behavior: BehaviorType, distance: f32, ttc: f32) -> RiskLevel {
        let high_distance = self.config.high_risk_distance;
        let ttc_threshold = self.config.collision_risk_ttc;

        if distance < CRITICAL_DISTANCE {
            RiskLevel::Critical
        } else if distance < high_distance {
            RiskLevel::High
        } else if distance < high_distance * 2.0 {
            RiskLevel::Medium
        } else if ttc > 0.0 && ttc < ttc_threshold {
            RiskLevel::High
        } else if ttc > 0.0 && ttc < ttc_threshold * 2.0 {
            RiskLevel::Medium
        } else if behavior.needs_attention() {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn analyze_one(&self, obj: &TrackedObject) -> BehaviorAnalysis {
        let distance = self.estimate_distance(obj);
        let (behavior, confidence) = self.classify(obj, distance);
        let ttc = self.time_to_collision(obj, distance);
        let risk_level = self.assess_risk(behavior, distance, ttc);

        BehaviorAnalysis {
            track_id: obj.track_id,
            class: obj.detection.class,
            behavior,
            behavior_name: behavior.name().to_string(),
            confidence,
            risk_level,
            risk_description: risk_level.description().to_string(),
            location: obj.position(),
            bbox: obj.detection.bbox,
            distance_to_vehicle: distance,
            time_to_collision: ttc,
            timestamp: obj.last_updated,
            narrative: None,
        }
    }
}

/// Net horizontal displacement dominates and is large enough to be deliberate
fn is_lateral_crossing(obj: &TrackedObject) -> bool {
    if obj.trajectory.len() < 3 {
        return false;
    }
    let (Some(first), Some(last)) = (obj.trajectory.front(), obj.trajectory.back()) else {
        return false;
    };
    let delta = *last - *first;
    delta.x.abs() > 2.0 * delta.y.abs() && delta.x.abs() > CROSSING_MIN_DX
}

/// Heading of the latest segment against the one two steps earlier
fn has_sudden_turn(obj: &TrackedObject) -> bool {
    if obj.trajectory.len() < 5 {
        return false;
    }
    let points: Vec<Point> = obj.trajectory.iter().copied().collect();
    let bearings: Vec<f32> = points
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).angle_deg())
        .collect();

    let n = bearings.len();
    let mut change = (bearings[n - 1] - bearings[n - 3]).abs() % 360.0;
    if change > 180.0 {
        change = 360.0 - change;
    }
    change > SUDDEN_TURN_DEGREES
}

impl Analyzer for KinematicAnalyzer {
    fn analyze(&self, objects: &[TrackedObject]) -> Vec<BehaviorAnalysis> {
        let results: Vec<BehaviorAnalysis> = objects.iter().map(|o| self.analyze_one(o)).collect();
        let elevated = results
            .iter()
            .filter(|r| r.risk_level >= RiskLevel::High)
            .count();
        if elevated > 0 {
            tracing::debug!(
                parent: &self.span,
                elevated,
                total = results.len(),
                "High risk objects"
            );
        }
        results
    }

    /// Clamped to `[0, vehicle.max_speed]`
    fn set_vehicle_speed(&mut self, kmh: f32) {
        self.vehicle_speed_kmh = kmh.min(self.max_speed_kmh).max(0.0);
        tracing::info!(
            parent: &self.span,
            speed_kmh = self.vehicle_speed_kmh,
            "Vehicle speed updated"
        );
    }

    fn vehicle_speed(&self) -> f32 {
        self.vehicle_speed_kmh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, Detection, ObjectClass};
    use std::collections::VecDeque;

    fn analyzer() -> KinematicAnalyzer {
        KinematicAnalyzer::new(
            &BehaviorConfig::default(),
            &VehicleParams::default(),
            Span::none(),
        )
    }

    /// Box height that maps to `meters` under the default distance model
    fn height_for(meters: f32) -> f32 {
        1000.0 / meters - 1.0
    }

    fn object(class: ObjectClass, height: f32, trajectory: &[(f32, f32)]) -> TrackedObject {
        let trajectory: VecDeque<Point> =
            trajectory.iter().map(|&(x, y)| Point::new(x, y)).collect();
        let n = trajectory.len();
        let velocity = if n >= 2 {
            trajectory[n - 1] - trajectory[n - 2]
        } else {
            Point::default()
        };
        let previous = if n >= 3 {
            trajectory[n - 2] - trajectory[n - 3]
        } else {
            Point::default()
        };
        TrackedObject {
            track_id: 7,
            detection: Detection::new(class, 0.9, BBox::new(300.0, 200.0, 40.0, height), 1000),
            trajectory,
            velocity,
            acceleration: velocity - previous,
            speed: velocity.norm(),
            direction: if velocity.norm() > 0.1 { velocity.angle_deg() } else { 0.0 },
            age: n as u32,
            consecutive_misses: 0,
            is_confirmed: true,
            first_seen: 0,
            last_updated: 1000,
        }
    }

    #[test]
    fn test_standing_pedestrian_far_away_is_low_risk() {
        let a = analyzer();
        let obj = object(
            ObjectClass::Pedestrian,
            height_for(30.0),
            &[(320.0, 240.0), (320.0, 240.0), (320.0, 240.0)],
        );
        let result = &a.analyze(&[obj])[0];
        assert_eq!(result.behavior, BehaviorType::PedestrianStanding);
        assert_eq!(result.behavior_name, "standing");
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.time_to_collision, NO_COLLISION);
        assert!((result.distance_to_vehicle - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_risk_increases_as_distance_shrinks() {
        let a = analyzer();
        let expected = [
            (3.0, RiskLevel::Critical),
            (8.0, RiskLevel::High),
            (15.0, RiskLevel::Medium),
            (30.0, RiskLevel::Low),
        ];
        for (meters, level) in expected {
            let obj = object(
                ObjectClass::Pedestrian,
                height_for(meters),
                &[(320.0, 240.0), (320.0, 240.0)],
            );
            assert_eq!(a.analyze(&[obj])[0].risk_level, level, "at {} m", meters);
        }
    }

    #[test]
    fn test_distance_is_clamped() {
        let a = analyzer();
        let tiny = object(ObjectClass::Pedestrian, 2.0, &[(0.0, 0.0)]);
        let huge = object(ObjectClass::Pedestrian, 5000.0, &[(0.0, 0.0)]);
        assert_eq!(a.estimate_distance(&tiny), 50.0);
        assert_eq!(a.estimate_distance(&huge), 1.0);
    }

    #[test]
    fn test_ttc_requires_both_speeds() {
        let mut a = analyzer();
        let moving = object(
            ObjectClass::Cyclist,
            height_for(40.0),
            &[(100.0, 240.0), (100.0, 242.0)],
        );
        assert_eq!(a.time_to_collision(&moving, 40.0), NO_COLLISION);

        a.set_vehicle_speed(36.0);
        let still = object(ObjectClass::Cyclist, height_for(40.0), &[(100.0, 240.0)]);
        assert_eq!(a.time_to_collision(&still, 40.0), NO_COLLISION);

        // Heading 90 degrees: closing speed is just the vehicle's 10 m/s
        let ttc = a.time_to_collision(&moving, 40.0);
        assert!((ttc - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_ttc_feeds_risk() {
        let mut a = analyzer();
        a.set_vehicle_speed(72.0);
        // 40 m at 20 m/s (heading straight down the image) gives 2 s
        let obj = object(
            ObjectClass::Cyclist,
            height_for(40.0),
            &[(100.0, 240.0), (100.0, 241.0)],
        );
        let result = &a.analyze(&[obj])[0];
        assert!((result.time_to_collision - 2.0).abs() < 0.01);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!(result.has_collision_course());
    }

    #[test]
    fn test_receding_object_has_no_ttc() {
        let mut a = analyzer();
        a.set_vehicle_speed(0.2);
        // Moving along +x at 10 px/frame outweighs a 0.055 m/s vehicle
        let obj = object(
            ObjectClass::Pedestrian,
            height_for(40.0),
            &[(100.0, 240.0), (110.0, 240.0)],
        );
        assert_eq!(a.time_to_collision(&obj, 40.0), NO_COLLISION);
    }

    #[test]
    fn test_lateral_pedestrian_is_crossing() {
        let a = analyzer();
        let obj = object(
            ObjectClass::Pedestrian,
            height_for(45.0),
            &[(100.0, 240.0), (112.0, 241.0), (125.0, 242.0)],
        );
        let result = &a.analyze(&[obj])[0];
        assert_eq!(result.behavior, BehaviorType::PedestrianCrossing);
        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_pedestrian_speed_bands() {
        let a = analyzer();
        let walking = object(
            ObjectClass::Pedestrian,
            height_for(45.0),
            &[(100.0, 240.0), (100.0, 241.0)],
        );
        let running = object(
            ObjectClass::Pedestrian,
            height_for(45.0),
            &[(100.0, 240.0), (100.0, 244.0)],
        );
        let results = a.analyze(&[walking, running]);
        assert_eq!(results[0].behavior, BehaviorType::PedestrianWalking);
        assert_eq!(results[1].behavior, BehaviorType::PedestrianRunning);
        assert_eq!(results[1].risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_non_motor_sudden_brake() {
        let a = analyzer();
        let obj = object(
            ObjectClass::Bicycle,
            height_for(45.0),
            &[(100.0, 100.0), (100.0, 108.0), (100.0, 109.0)],
        );
        let result = &a.analyze(&[obj])[0];
        assert_eq!(result.behavior, BehaviorType::NonMotorSuddenBrake);
        assert_eq!(result.confidence, 0.7);
    }

    #[test]
    fn test_non_motor_sudden_turn() {
        let a = analyzer();
        // Three segments heading down, then one heading right
        let obj = object(
            ObjectClass::Motorcycle,
            height_for(45.0),
            &[
                (100.0, 100.0),
                (100.0, 102.0),
                (100.0, 104.0),
                (100.0, 106.0),
                (102.0, 106.0),
            ],
        );
        let result = &a.analyze(&[obj])[0];
        assert_eq!(result.behavior, BehaviorType::NonMotorSuddenTurn);
        assert_eq!(result.confidence, 0.6);
    }

    #[test]
    fn test_turn_across_the_axis_wraps() {
        // Bearings of 170 and -170 degrees differ by 20, not 340
        let obj = object(
            ObjectClass::Bicycle,
            height_for(45.0),
            &[
                (100.0, 100.0),
                (90.15, 101.74),
                (80.3, 103.48),
                (70.45, 101.74),
                (60.6, 100.0),
            ],
        );
        assert!(!has_sudden_turn(&obj));
    }

    #[test]
    fn test_animal_behaviors() {
        let a = analyzer();
        let still = object(ObjectClass::Animal, height_for(8.0), &[(0.0, 0.0), (0.0, 0.0)]);
        let near = object(ObjectClass::Animal, height_for(8.0), &[(0.0, 0.0), (0.0, 2.0)]);
        let far = object(ObjectClass::Animal, height_for(40.0), &[(0.0, 0.0), (0.0, 2.0)]);
        let results = a.analyze(&[still, near, far]);
        assert_eq!(results[0].behavior, BehaviorType::AnimalStationary);
        assert_eq!(results[1].behavior, BehaviorType::AnimalEnteringRoad);
        assert_eq!(results[2].behavior, BehaviorType::AnimalMoving);
    }

    #[test]
    fn test_unknown_class() {
        let a = analyzer();
        let obj = object(ObjectClass::Unknown, height_for(45.0), &[(0.0, 0.0)]);
        let result = &a.analyze(&[obj])[0];
        assert_eq!(result.behavior, BehaviorType::Unknown);
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_negative_vehicle_speed_is_clamped() {
        let mut a = analyzer();
        a.set_vehicle_speed(-10.0);
        assert_eq!(a.vehicle_speed(), 0.0);
    }

    #[test]
    fn test_vehicle_speed_capped_at_vehicle_limit() {
        let vehicle = VehicleParams {
            max_speed: 90.0,
            ..VehicleParams::default()
        };
        let mut a = KinematicAnalyzer::new(&BehaviorConfig::default(), &vehicle, Span::none());
        a.set_vehicle_speed(200.0);
        assert_eq!(a.vehicle_speed(), 90.0);

        // TTC sees the capped 25 m/s, not 200 km/h
        let moving = object(
            ObjectClass::Cyclist,
            height_for(40.0),
            &[(100.0, 240.0), (100.0, 242.0)],
        );
        let ttc = a.time_to_collision(&moving, 50.0);
        assert!((ttc - 2.0).abs() < 1e-4);
    }
}
