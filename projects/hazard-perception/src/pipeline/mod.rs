// Hazard perception pipeline: detection, tracking, behavior analysis

pub mod behavior;
pub mod detection;
pub mod enhancer;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod sink;
pub mod stages;
pub mod tracker;
pub mod types;
