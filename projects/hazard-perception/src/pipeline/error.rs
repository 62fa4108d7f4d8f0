use thiserror::Error;

/// How far a stage failure reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Only the current frame is lost
    Frame,
    /// The pipeline itself is broken
    Fatal,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("result sink failed: {0}")]
    Sink(#[source] anyhow::Error),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

impl StageError {
    pub fn severity(&self) -> Severity {
        match self {
            StageError::InvalidFrame(_) | StageError::Sink(_) => Severity::Frame,
            StageError::Poisoned(_) => Severity::Fatal,
        }
    }
}

/// Decides when per-frame faults escalate the system to ERROR
#[derive(Debug, Clone, Copy)]
pub struct FaultPolicy {
    /// Consecutive frame-level faults tolerated before escalating (0 = none)
    pub max_consecutive_frame_faults: u32,
}

impl FaultPolicy {
    pub fn should_escalate(&self, severity: Severity, consecutive_faults: u32) -> bool {
        match severity {
            Severity::Fatal => true,
            Severity::Frame => consecutive_faults > self.max_consecutive_frame_faults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_always_escalates() {
        let policy = FaultPolicy {
            max_consecutive_frame_faults: 100,
        };
        assert!(policy.should_escalate(StageError::Poisoned("tracker").severity(), 1));
    }

    #[test]
    fn test_frame_faults_escalate_after_threshold() {
        let policy = FaultPolicy {
            max_consecutive_frame_faults: 2,
        };
        let severity = StageError::InvalidFrame("empty".into()).severity();
        assert!(!policy.should_escalate(severity, 1));
        assert!(!policy.should_escalate(severity, 2));
        assert!(policy.should_escalate(severity, 3));
    }

    #[test]
    fn test_severity_by_variant() {
        assert_eq!(StageError::InvalidFrame("empty".into()).severity(), Severity::Frame);
        let sink = StageError::Sink(anyhow::anyhow!("disk full"));
        assert_eq!(sink.severity(), Severity::Frame);
        assert_eq!(StageError::Poisoned("analyzer").severity(), Severity::Fatal);
    }

    #[test]
    fn test_zero_tolerance_escalates_first_fault() {
        let policy = FaultPolicy {
            max_consecutive_frame_faults: 0,
        };
        assert!(policy.should_escalate(Severity::Frame, 1));
    }
}
