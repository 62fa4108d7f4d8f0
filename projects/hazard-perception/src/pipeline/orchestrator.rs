// Pipeline orchestrator: owns the system state machine
//
// Frames arrive from the video producer thread and are dispatched to the
// worker pool. Detection runs concurrently; tracking and analysis pass
// through a sequencer so the tracker sees frames in capture order.

use crate::config::SystemConfig;
use crate::pipeline::behavior::Analyzer;
use crate::pipeline::detection::DetectorPool;
use crate::pipeline::enhancer::{apply_narratives, NarrativeEnhancer};
use crate::pipeline::error::{FaultPolicy, Severity, StageError};
use crate::pipeline::pool::WorkerPool;
use crate::pipeline::sink::ResultSink;
use crate::pipeline::stages::StageFactory;
use crate::pipeline::tracker::Tracker;
use crate::pipeline::types::{
    BehaviorAnalysis, Detection, RawFrame, StageTimings, SystemPerformance, SystemState,
    TrackedObject,
};
use crate::video::manager::VideoSourceManager;
use anyhow::{anyhow, bail, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;
use tracing::Span;

pub type StateCallback = Arc<dyn Fn(SystemState) + Send + Sync>;
pub type ResultCallback = Arc<dyn Fn(&[BehaviorAnalysis], u64) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Stage instances for one configuration
struct Stages {
    detectors: DetectorPool,
    tracker: Mutex<Box<dyn Tracker>>,
    analyzer: Mutex<Box<dyn Analyzer>>,
    enhancer: Option<Mutex<Box<dyn NarrativeEnhancer>>>,
    sink: Mutex<Box<dyn ResultSink>>,
    enhance_interval: u64,
    fault_policy: FaultPolicy,
}

/// Admits frames into the tracking stage strictly by dispatch sequence
struct Sequencer {
    next: Mutex<u64>,
    turn: Condvar,
}

struct Turn<'a> {
    next: MutexGuard<'a, u64>,
    turn: &'a Condvar,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        *self.next += 1;
        self.turn.notify_all();
    }
}

impl Sequencer {
    fn new() -> Self {
        Self {
            next: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    fn wait_turn(&self, seq: u64) -> Turn<'_> {
        let mut next = lock(&self.next);
        while *next < seq {
            next = self.turn.wait(next).unwrap_or_else(|e| e.into_inner());
        }
        Turn {
            next,
            turn: &self.turn,
        }
    }

    fn reset(&self) {
        *lock(&self.next) = 0;
    }
}

struct Inner {
    factory: Arc<dyn StageFactory>,
    config: RwLock<SystemConfig>,
    state: Mutex<SystemState>,
    /// Serializes start/stop/pause/resume/update_config/reset
    control: Mutex<()>,
    running: AtomicBool,
    paused: Mutex<bool>,
    pause_changed: Condvar,
    stages: RwLock<Option<Arc<Stages>>>,
    video: Mutex<Option<VideoSourceManager>>,
    pool: RwLock<Arc<WorkerPool>>,
    sequencer: Sequencer,
    next_dispatch: AtomicU64,
    consecutive_faults: AtomicU32,
    vehicle_speed: Mutex<f32>,
    last_results: Mutex<Vec<BehaviorAnalysis>>,
    performance: Mutex<SystemPerformance>,
    state_callback: Mutex<Option<StateCallback>>,
    result_callback: Mutex<Option<ResultCallback>>,
    span: Span,
}

impl Inner {
    fn state(&self) -> SystemState {
        *lock(&self.state)
    }

    fn set_state(&self, new_state: SystemState) {
        self.transition(|_| true, new_state);
    }

    /// Move to `new_state` if `allowed` accepts the current one, then notify
    fn transition(&self, allowed: impl Fn(SystemState) -> bool, new_state: SystemState) -> bool {
        let old_state = {
            let mut state = lock(&self.state);
            if *state == new_state || !allowed(*state) {
                return false;
            }
            std::mem::replace(&mut *state, new_state)
        };
        tracing::info!(parent: &self.span, "State: {} -> {}", old_state, new_state);

        let callback = lock(&self.state_callback).clone();
        if let Some(callback) = callback {
            callback(new_state);
        }
        true
    }

    fn current_stages(&self) -> Option<Arc<Stages>> {
        self.stages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_pool(&self) -> Arc<WorkerPool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn config(&self) -> SystemConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_paused(&self, paused: bool) {
        *lock(&self.paused) = paused;
        self.pause_changed.notify_all();
    }

    fn is_paused(&self) -> bool {
        *lock(&self.paused)
    }

    /// Block while paused. Returns false once the system is no longer running.
    fn wait_while_paused(&self) -> bool {
        let mut paused = lock(&self.paused);
        while *paused && self.running.load(Ordering::SeqCst) {
            paused = self
                .pause_changed
                .wait(paused)
                .unwrap_or_else(|e| e.into_inner());
        }
        self.running.load(Ordering::SeqCst)
    }

    fn open_video(self: &Arc<Self>, config: &SystemConfig) -> Result<VideoSourceManager> {
        let span = tracing::info_span!(parent: &self.span, "video");
        let mut video = self.factory.video_source(config, span)?;
        video.initialize()?;

        let weak: Weak<Inner> = Arc::downgrade(self);
        video.register_frame_callback(Arc::new(move |mat, timestamp| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(mat, timestamp);
            }
        }));
        Ok(video)
    }

    fn build_stages(&self, config: &SystemConfig, fps: f64) -> Result<Stages> {
        let factory = &self.factory;
        let workers = config.pipeline.workers;

        let tracker = factory.tracker(config, tracing::info_span!(parent: &self.span, "tracker"))?;
        let mut analyzer =
            factory.analyzer(config, tracing::info_span!(parent: &self.span, "analyzer"))?;
        let mut enhancer = factory.enhancer(config)?;
        let detectors = factory.detectors(config, workers)?;
        let sink = factory.sink(config, fps)?;

        let speed = *lock(&self.vehicle_speed);
        analyzer.set_vehicle_speed(speed);
        if let Some(enhancer) = enhancer.as_mut() {
            enhancer.set_vehicle_speed(speed);
        }

        Ok(Stages {
            detectors: DetectorPool::new(detectors),
            tracker: Mutex::new(tracker),
            analyzer: Mutex::new(analyzer),
            enhancer: enhancer.map(Mutex::new),
            sink: Mutex::new(sink),
            enhance_interval: config.llm.analysis_interval.max(1),
            fault_policy: config.pipeline.fault_policy(),
        })
    }

    fn video_fps(&self) -> f64 {
        lock(&self.video)
            .as_ref()
            .and_then(|v| v.properties())
            .map(|p| p.fps)
            .unwrap_or(crate::video::DEFAULT_FPS)
    }

    /// Connect the source and build every stage from `config`
    fn initialize_all(self: &Arc<Self>, config: &SystemConfig) -> Result<()> {
        // A fault may have left intake open; release the device before reconnecting
        self.halt();
        lock(&self.video).take();
        self.stages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let video = self.open_video(config)?;
        let fps = video.properties().map(|p| p.fps).unwrap_or(crate::video::DEFAULT_FPS);
        *lock(&self.video) = Some(video);

        let stages = self.build_stages(config, fps)?;
        *self.stages.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(stages));
        Ok(())
    }

    /// Stop intake and wait for in-flight frames. Frames parked at a pause
    /// checkpoint exit early.
    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.set_paused(false);
        if let Some(video) = lock(&self.video).as_mut() {
            video.stop();
        }
        self.current_pool().drain();
        self.sequencer.reset();
        self.next_dispatch.store(0, Ordering::SeqCst);
    }

    /// Reopen intake, optionally straight into the paused condition.
    /// `restoring` accepts a file source that has already been read out.
    fn activate(&self, paused: bool, restoring: bool) -> Result<()> {
        if self.current_stages().is_none() {
            bail!("System is not initialized");
        }
        self.consecutive_faults.store(0, Ordering::SeqCst);
        self.set_paused(paused);
        self.running.store(true, Ordering::SeqCst);
        self.current_pool().resume();

        let mut video = lock(&self.video);
        let video = video
            .as_mut()
            .ok_or_else(|| anyhow!("Video source is not initialized"))?;
        if !(restoring && video.is_finished()) {
            video.start()?;
        }
        if paused {
            video.pause();
        }
        Ok(())
    }

    /// Frame callback from the video producer
    fn dispatch(self: &Arc<Self>, mat: Mat, timestamp: u64) {
        // `activate` raises `running` before the producer starts, ahead of
        // the RUNNING transition
        if !self.running.load(Ordering::SeqCst) || self.is_paused() {
            return;
        }
        let Some(stages) = self.current_stages() else {
            return;
        };

        // Single producer thread, so load/increment cannot interleave
        let seq = self.next_dispatch.load(Ordering::SeqCst);
        let frame = RawFrame {
            id: seq,
            timestamp,
            mat,
        };
        let inner = self.clone();
        match self
            .current_pool()
            .submit(move || inner.process_frame(&stages, frame))
        {
            Ok(()) => {
                self.next_dispatch.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                lock(&self.performance).frames_dropped += 1;
                tracing::debug!(parent: &self.span, "Dropped frame at {}: {}", timestamp, e);
            }
        }
    }

    fn process_frame(&self, stages: &Stages, frame: RawFrame) {
        let started = Instant::now();
        match self.run_stages(stages, &frame, started) {
            Ok(()) => {
                self.consecutive_faults.store(0, Ordering::SeqCst);
            }
            Err(e) => self.record_fault(e, &stages.fault_policy, frame.id),
        }
    }

    fn detect(&self, stages: &Stages, frame: &RawFrame) -> Vec<Detection> {
        // A panicking detector must not strand later frames at the sequencer
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            stages
                .detectors
                .with_detector(|d| d.detect(&frame.mat, frame.timestamp))
        }));
        match result {
            Ok(Some(Ok(detections))) => detections,
            Ok(Some(Err(e))) => {
                tracing::warn!(parent: &self.span, frame = frame.id, "Detection failed: {}", e);
                Vec::new()
            }
            Ok(None) => {
                tracing::warn!(parent: &self.span, "No detector available");
                Vec::new()
            }
            Err(_) => {
                tracing::error!(parent: &self.span, frame = frame.id, "Detector panicked");
                Vec::new()
            }
        }
    }

    fn run_stages(
        &self,
        stages: &Stages,
        frame: &RawFrame,
        started: Instant,
    ) -> Result<(), StageError> {
        let seq = frame.id;
        if !self.wait_while_paused() {
            drop(self.sequencer.wait_turn(seq));
            return Ok(());
        }
        if frame.mat.empty() {
            drop(self.sequencer.wait_turn(seq));
            return Err(StageError::InvalidFrame(format!("frame {} is empty", seq)));
        }

        let detection_started = Instant::now();
        let detections = self.detect(stages, frame);
        let detection_ms = detection_started.elapsed().as_secs_f64() * 1000.0;

        if !self.wait_while_paused() {
            drop(self.sequencer.wait_turn(seq));
            return Ok(());
        }

        let (objects, mut analyses, tracking_ms, analysis_ms) = {
            let _turn = self.sequencer.wait_turn(seq);
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            let tracking_started = Instant::now();
            let objects = stages
                .tracker
                .lock()
                .map_err(|_| StageError::Poisoned("tracker"))?
                .update(&detections, frame.timestamp);
            let tracking_ms = tracking_started.elapsed().as_secs_f64() * 1000.0;

            let analysis_started = Instant::now();
            let analyses = stages
                .analyzer
                .lock()
                .map_err(|_| StageError::Poisoned("analyzer"))?
                .analyze(&objects);
            let analysis_ms = analysis_started.elapsed().as_secs_f64() * 1000.0;

            (objects, analyses, tracking_ms, analysis_ms)
        };

        if let Some(enhancer) = &stages.enhancer {
            if seq % stages.enhance_interval == 0 && !analyses.is_empty() {
                let enhanced = lock(enhancer).enhance(&analyses, &objects);
                match enhanced {
                    Ok(enhanced) => apply_narratives(&mut analyses, enhanced),
                    Err(e) => {
                        tracing::warn!(parent: &self.span, "Narrative enhancement failed: {}", e)
                    }
                }
            }
        }

        stages
            .sink
            .lock()
            .map_err(|_| StageError::Poisoned("sink"))?
            .process(&analyses, &frame.mat, frame.timestamp)
            .map_err(StageError::Sink)?;

        *lock(&self.last_results) = analyses.clone();
        let callback = lock(&self.result_callback).clone();
        if let Some(callback) = callback {
            callback(&analyses, frame.timestamp);
        }

        lock(&self.performance).record(StageTimings {
            detection_ms,
            tracking_ms,
            analysis_ms,
            total_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
        Ok(())
    }

    fn record_fault(&self, error: StageError, policy: &FaultPolicy, frame_id: u64) {
        let consecutive = self.consecutive_faults.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.performance).frame_faults += 1;
        let severity = error.severity();

        if policy.should_escalate(severity, consecutive) {
            tracing::error!(
                parent: &self.span,
                frame = frame_id,
                consecutive,
                "Pipeline fault: {}",
                error
            );
            self.running.store(false, Ordering::SeqCst);
            self.set_paused(false);
            self.transition(
                |s| matches!(s, SystemState::Running | SystemState::Paused),
                SystemState::Error,
            );
        } else if severity == Severity::Frame {
            tracing::warn!(
                parent: &self.span,
                frame = frame_id,
                consecutive,
                "Frame dropped: {}",
                error
            );
        }
    }
}

/// The hazard perception system: video source, stages and worker pool
/// behind one state machine.
///
/// State and result callbacks run synchronously on the thread that caused
/// them (possibly a worker) and must not call back into control methods.
pub struct PerceptionSystem {
    inner: Arc<Inner>,
}

impl PerceptionSystem {
    pub fn new(config: SystemConfig, factory: Arc<dyn StageFactory>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.pipeline.workers, config.pipeline.queue_depth)?;

        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                config: RwLock::new(config),
                state: Mutex::new(SystemState::Stopped),
                control: Mutex::new(()),
                running: AtomicBool::new(false),
                paused: Mutex::new(false),
                pause_changed: Condvar::new(),
                stages: RwLock::new(None),
                video: Mutex::new(None),
                pool: RwLock::new(Arc::new(pool)),
                sequencer: Sequencer::new(),
                next_dispatch: AtomicU64::new(0),
                consecutive_faults: AtomicU32::new(0),
                vehicle_speed: Mutex::new(0.0),
                last_results: Mutex::new(Vec::new()),
                performance: Mutex::new(SystemPerformance::default()),
                state_callback: Mutex::new(None),
                result_callback: Mutex::new(None),
                span: tracing::info_span!("perception"),
            }),
        })
    }

    /// Connect the video source and build all stages. Leaves the system
    /// STOPPED on success and in ERROR on failure.
    pub fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        let state = inner.state();
        if matches!(state, SystemState::Running | SystemState::Paused) {
            bail!("Cannot initialize while {}", state);
        }

        inner.set_state(SystemState::Initializing);
        let config = inner.config();
        match inner.initialize_all(&config) {
            Ok(()) => {
                inner.set_state(SystemState::Stopped);
                Ok(())
            }
            Err(e) => {
                tracing::error!(parent: &inner.span, "Initialization failed: {:#}", e);
                inner.set_state(SystemState::Error);
                Err(e)
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        match inner.state() {
            SystemState::Running => return Ok(()),
            SystemState::Paused => return self.resume_locked(),
            SystemState::Stopped => {}
            other => bail!("Cannot start while {}", other),
        }

        if let Err(e) = inner.activate(false, false) {
            inner.halt();
            return Err(e);
        }
        inner.set_state(SystemState::Running);
        Ok(())
    }

    /// Full barrier: the producer is joined and every in-flight frame is done
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        if inner.state() == SystemState::Stopped {
            return Ok(());
        }
        inner.set_state(SystemState::Stopped);
        inner.halt();
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        let state = inner.state();
        if state != SystemState::Running {
            bail!("Cannot pause while {}", state);
        }
        inner.set_paused(true);
        if let Some(video) = lock(&inner.video).as_ref() {
            video.pause();
        }
        inner.set_state(SystemState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let _control = lock(&self.inner.control);
        self.resume_locked()
    }

    fn resume_locked(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        if state != SystemState::Paused {
            bail!("Cannot resume while {}", state);
        }
        inner.set_paused(false);
        if let Some(video) = lock(&inner.video).as_ref() {
            video.resume();
        }
        inner.set_state(SystemState::Running);
        Ok(())
    }

    /// Swap in a new configuration. Processing is paused while stages are
    /// rebuilt; on any failure the previous stages stay in place and the
    /// previous activity resumes.
    pub fn update_config(&self, config: SystemConfig) -> Result<()> {
        config.validate()?;
        let inner = &self.inner;
        let _control = lock(&inner.control);

        let previous = inner.state();
        let was_active = matches!(previous, SystemState::Running | SystemState::Paused);
        let initialized = inner.current_stages().is_some();
        if previous == SystemState::Running {
            inner.set_paused(true);
            inner.set_state(SystemState::Paused);
        }
        if was_active {
            inner.halt();
        }

        let result = if initialized {
            self.rebuild(&config)
        } else {
            Ok(())
        };

        match &result {
            Ok(()) => {
                *inner.config.write().unwrap_or_else(|e| e.into_inner()) = config;
                tracing::info!(parent: &inner.span, "Configuration updated");
            }
            Err(e) => tracing::error!(parent: &inner.span, "Configuration update failed: {:#}", e),
        }

        if was_active {
            if let Err(e) = inner.activate(previous == SystemState::Paused, true) {
                inner.halt();
                inner.set_state(SystemState::Error);
                return Err(e.context("Failed to resume after configuration update"));
            }
            inner.set_state(previous);
        }
        result
    }

    /// Build replacements for everything `config` changes, then install them
    /// all at once
    fn rebuild(&self, config: &SystemConfig) -> Result<()> {
        let inner = &self.inner;
        let old = inner.config();

        let video_changed = config.video != old.video || config.camera != old.camera;
        let new_video = if video_changed {
            Some(inner.open_video(config)?)
        } else {
            None
        };
        let fps = match &new_video {
            Some(v) => v.properties().map(|p| p.fps).unwrap_or(crate::video::DEFAULT_FPS),
            None => inner.video_fps(),
        };
        let mut stages = inner.build_stages(config, fps)?;

        let pool_changed = config.pipeline.workers != old.pipeline.workers
            || config.pipeline.queue_depth != old.pipeline.queue_depth;
        let new_pool = if pool_changed {
            Some(WorkerPool::new(
                config.pipeline.workers,
                config.pipeline.queue_depth,
            )?)
        } else {
            None
        };

        // Threshold-only changes keep the live tracks and their ids
        let keep_tracks = !video_changed
            && config.tracker.iou_threshold == old.tracker.iou_threshold
            && config.behavior.trajectory_history_length
                == old.behavior.trajectory_history_length;
        if keep_tracks {
            if let Some(current) = inner.current_stages() {
                let tracker = stages.tracker.get_mut().unwrap_or_else(|e| e.into_inner());
                std::mem::swap(tracker, &mut *lock(&current.tracker));
                tracker.set_max_age(config.tracker.max_age);
                tracker.set_min_hits(config.tracker.min_hits);
            }
        }

        *inner.stages.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(stages));
        if let Some(video) = new_video {
            *lock(&inner.video) = Some(video);
        }
        if let Some(pool) = new_pool {
            *inner.pool.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(pool);
        }
        Ok(())
    }

    /// Tear down and rebuild with the current configuration, restarting if
    /// the system was running
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = lock(&inner.control);
        let was_running = inner.state() == SystemState::Running;

        if inner.state() != SystemState::Stopped {
            inner.set_state(SystemState::Stopped);
        }
        inner.halt();
        *lock(&inner.last_results) = Vec::new();
        *lock(&inner.performance) = SystemPerformance::default();

        inner.set_state(SystemState::Initializing);
        let config = inner.config();
        if let Err(e) = inner.initialize_all(&config) {
            inner.set_state(SystemState::Error);
            return Err(e);
        }
        inner.set_state(SystemState::Stopped);

        if was_running {
            if let Err(e) = inner.activate(false, false) {
                inner.halt();
                return Err(e);
            }
            inner.set_state(SystemState::Running);
        }
        Ok(())
    }

    /// Stop and flush result outputs
    pub fn shutdown(&self) -> Result<()> {
        self.stop()?;
        if let Some(stages) = self.inner.current_stages() {
            lock(&stages.sink).finish()?;
        }
        Ok(())
    }

    pub fn state(&self) -> SystemState {
        self.inner.state()
    }

    pub fn config(&self) -> SystemConfig {
        self.inner.config()
    }

    pub fn register_state_callback(&self, callback: StateCallback) {
        *lock(&self.inner.state_callback) = Some(callback);
    }

    pub fn register_result_callback(&self, callback: ResultCallback) {
        *lock(&self.inner.result_callback) = Some(callback);
    }

    pub fn performance(&self) -> SystemPerformance {
        *lock(&self.inner.performance)
    }

    pub fn last_results(&self) -> Vec<BehaviorAnalysis> {
        lock(&self.inner.last_results).clone()
    }

    /// Every live track, confirmed or not
    pub fn tracks(&self) -> Vec<TrackedObject> {
        let Some(stages) = self.inner.current_stages() else {
            return Vec::new();
        };
        let tracker = lock(&stages.tracker);
        tracker.tracks().to_vec()
    }

    pub fn processed_frame(&self) -> Option<Mat> {
        let stages = self.inner.current_stages()?;
        let sink = lock(&stages.sink);
        sink.processed_frame()
    }

    pub fn save_results(&self, path: &Path) -> Result<()> {
        let stages = self
            .inner
            .current_stages()
            .ok_or_else(|| anyhow!("System is not initialized"))?;
        let sink = lock(&stages.sink);
        sink.save_results(path)
    }

    /// Clamped to `[0, vehicle.max_speed]`
    pub fn set_vehicle_speed(&self, kmh: f32) {
        let kmh = kmh.min(self.inner.config().vehicle.max_speed).max(0.0);
        *lock(&self.inner.vehicle_speed) = kmh;
        if let Some(stages) = self.inner.current_stages() {
            lock(&stages.analyzer).set_vehicle_speed(kmh);
            if let Some(enhancer) = &stages.enhancer {
                lock(enhancer).set_vehicle_speed(kmh);
            }
        }
    }

    pub fn vehicle_speed(&self) -> f32 {
        *lock(&self.inner.vehicle_speed)
    }

    /// True once a file source has been read to the end
    pub fn source_finished(&self) -> bool {
        lock(&self.inner.video)
            .as_ref()
            .map(|v| v.is_finished())
            .unwrap_or(false)
    }

    /// Frames queued or being processed
    pub fn in_flight(&self) -> usize {
        self.inner.current_pool().in_flight()
    }
}

impl Drop for PerceptionSystem {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
