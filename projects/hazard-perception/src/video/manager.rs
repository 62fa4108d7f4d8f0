// Video source manager
//
// Owns the capture handle and a producer thread that pushes preprocessed
// frames into a registered callback, paced to the source rate for files.

use super::connection::connect_with_retry;
use super::opencv_reader::OpencvReader;
use super::preprocess::{crop_roi, Undistorter};
use super::{VideoProperties, VideoReader};
use crate::config::{CameraParams, RoiRect, VideoSourceConfig};
use anyhow::{anyhow, bail, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::Span;

/// Delay before re-reading a live source after a failed read
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(10);

pub type FrameCallback = Arc<dyn Fn(Mat, u64) + Send + Sync>;
pub type SourceOpener =
    Arc<dyn Fn(&VideoSourceConfig) -> Result<Box<dyn VideoReader>> + Send + Sync>;

#[derive(Default)]
struct Preprocess {
    roi: Option<RoiRect>,
    undistorter: Option<Undistorter>,
}

impl Preprocess {
    fn apply(&self, frame: Mat) -> Result<Mat> {
        let frame = match &self.undistorter {
            Some(u) => u.apply(&frame)?,
            None => frame,
        };
        match &self.roi {
            Some(roi) => crop_roi(&frame, roi),
            None => Ok(frame),
        }
    }
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    reader: Mutex<Option<Box<dyn VideoReader>>>,
    callback: Mutex<Option<FrameCallback>>,
    preprocess: Mutex<Preprocess>,
    epoch: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn timestamp_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

pub struct VideoSourceManager {
    config: VideoSourceConfig,
    camera: CameraParams,
    opener: SourceOpener,
    properties: Option<VideoProperties>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    span: Span,
}

impl VideoSourceManager {
    pub fn new(config: &VideoSourceConfig, camera: &CameraParams, span: Span) -> Self {
        let opener: SourceOpener = Arc::new(|config: &VideoSourceConfig| {
            Ok(Box::new(OpencvReader::open(config)?) as Box<dyn VideoReader>)
        });
        Self::with_opener(config, camera, opener, span)
    }

    pub fn with_opener(
        config: &VideoSourceConfig,
        camera: &CameraParams,
        opener: SourceOpener,
        span: Span,
    ) -> Self {
        Self {
            config: config.clone(),
            camera: camera.clone(),
            opener,
            properties: None,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                reader: Mutex::new(None),
                callback: Mutex::new(None),
                preprocess: Mutex::new(Preprocess::default()),
                epoch: Instant::now(),
            }),
            handle: None,
            span,
        }
    }

    /// Connect to the configured source under its retry policy
    pub fn initialize(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.stop();

        let policy = self.config.connection_policy();
        let opener = self.opener.clone();
        let config = self.config.clone();
        tracing::info!(source = %config.source, "Connecting to video source");
        let reader = connect_with_retry(&policy, |_| opener(&config))?;

        let properties = reader.properties();
        *lock(&self.shared.reader) = Some(reader);
        self.properties = Some(properties);
        self.shared.finished.store(false, Ordering::SeqCst);

        if self.config.enable_roi {
            self.set_roi(Some(self.config.roi));
        }
        if self.config.correct_distortion {
            self.set_distortion_correction(true);
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.shared.reader).is_some()
    }

    pub fn register_frame_callback(&self, callback: FrameCallback) {
        *lock(&self.shared.callback) = Some(callback);
    }

    /// Start the producer thread. A no-op while it is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let properties = self
            .properties
            .ok_or_else(|| anyhow!("Video source is not initialized"))?;
        if self.shared.finished.load(Ordering::SeqCst) {
            bail!("Video source has reached the end of the file");
        }

        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let span = self.span.clone();
        let handle = thread::Builder::new()
            .name("video-producer".to_string())
            .spawn(move || {
                let _enter = span.enter();
                produce(&shared, properties);
            });
        match handle {
            Ok(h) => {
                self.handle = Some(h);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the producer and wait for it to exit. The device stays open.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(parent: &self.span, "Video producer thread panicked");
            }
        }
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// True once a file source has delivered its last frame
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub fn properties(&self) -> Option<VideoProperties> {
        self.properties
    }

    pub fn set_roi(&self, roi: Option<RoiRect>) {
        let roi = roi.filter(|r| r.width > 0 && r.height > 0);
        lock(&self.shared.preprocess).roi = roi;
    }

    pub fn roi(&self) -> Option<RoiRect> {
        lock(&self.shared.preprocess).roi
    }

    /// Returns whether correction is now active. Enabling needs intrinsics.
    pub fn set_distortion_correction(&self, enable: bool) -> bool {
        let mut preprocess = lock(&self.shared.preprocess);
        if !enable {
            preprocess.undistorter = None;
            return false;
        }
        match Undistorter::new(&self.camera) {
            Ok(u) => {
                preprocess.undistorter = Some(u);
                true
            }
            Err(e) => {
                tracing::warn!(parent: &self.span, "Distortion correction unavailable: {}", e);
                false
            }
        }
    }

    pub fn is_distortion_correction_enabled(&self) -> bool {
        lock(&self.shared.preprocess).undistorter.is_some()
    }

    /// Jump to `seconds` into a file source
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let properties = self
            .properties
            .ok_or_else(|| anyhow!("Video source is not initialized"))?;
        if properties.is_stream {
            bail!("Cannot seek in a live stream");
        }
        let frame = (seconds.max(0.0) * properties.fps).round() as usize;
        let mut reader = lock(&self.shared.reader);
        let reader = reader
            .as_mut()
            .ok_or_else(|| anyhow!("Video source is not initialized"))?;
        reader.seek_to_frame(frame)?;
        self.shared.finished.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Milliseconds on the same monotonic clock used to stamp frames
    pub fn current_timestamp(&self) -> u64 {
        self.shared.timestamp_ms()
    }
}

impl Drop for VideoSourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(shared: &Shared, properties: VideoProperties) {
    let frame_interval = Duration::from_secs_f64(1.0 / properties.fps.max(1.0));
    let mut delivered: u64 = 0;
    tracing::info!(stream = properties.is_stream, "Video producer started");

    while shared.running.load(Ordering::SeqCst) {
        let iteration = Instant::now();

        if shared.paused.load(Ordering::SeqCst) {
            if properties.is_stream {
                // Keep consuming so resume picks up the live position
                if let Some(reader) = lock(&shared.reader).as_mut() {
                    let _ = reader.read_frame();
                }
            }
            thread::sleep(PAUSE_POLL);
            continue;
        }

        let read = match lock(&shared.reader).as_mut() {
            Some(reader) => reader.read_frame(),
            None => Err(anyhow!("Video source is closed")),
        };

        let frame = match read {
            Ok(frame) => frame,
            Err(e) if properties.is_stream => {
                tracing::debug!("Stream read failed, retrying: {}", e);
                thread::sleep(STREAM_RETRY_DELAY);
                continue;
            }
            Err(_) => {
                tracing::info!(delivered, "End of video file");
                shared.finished.store(true, Ordering::SeqCst);
                break;
            }
        };

        // Empty frames still hold their slot in the file's pacing
        if frame.empty() {
            tracing::trace!("Skipping empty frame");
        } else {
            let processed = lock(&shared.preprocess).apply(frame);
            match processed {
                Ok(frame) => {
                    let callback = lock(&shared.callback).clone();
                    if let Some(callback) = callback {
                        callback(frame, shared.timestamp_ms());
                    }
                    delivered += 1;
                }
                Err(e) => tracing::warn!("Frame preprocessing failed: {}", e),
            }
        }

        if !properties.is_stream {
            if let Some(remaining) = frame_interval.checked_sub(iteration.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    tracing::info!(delivered, "Video producer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::AtomicUsize;

    /// Scripted source: `None` entries are read failures
    struct ScriptedReader {
        script: Vec<Option<Mat>>,
        cursor: usize,
        properties: VideoProperties,
        repeat: bool,
    }

    impl VideoReader for ScriptedReader {
        fn properties(&self) -> VideoProperties {
            self.properties
        }

        fn read_frame(&mut self) -> Result<Mat> {
            if self.cursor >= self.script.len() {
                if !self.repeat {
                    bail!("end of script");
                }
                self.cursor = 0;
            }
            let step = self.script[self.cursor].clone();
            self.cursor += 1;
            step.ok_or_else(|| anyhow!("read failed"))
        }

        fn seek_to_frame(&mut self, frame_num: usize) -> Result<()> {
            self.cursor = frame_num;
            Ok(())
        }
    }

    fn frame(value: f64) -> Mat {
        Mat::new_rows_cols_with_default(8, 8, CV_8UC3, Scalar::all(value)).unwrap()
    }

    fn properties(fps: f64, is_stream: bool) -> VideoProperties {
        VideoProperties {
            width: 8,
            height: 8,
            fps,
            frame_count: if is_stream { -1 } else { 10 },
            is_stream,
        }
    }

    fn manager_for(
        script: Vec<Option<Mat>>,
        props: VideoProperties,
        repeat: bool,
    ) -> VideoSourceManager {
        let script = Mutex::new(script);
        let opener: SourceOpener = Arc::new(move |_config: &VideoSourceConfig| {
            Ok(Box::new(ScriptedReader {
                script: script.lock().unwrap().clone(),
                cursor: 0,
                properties: props,
                repeat,
            }) as Box<dyn VideoReader>)
        });
        VideoSourceManager::with_opener(
            &VideoSourceConfig::default(),
            &CameraParams::default(),
            opener,
            Span::none(),
        )
    }

    fn collect_into(manager: &VideoSourceManager) -> Arc<Mutex<Vec<(Mat, u64)>>> {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        manager.register_frame_callback(Arc::new(move |mat, ts| {
            sink.lock().unwrap().push((mat, ts));
        }));
        frames
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_file_source_delivers_paced_frames_then_finishes() {
        let script = (0..10).map(|i| Some(frame(i as f64))).collect();
        let mut manager = manager_for(script, properties(100.0, false), false);
        manager.initialize().unwrap();
        let frames = collect_into(&manager);

        let started = Instant::now();
        manager.start().unwrap();
        assert!(wait_until(|| manager.is_finished()));
        let elapsed = started.elapsed();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 10);
        assert!(frames.windows(2).all(|w| w[0].1 <= w[1].1));
        // 10 frames at 100 fps
        assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);
        assert!(!manager.is_running());
        assert!(manager.start().is_err());
    }

    #[test]
    fn test_stream_read_failures_are_retried() {
        let script = vec![Some(frame(1.0)), None, Some(frame(2.0))];
        let mut manager = manager_for(script, properties(30.0, true), true);
        manager.initialize().unwrap();
        let frames = collect_into(&manager);

        manager.start().unwrap();
        assert!(wait_until(|| frames.lock().unwrap().len() >= 4));
        assert!(manager.is_running());
        assert!(!manager.is_finished());
        manager.stop();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let script = vec![Some(Mat::default()), Some(frame(1.0)), Some(Mat::default())];
        let mut manager = manager_for(script, properties(1000.0, false), false);
        manager.initialize().unwrap();
        let frames = collect_into(&manager);
        manager.start().unwrap();
        assert!(wait_until(|| manager.is_finished()));
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_frames_keep_file_pacing() {
        let mut script = vec![Some(Mat::default()); 5];
        script.push(Some(frame(1.0)));
        let mut manager = manager_for(script, properties(100.0, false), false);
        manager.initialize().unwrap();
        let frames = collect_into(&manager);

        let started = Instant::now();
        manager.start().unwrap();
        assert!(wait_until(|| manager.is_finished()));
        assert_eq!(frames.lock().unwrap().len(), 1);
        // Six 10 ms slots, five of them empty
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pause_halts_delivery() {
        let script = vec![Some(frame(1.0))];
        let mut manager = manager_for(script, properties(200.0, false), true);
        manager.initialize().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        manager.register_frame_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.start().unwrap();
        assert!(wait_until(|| count.load(Ordering::SeqCst) >= 2));
        manager.pause();
        thread::sleep(Duration::from_millis(30));
        let paused_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        manager.resume();
        assert!(wait_until(|| count.load(Ordering::SeqCst) > paused_at));
        manager.stop();
    }

    #[test]
    fn test_roi_is_applied_and_clamped() {
        let script = vec![Some(frame(1.0))];
        let mut manager = manager_for(script, properties(1000.0, false), false);
        manager.initialize().unwrap();
        manager.set_roi(Some(RoiRect {
            x: 6,
            y: 4,
            width: 100,
            height: 100,
        }));
        let frames = collect_into(&manager);
        manager.start().unwrap();
        assert!(wait_until(|| manager.is_finished()));

        let frames = frames.lock().unwrap();
        assert_eq!(frames[0].0.cols(), 2);
        assert_eq!(frames[0].0.rows(), 4);
    }

    #[test]
    fn test_initialize_failure_without_waiting() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let opener: SourceOpener = Arc::new(move |_config: &VideoSourceConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Box<dyn VideoReader>, _>(anyhow!("camera unplugged"))
        });
        let config = VideoSourceConfig {
            wait_for_device: false,
            ..VideoSourceConfig::default()
        };
        let camera = CameraParams::default();
        let mut manager = VideoSourceManager::with_opener(&config, &camera, opener, Span::none());

        assert!(manager.initialize().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!manager.is_initialized());
        assert!(manager.start().is_err());
    }

    #[test]
    fn test_distortion_correction_needs_intrinsics() {
        let manager = manager_for(vec![], properties(30.0, false), false);
        assert!(!manager.set_distortion_correction(true));
        assert!(!manager.is_distortion_correction_enabled());
    }

    #[test]
    fn test_seek_rejected_for_streams() {
        let mut manager = manager_for(vec![Some(frame(1.0))], properties(30.0, true), true);
        assert!(manager.seek(1.0).is_err());
        manager.initialize().unwrap();
        assert!(manager.seek(1.0).is_err());

        let mut file = manager_for(vec![Some(frame(1.0))], properties(30.0, false), false);
        file.initialize().unwrap();
        assert!(file.seek(0.0).is_ok());
    }
}
