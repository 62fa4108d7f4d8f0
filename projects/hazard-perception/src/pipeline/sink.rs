use crate::config::OutputConfig;
use crate::pipeline::types::{BehaviorAnalysis, RiskLevel};
use anyhow::{Context, Result};
use opencv::core::{Mat, Point, Rect, Scalar, Size, Vector};
use opencv::imgproc::{polylines, put_text, rectangle, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const TRAIL_LENGTH: usize = 30;

pub trait ResultSink: Send {
    fn process(&mut self, analyses: &[BehaviorAnalysis], frame: &Mat, timestamp: u64)
        -> Result<()>;

    /// Last annotated frame, if any
    fn processed_frame(&self) -> Option<Mat>;

    /// Write the most recent analyses to `path` as JSON
    fn save_results(&self, path: &Path) -> Result<()>;

    /// Flush and close any open outputs
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct FrameRecord<'a> {
    timestamp: u64,
    objects: &'a [BehaviorAnalysis],
}

/// Streams a JSON array one record at a time so the file is valid once closed
struct ResultsFile {
    path: PathBuf,
    out: BufWriter<File>,
    records: usize,
}

impl ResultsFile {
    fn create(path: PathBuf) -> Result<Self> {
        let mut out = BufWriter::new(
            File::create(&path).with_context(|| format!("Failed to create {:?}", path))?,
        );
        out.write_all(b"[\n")?;
        Ok(Self {
            path,
            out,
            records: 0,
        })
    }

    fn append(&mut self, record: &FrameRecord<'_>) -> Result<()> {
        if self.records > 0 {
            self.out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.out, record)?;
        self.records += 1;
        Ok(())
    }

    fn close(mut self) -> Result<PathBuf> {
        self.out.write_all(b"\n]\n")?;
        self.out.flush()?;
        Ok(self.path)
    }
}

fn risk_color(level: RiskLevel) -> Scalar {
    // BGR
    match level {
        RiskLevel::Safe => Scalar::new(0.0, 200.0, 0.0, 0.0),
        RiskLevel::Low => Scalar::new(0.0, 255.0, 255.0, 0.0),
        RiskLevel::Medium => Scalar::new(0.0, 165.0, 255.0, 0.0),
        RiskLevel::High => Scalar::new(0.0, 0.0, 255.0, 0.0),
        RiskLevel::Critical => Scalar::new(255.0, 0.0, 255.0, 0.0),
    }
}

/// Draws risk overlays and persists per-frame results and video
pub struct OverlaySink {
    config: OutputConfig,
    fps: f64,
    session: String,
    results_file: Option<ResultsFile>,
    writer: Option<VideoWriter>,
    trails: HashMap<u64, VecDeque<Point>>,
    last_frame: Option<Mat>,
    last_results: Vec<BehaviorAnalysis>,
}

impl OverlaySink {
    pub fn new(config: &OutputConfig, fps: f64) -> Result<Self> {
        let session = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let results_file = if config.save_results {
            let dir = PathBuf::from(&config.results_path);
            fs::create_dir_all(&dir)?;
            let file = ResultsFile::create(dir.join(format!("results_{}.json", session)))?;
            tracing::info!("Writing results to {:?}", file.path);
            Some(file)
        } else {
            None
        };
        if config.save_video {
            fs::create_dir_all(&config.video_path)?;
        }

        Ok(Self {
            config: config.clone(),
            fps: if fps > 0.0 { fps } else { 30.0 },
            session,
            results_file,
            writer: None,
            trails: HashMap::new(),
            last_frame: None,
            last_results: Vec::new(),
        })
    }

    fn open_writer(&self, size: Size) -> Result<VideoWriter> {
        let path = Path::new(&self.config.video_path)
            .join(format!("output_{}.mp4", self.session));
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, self.fps, size, true)?;
        if !writer.is_opened()? {
            anyhow::bail!("Failed to open video writer at {:?}", path);
        }
        tracing::info!("Recording annotated video to {:?}", path);
        Ok(writer)
    }

    fn update_trails(&mut self, analyses: &[BehaviorAnalysis]) {
        self.trails
            .retain(|id, _| analyses.iter().any(|a| a.track_id == *id));
        for a in analyses {
            let trail = self.trails.entry(a.track_id).or_default();
            trail.push_back(Point::new(a.location.x as i32, a.location.y as i32));
            while trail.len() > TRAIL_LENGTH {
                trail.pop_front();
            }
        }
    }

    fn draw(&self, canvas: &mut Mat, analyses: &[BehaviorAnalysis]) -> Result<()> {
        for a in analyses {
            let color = risk_color(a.risk_level);

            if self.config.draw_bboxes {
                let rect = Rect::new(
                    a.bbox.x as i32,
                    a.bbox.y as i32,
                    a.bbox.w as i32,
                    a.bbox.h as i32,
                );
                rectangle(canvas, rect, color, 2, LINE_8, 0)?;
            }

            if self.config.draw_labels {
                let x = a.bbox.x as i32;
                let y = (a.bbox.y as i32 - 8).max(12);
                let label = format!(
                    "#{} {} {}",
                    a.track_id,
                    a.behavior_name,
                    a.risk_level.label()
                );
                put_text(
                    canvas,
                    &label,
                    Point::new(x, y),
                    FONT_HERSHEY_SIMPLEX,
                    0.45,
                    color,
                    1,
                    LINE_8,
                    false,
                )?;

                let mut metrics = format!("{:.1}m", a.distance_to_vehicle);
                if a.has_collision_course() {
                    metrics.push_str(&format!(" TTC {:.1}s", a.time_to_collision));
                }
                let below = Point::new(x, (a.bbox.y + a.bbox.h) as i32 + 14);
                put_text(
                    canvas,
                    &metrics,
                    below,
                    FONT_HERSHEY_SIMPLEX,
                    0.45,
                    color,
                    1,
                    LINE_8,
                    false,
                )?;
            }

            if self.config.draw_trails {
                if let Some(trail) = self.trails.get(&a.track_id) {
                    if trail.len() >= 2 {
                        let mut contours = Vector::<Vector<Point>>::new();
                        contours.push(trail.iter().copied().collect());
                        polylines(canvas, &contours, false, color, 1, LINE_8, 0)?;
                    }
                }
            }
        }

        self.draw_statistics(canvas, analyses)
    }

    fn draw_statistics(&self, canvas: &mut Mat, analyses: &[BehaviorAnalysis]) -> Result<()> {
        let mut y = 20;
        let header = format!("Objects: {}", analyses.len());
        put_text(
            canvas,
            &header,
            Point::new(10, y),
            FONT_HERSHEY_SIMPLEX,
            0.5,
            Scalar::all(255.0),
            1,
            LINE_8,
            false,
        )?;

        for level in RiskLevel::ALL.iter().rev() {
            let count = analyses.iter().filter(|a| a.risk_level == *level).count();
            if count == 0 {
                continue;
            }
            y += 18;
            let line = format!("{}: {}", level.label(), count);
            put_text(
                canvas,
                &line,
                Point::new(10, y),
                FONT_HERSHEY_SIMPLEX,
                0.5,
                risk_color(*level),
                1,
                LINE_8,
                false,
            )?;
        }
        Ok(())
    }
}

impl ResultSink for OverlaySink {
    fn process(
        &mut self,
        analyses: &[BehaviorAnalysis],
        frame: &Mat,
        timestamp: u64,
    ) -> Result<()> {
        if frame.empty() {
            anyhow::bail!("Empty frame at {}", timestamp);
        }

        self.update_trails(analyses);
        let mut canvas = frame.clone();
        self.draw(&mut canvas, analyses)?;

        if self.config.save_video {
            if self.writer.is_none() {
                self.writer = Some(self.open_writer(canvas.size()?)?);
            }
            if let Some(writer) = self.writer.as_mut() {
                writer.write(&canvas)?;
            }
        }

        if let Some(file) = self.results_file.as_mut() {
            file.append(&FrameRecord {
                timestamp,
                objects: analyses,
            })?;
        }

        self.last_frame = Some(canvas);
        self.last_results = analyses.to_vec();
        Ok(())
    }

    fn processed_frame(&self) -> Option<Mat> {
        self.last_frame.clone()
    }

    fn save_results(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.last_results)?;
        fs::write(path, json).with_context(|| format!("Failed to write results to {:?}", path))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.release()?;
        }
        if let Some(file) = self.results_file.take() {
            let records = file.records;
            let path = file.close()?;
            tracing::info!("Saved {} frame records to {:?}", records, path);
        }
        Ok(())
    }
}

impl Drop for OverlaySink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("Failed to finalize result outputs: {}", e);
        }
    }
}
