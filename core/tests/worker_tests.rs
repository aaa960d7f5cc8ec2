//! The threaded runtime: frames in, estimates out, cooperative stop, pause on `Lost`.
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;

use locator::features::{Deadline, FeatureExtractor, Frame, GrayImage, Observations};
use locator::sim::{LinearTrack, SpotRenderer};
use locator::worker::EngineWorker;
use locator::{
    ControlInput, Diagnostic, FilterConfig, FilterEngine, Observation, PriorRegion, TrackingState,
};

const WAIT: Duration = Duration::from_secs(5);

/// Reports a landmark nowhere: every weighting collapses.
struct UnreachableLandmark;

impl FeatureExtractor for UnreachableLandmark {
    fn extract<'a>(&'a self, _image: &'a GrayImage, timestamp: f64, _deadline: Deadline) -> Observations<'a> {
        let observation = Observation::planar(f64::INFINITY, f64::INFINITY, timestamp);
        Box::new(std::iter::once(Ok(observation)))
    }
}

fn blank_frame(timestamp: f64) -> Frame {
    Frame::new(vec![0; 64], 8, 8, 1, timestamp)
}

#[test]
fn test_worker_tracks_rendered_frames() {
    let track = LinearTrack {
        frames: 15,
        ..LinearTrack::default()
    };
    let renderer = SpotRenderer {
        calibration: track.fit_calibration(128, 128, 16.0),
        ..SpotRenderer::default()
    };
    let config = FilterConfig {
        particle_count: 300,
        calibration: renderer.calibration,
        ..FilterConfig::default()
    };
    let mut engine = FilterEngine::new(config).unwrap();
    engine.initialize(PriorRegion::square(0.0, 0.0, 4.0), 300).unwrap();
    let worker = EngineWorker::spawn(engine).unwrap();
    assert!(worker.is_running());

    let mut rng = StdRng::seed_from_u64(9);
    let mut truth = Vector3::zeros();
    for step in track.steps(&mut rng) {
        worker.submit_control(step.control);
        worker.submit_frame(renderer.render(&step.truth, step.timestamp, &mut rng));
        let report = worker.reports().recv_timeout(WAIT).unwrap();
        assert_eq!(report.estimate.timestamp, step.timestamp);
        truth = step.truth;
    }

    let latest = worker.latest().unwrap();
    assert_eq!(latest.timestamp, 15.0);
    assert!(latest.planar_error(&truth) < 0.3);

    let engine = worker.stop().unwrap();
    assert_eq!(engine.state(), TrackingState::Uninitialized);
    assert!(engine.particles().is_none());
}

#[test]
fn test_controls_of_dropped_frames_are_applied() {
    let config = FilterConfig {
        particle_count: 50,
        process_noise_stddev: 0.0,
        ..FilterConfig::default()
    };
    let mut engine = FilterEngine::new(config).unwrap();
    engine.initialize(PriorRegion::square(0.0, 0.0, 1.0), 50).unwrap();
    let worker = EngineWorker::spawn(engine).unwrap();

    // Controls for three frames, but only the last frame is delivered.
    for k in 1..=3 {
        worker.submit_control(ControlInput::planar(1.0, 0.0, k as f64));
    }
    worker.submit_frame(blank_frame(3.0));
    let report = worker.reports().recv_timeout(WAIT).unwrap();
    assert!((report.estimate.position.x - 3.0).abs() < 1e-9);
    worker.stop().unwrap();
}

#[test]
fn test_lost_pauses_consumption_until_reset() {
    let config = FilterConfig {
        particle_count: 50,
        degenerate_frame_limit: 1,
        degenerate_retry_budget: 0,
        ..FilterConfig::default()
    };
    let mut engine = FilterEngine::with_extractor(config, Box::new(UnreachableLandmark)).unwrap();
    engine.initialize(PriorRegion::square(0.0, 0.0, 1.0), 50).unwrap();
    let worker = EngineWorker::spawn(engine).unwrap();

    worker.submit_frame(blank_frame(1.0));
    worker.submit_frame(blank_frame(2.0));
    let first = worker.reports().recv_timeout(WAIT).unwrap();
    assert_eq!(first.estimate.state, TrackingState::Tracking);
    let second = worker.reports().recv_timeout(WAIT).unwrap();
    assert_eq!(second.estimate.state, TrackingState::Lost);
    assert!(second
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::Lost { attempts: 0, .. })));

    worker.submit_frame(blank_frame(3.0));
    assert!(worker.reports().recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(worker.queue().len(), 1);
    assert_eq!(worker.latest().unwrap().state, TrackingState::Lost);

    // Stage motion from before the reset does not move the fresh prior.
    worker.submit_control(ControlInput::planar(5.0, 0.0, 2.5));
    worker.reset(PriorRegion::square(0.0, 0.0, 1.0), 50).unwrap();
    let resumed = worker.reports().recv_timeout(WAIT).unwrap();
    assert_eq!(resumed.estimate.timestamp, 3.0);
    assert_eq!(resumed.estimate.state, TrackingState::Tracking);
    assert!(resumed.estimate.position.x.abs() < 1e-9);
    assert_eq!(worker.latest().unwrap().timestamp, 3.0);

    let diagnostics: Vec<Diagnostic> = worker.diagnostics().try_iter().collect();
    assert!(diagnostics.iter().any(|d| matches!(d, Diagnostic::Degenerate { .. })));
    worker.stop().unwrap();
}

#[test]
fn test_full_queue_reports_drops() {
    let config = FilterConfig {
        particle_count: 10,
        frame_queue_capacity: 2,
        ..FilterConfig::default()
    };
    // Never initialized: the worker leaves frames queued.
    let engine = FilterEngine::new(config).unwrap();
    let worker = EngineWorker::spawn(engine).unwrap();
    assert!(worker.submit_frame(blank_frame(1.0)).is_none());
    assert!(worker.submit_frame(blank_frame(2.0)).is_none());
    let dropped = worker.submit_frame(blank_frame(3.0));
    assert!(matches!(
        dropped,
        Some(Diagnostic::FrameDropped { timestamp, dropped_total: 1 }) if timestamp == 1.0
    ));
    assert_eq!(worker.queue().dropped_total(), 1);
    let forwarded = worker.diagnostics().recv_timeout(WAIT).unwrap();
    assert_eq!(forwarded, dropped.unwrap());
    assert!(worker.latest().is_none());
    worker.stop().unwrap();
}
