use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use spatial_slam::io::{CircularTrajectory, SyntheticScene};
use spatial_slam::system::{SlamConfig, SlamSystem};
use spatial_slam::tracking::SystemState;
use spatial_slam::tracking::frame::{CameraModel, ImageView};
use spatial_slam::vocabulary::Vocabulary;

/// Usage: `spatial_slam [config.yaml] [laps] [output.map]`
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => SlamConfig::from_yaml_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        _ => SlamConfig::default(),
    };
    let laps: usize = match args.next() {
        Some(laps) => laps.parse().with_context(|| format!("invalid lap count '{laps}'"))?,
        None => 1,
    };
    let output = args.next();

    let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
    let scene = SyntheticScene::cylinder(camera.clone(), 4.0, 3.0, 0.2, config.random_seed);
    let trajectory = CircularTrajectory::default();
    let vocabulary = Arc::new(Vocabulary::synthetic(10, 4, config.random_seed));

    println!(
        "Synthetic sequence: {} landmarks, {} frames per lap, {} lap(s)",
        scene.points().len(),
        trajectory.frames_per_lap,
        laps
    );

    let mut slam = SlamSystem::create(config, camera.clone(), vocabulary)
        .context("creating SLAM system")?;
    slam.set_state_callback(Some(|prev: SystemState, next: SystemState| println!("  state: {prev} -> {next}")));

    let num_frames = trajectory.frames_per_lap * laps + 1;
    let mut tracked = 0usize;
    for i in 0..num_frames {
        let truth = trajectory.pose(i);
        let pixels = scene.render(&truth);
        let image = ImageView::new(&pixels, camera.width, camera.height, 1);

        match slam.process_frame(&image, trajectory.timestamp(i)) {
            Ok(Some(_)) => tracked += 1,
            Ok(None) => {}
            Err(e) => tracing::debug!("frame {}: {}", i, e),
        }

        if i % 60 == 0 {
            let stats = slam.stats();
            println!(
                "Frame {}/{}: state={} KFs={} landmarks={} features={} matched={} quality={} ({:.1} ms)",
                i,
                num_frames,
                slam.state(),
                stats.total_keyframes,
                stats.total_landmarks,
                stats.feature_count,
                stats.matched_count,
                stats.quality.as_str(),
                stats.processing_time_ms
            );
        }
    }

    let stats = slam.stats();
    let info = slam.map_info();
    let (memory_mb, peak_mb) = slam.memory_usage();
    println!("Done! Tracked {tracked}/{num_frames} frames");
    println!(
        "  map '{}': {} keyframes, {} landmarks, version {}",
        info.map_id, info.num_keyframes, info.num_landmarks, info.version
    );
    println!(
        "  loops={} relocalizations={} losses={} avg confidence={:.2}",
        stats.loop_closure_count,
        stats.relocalization_count,
        stats.tracking_loss_count,
        stats.avg_tracking_confidence
    );
    println!("  memory {memory_mb:.1} MB (peak {peak_mb:.1} MB)");

    if let Some(path) = output {
        let bytes = slam
            .save_map(&path)
            .with_context(|| format!("saving map to {path}"))?;
        println!("  saved {bytes} bytes to {path}");
    }

    // Shutdown cleanly (joins the mapping worker)
    slam.shutdown();
    Ok(())
}
