//! Command-line interface for the fusion pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::pipeline::{Pipeline, PipelineInputs, Upload};
use crate::processors::detector::{Detector, GroundTruthDetector, HttpDetector, StaticDetector};

#[derive(Parser)]
#[command(name = "fusion-pipeline")]
#[command(about = "LIDAR and camera object fusion pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve POST /process over HTTP
    Serve {
        /// Address to bind, e.g. 127.0.0.1:8000
        #[arg(long)]
        bind: Option<String>,
        /// Replay detections from a JSON file instead of projecting labels
        #[arg(long)]
        detections: Option<PathBuf>,
        /// Model service URL for 2D detection
        #[arg(long)]
        detector_url: Option<String>,
    },

    /// Run the pipeline once on local files
    Process {
        /// Point cloud (.pcd, .ply, .bin, .csv)
        #[arg(long)]
        pcd: PathBuf,
        /// Camera image (PNG or JPEG)
        #[arg(long)]
        image: PathBuf,
        /// Calibration file
        #[arg(long)]
        calibration: PathBuf,
        /// KITTI label file
        #[arg(long)]
        labels: PathBuf,
        /// Replay detections from a JSON file instead of projecting labels
        #[arg(long)]
        detections: Option<PathBuf>,
        /// Model service URL for 2D detection
        #[arg(long)]
        detector_url: Option<String>,
        /// Write the JSON response here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the annotated image as PNG
        #[arg(long)]
        annotated: Option<PathBuf>,
    },

    /// Run DBSCAN on a point cloud and write per-point labels as CSV
    Cluster {
        /// Input point cloud
        cloud: PathBuf,
        /// Output directory for cluster results
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Neighborhood radius in meters
        #[arg(long)]
        eps: Option<f32>,
        /// Minimum neighbors for a core point
        #[arg(long)]
        min_points: Option<usize>,
        /// Maximum points to process
        #[arg(long)]
        max_points: Option<usize>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Serve {
            bind,
            detections,
            detector_url,
        } => {
            let mut config = config;
            if let Some(url) = detector_url {
                config.detector.endpoint = Some(url);
            }
            cmd_serve(config, bind, detections.as_deref())
        }
        Commands::Process {
            pcd,
            image,
            calibration,
            labels,
            detections,
            detector_url,
            output,
            annotated,
        } => {
            let mut config = config;
            if let Some(url) = detector_url {
                config.detector.endpoint = Some(url);
            }
            cmd_process(
                config,
                ProcessFiles {
                    pcd,
                    image,
                    calibration,
                    labels,
                },
                detections.as_deref(),
                output.as_deref(),
                annotated.as_deref(),
            )
        }
        Commands::Cluster {
            cloud,
            output_dir,
            eps,
            min_points,
            max_points,
        } => cmd_cluster(&cloud, output_dir, eps, min_points, max_points, config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

/// A detections file wins over a model service; with neither, labels are
/// projected.
fn build_detector(config: &PipelineConfig, detections: Option<&Path>) -> Result<Arc<dyn Detector>> {
    if let Some(path) = detections {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading detections {}", path.display()))?;
        let detector = StaticDetector::from_json(&text)
            .with_context(|| format!("parsing detections {}", path.display()))?;
        return Ok(Arc::new(detector));
    }
    if let Some(endpoint) = &config.detector.endpoint {
        let detector = HttpDetector::new(endpoint.as_str()).context("creating model service client")?;
        return Ok(Arc::new(detector));
    }
    Ok(Arc::new(GroundTruthDetector::new(
        config.fusion.class_names.clone(),
    )))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

fn cmd_serve(mut config: PipelineConfig, bind: Option<String>, detections: Option<&Path>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    config.validate().context("invalid configuration")?;
    let bind = config.server.bind.clone();
    let detector = build_detector(&config, detections)?;
    println!("Serving POST /process on {} (detector: {})", bind, detector.name());

    let pipeline = Arc::new(Pipeline::new(config, detector));
    runtime()?
        .block_on(crate::server::serve(pipeline, &bind))
        .with_context(|| format!("serving on {}", bind))
}

struct ProcessFiles {
    pcd: PathBuf,
    image: PathBuf,
    calibration: PathBuf,
    labels: PathBuf,
}

fn read_upload(path: &Path) -> Result<Upload> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file_name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
    Ok(Upload::new(file_name, bytes))
}

fn cmd_process(
    config: PipelineConfig,
    files: ProcessFiles,
    detections: Option<&Path>,
    output: Option<&Path>,
    annotated: Option<&Path>,
) -> Result<()> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    config.validate().context("invalid configuration")?;
    let start = Instant::now();
    let inputs = PipelineInputs {
        pcd: read_upload(&files.pcd)?,
        image: read_upload(&files.image)?,
        calibration: read_upload(&files.calibration)?,
        labels: read_upload(&files.labels)?,
    };
    let detector = build_detector(&config, detections)?;
    let pipeline = Pipeline::new(config, detector);

    let spinner = create_spinner("Running fusion pipeline...");
    let result = runtime()?.block_on(pipeline.run(inputs));
    spinner.finish_and_clear();

    let output_value = match result {
        Ok(out) => out,
        Err(e) => {
            match output {
                Some(path) => crate::core::writers::write_json(path, &e.to_json())?,
                None => println!("{}", serde_json::to_string_pretty(&e.to_json())?),
            }
            return Err(e).context("pipeline failed");
        }
    };

    if let Some(path) = annotated {
        let png = STANDARD
            .decode(&output_value.processed_image)
            .context("decoding annotated image")?;
        crate::core::writers::write_bytes(path, &png)?;
        info!("Annotated image -> {}", path.display());
    }

    match output {
        Some(path) => {
            crate::core::writers::write_json(path, &output_value.to_json())?;
            info!("Response JSON -> {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&output_value.to_json())?),
    }

    let summary = &output_value.summary;
    let eval = &output_value.evaluation;
    print_summary(
        "Fusion Complete",
        &[
            ("Point cloud", files.pcd.display().to_string()),
            ("Points", summary.points_received.to_string()),
            ("Clusters", summary.clusters.to_string()),
            ("Visible clusters", summary.visible_clusters.to_string()),
            ("Detections", summary.detections.to_string()),
            ("Fused objects", summary.fused_objects.to_string()),
            ("Labels matched", format!("{}/{}", eval.matched, eval.label_count)),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_cluster(
    cloud: &Path,
    output_dir: Option<PathBuf>,
    eps: Option<f32>,
    min_points: Option<usize>,
    max_points: Option<usize>,
    mut config: PipelineConfig,
) -> Result<()> {
    use crate::processors::clustering;

    let start = Instant::now();

    if let Some(eps) = eps {
        config.clustering.eps = eps;
    }
    if let Some(min_points) = min_points {
        config.clustering.min_points = min_points;
    }
    if let Some(max_points) = max_points {
        config.preprocessing.max_points = max_points;
    }

    config.validate().context("invalid configuration")?;

    let effective_output_dir = output_dir
        .unwrap_or_else(|| cloud.parent().unwrap_or(Path::new(".")).to_path_buf());

    println!("Running DBSCAN clustering...");
    println!("Input: {}", cloud.display());
    println!("Output directory: {}", effective_output_dir.display());
    println!("Parameters:");
    println!("  eps: {}", config.clustering.eps);
    println!("  min_points: {}", config.clustering.min_points);
    println!("  max_points: {}", config.preprocessing.max_points);

    let spinner = create_spinner("Clustering point cloud...");
    let result = clustering::process_cloud_clustering(
        cloud,
        Some(&effective_output_dir),
        &config.preprocessing,
        &config.clustering,
    );
    spinner.finish_and_clear();

    let (csv_path, result) = result
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("clustering {}", cloud.display()))?;

    print_summary(
        "Clustering Complete",
        &[
            ("Input file", cloud.display().to_string()),
            ("Output CSV", csv_path.display().to_string()),
            ("Points processed", result.labels.len().to_string()),
            ("Clusters found", result.clusters.len().to_string()),
            ("Noise points", result.noise.len().to_string()),
            ("eps", config.clustering.eps.to_string()),
            ("min_points", config.clustering.min_points.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_blobs(dir: &Path) -> PathBuf {
        let path = dir.join("scan.csv");
        let mut text = String::from("x,y,z\n");
        for base in [0.0f32, 20.0] {
            for k in 0..6 {
                text.push_str(&format!("{},{},1.0\n", base + 0.1 * k as f32, base));
            }
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_cmd_cluster_writes_labels() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = write_blobs(dir.path());
        let out_dir = dir.path().join("out");

        cmd_cluster(&cloud, Some(out_dir.clone()), Some(0.5), Some(3), None, PipelineConfig::default()).unwrap();

        let written = std::fs::read_to_string(out_dir.join("scan_dbscan_labels.csv")).unwrap();
        assert_eq!(written.lines().count(), 13);
    }

    #[test]
    fn test_cmd_cluster_reports_loader_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pcd");

        let err = cmd_cluster(&missing, None, None, None, None, PipelineConfig::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.pcd"));
    }

    #[test]
    fn test_cmd_cluster_rejects_invalid_override() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = write_blobs(dir.path());

        let err = cmd_cluster(&cloud, None, Some(-1.0), None, None, PipelineConfig::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("clustering.eps"));
    }

    #[test]
    fn test_build_detector_precedence() {
        let mut config = PipelineConfig::default();
        assert_eq!(build_detector(&config, None).unwrap().name(), "ground-truth");

        config.detector.endpoint = Some("http://127.0.0.1:9/detect".into());
        assert_eq!(build_detector(&config, None).unwrap().name(), "http");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.json");
        std::fs::write(&path, "[]").unwrap();
        assert_eq!(build_detector(&config, Some(&path)).unwrap().name(), "static");
    }

    #[test]
    fn test_parse_detector_url_flag() {
        let cli = Cli::try_parse_from([
            "fusion-pipeline",
            "serve",
            "--detector-url",
            "http://127.0.0.1:9000/detect",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { detector_url, .. } => {
                assert_eq!(detector_url.as_deref(), Some("http://127.0.0.1:9000/detect"));
            }
            _ => panic!("expected serve"),
        }
    }
}
