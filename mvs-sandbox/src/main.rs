use cds_mvsnet::{CdsMvsNet, DepthMode, MvsNetConfig, PlaneScene};
use log::*;
use ndarray::Array3;
use serde_json::json;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "mvs-sandbox",
    about = "A tool for running the cascaded MVS network on a synthetic plane"
)]
struct Opt {
    /// The file where network settings are specified.
    ///
    /// This is in the format of `cds_mvsnet::MvsNetConfig`. Missing fields use defaults.
    #[structopt(short, long)]
    settings: Option<PathBuf>,
    /// Overrides the depth mode of the settings (regression, classification or unification).
    #[structopt(short, long)]
    mode: Option<DepthMode>,
    /// Enables the depth refinement stage.
    #[structopt(long)]
    refine: bool,
    /// Height of the rendered images.
    #[structopt(long, default_value = "64")]
    height: usize,
    /// Width of the rendered images.
    #[structopt(long, default_value = "64")]
    width: usize,
    /// Number of views, the reference included.
    #[structopt(short, long, default_value = "3")]
    views: usize,
    /// Distance of the plane from the reference camera.
    #[structopt(long, default_value = "40.0")]
    plane_depth: f32,
    /// Also pass the ground-truth depth so the supervision outputs are produced.
    #[structopt(long)]
    ground_truth: bool,
    /// Output JSON file to write the per-stage summary to.
    ///
    /// If this is not provided, then the summary goes to stdout.
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(opt: &Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config: MvsNetConfig = match &opt.settings {
        Some(path) => {
            let config = serde_json::from_reader(std::fs::File::open(path)?)?;
            info!("loaded settings from {}", path.display());
            config
        }
        None => {
            info!("used default settings");
            MvsNetConfig::default()
        }
    };
    if let Some(mode) = opt.mode {
        config.depth_mode = mode;
    }
    config.refine |= opt.refine;

    let scene = PlaneScene::default()
        .with_size(opt.height, opt.width)
        .with_views(opt.views)
        .with_plane_depth(opt.plane_depth)
        .with_ground_truth(opt.ground_truth);
    let net = CdsMvsNet::new(config)?;
    let output = net.forward(&scene.input(&config)?)?;

    let stages: Vec<_> = output
        .stages
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            let (mean, error) = depth_stats(&stage.depth, scene.plane_depth);
            let confidence = stage.photometric_confidence.mean().unwrap_or(0.0);
            info!(
                "stage {}: mean depth {:.3}, mean absolute error {:.3}, mean confidence {:.3}",
                index, mean, error, confidence
            );
            json!({
                "stage": index,
                "resolution": [stage.depth.dim().1, stage.depth.dim().2],
                "hypotheses": stage.prob_volume.dim().1,
                "mean_depth": mean,
                "mean_absolute_error": error,
                "mean_confidence": confidence,
                "mean_uncertainty": stage.uncertainty.as_ref().and_then(|u| u.mean()),
            })
        })
        .collect();
    let (mean, error) = depth_stats(&output.refined_depth, scene.plane_depth);
    info!("final depth: mean {:.3}, mean absolute error {:.3}", mean, error);
    let summary = json!({
        "depth_mode": config.depth_mode.to_string(),
        "stages": stages,
        "final": {
            "resolution": [output.refined_depth.dim().1, output.refined_depth.dim().2],
            "mean_depth": mean,
            "mean_absolute_error": error,
        },
    });

    match &opt.output {
        Some(path) => {
            serde_json::to_writer_pretty(std::fs::File::create(path)?, &summary)?;
            info!("wrote summary to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}

/// Mean depth and mean absolute error against a known plane.
fn depth_stats(depth: &Array3<f32>, truth: f32) -> (f32, f32) {
    if depth.is_empty() {
        warn!("empty depth map");
        return (f32::NAN, f32::NAN);
    }
    let n = depth.len() as f32;
    let mean = depth.sum() / n;
    let error = depth.fold(0.0, |acc, &d| acc + (d - truth).abs()) / n;
    (mean, error)
}
