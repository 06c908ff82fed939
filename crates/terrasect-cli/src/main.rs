use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use terrasect_bridge::{process_frame, PipelineConfig};
use terrasect_core::{bounding_box, Aabb, Cloud};
use terrasect_segment::{ClusterConfig, RansacPlane};

// ---------- helpers ----------

fn t0() -> std::time::Instant { std::time::Instant::now() }
fn lap(t: std::time::Instant, label: &str) {
    let ms = t.elapsed().as_secs_f64()*1000.0;
    info!("[{label}] {ms:.1} ms");
}

/// "x,y,z" -> [x, y, z]
fn parse_xyz(csv: &str) -> Result<[f32; 3]> {
    let v: Vec<f32> = csv
        .split(',')
        .map(|s| s.trim().parse::<f32>().with_context(|| format!("bad coordinate '{s}' in '{csv}'")))
        .collect::<Result<_>>()?;
    match v.as_slice() {
        &[x, y, z] => Ok([x, y, z]),
        _ => bail!("expected three comma-separated values, got '{csv}'"),
    }
}

fn parse_box(min: &str, max: &str) -> Result<Aabb> {
    let b = Aabb::new(parse_xyz(min)?, parse_xyz(max)?);
    anyhow::ensure!(b.is_valid(), "box min {min} exceeds max {max}");
    Ok(b)
}

fn print_boxes(clusters: &[Cloud], boxes: &[Aabb]) {
    for (i, (c, b)) in clusters.iter().zip(boxes).enumerate() {
        let [ex, ey, ez] = b.extent();
        println!(
            "  #{i:<3} {:>5} pts  min=({:.2}, {:.2}, {:.2})  max=({:.2}, {:.2}, {:.2})  size={ex:.2}x{ey:.2}x{ez:.2}",
            c.len(), b.min[0], b.min[1], b.min[2], b.max[0], b.max[1], b.max[2]
        );
    }
}

fn write_clusters(dir: &Path, clusters: &[Cloud]) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for (i, c) in clusters.iter().enumerate() {
        terrasect_io::write_pcd_ascii(dir.join(format!("cluster_{i:03}.pcd")), c)?;
    }
    Ok(())
}

// ---------- CLI ----------

#[derive(Parser)]
#[command(name="terrasect", version, about="terrasect — LIDAR ground removal and obstacle clustering")]
struct Args { #[command(subcommand)] cmd: Cmd }

/// Pipeline knobs shared by `run` and `stream`; flags override the YAML file.
#[derive(clap::Args)]
struct PipelineArgs {
    /// YAML pipeline config (defaults are used for missing keys)
    #[arg(short, long)] config: Option<PathBuf>,
    /// Skip voxel/ROI/roof filtering
    #[arg(long)] no_filter: bool,
    #[arg(long)] voxel: Option<f32>,
    #[arg(long)] iters: Option<usize>,
    #[arg(long)] plane_tol: Option<f32>,
    #[arg(long)] cluster_tol: Option<f32>,
    #[arg(long)] min_size: Option<usize>,
    #[arg(long)] max_size: Option<usize>,
    /// Fixed RANSAC seed for reproducible output
    #[arg(long)] seed: Option<u64>,
}

impl PipelineArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(p) => PipelineConfig::from_yaml_file(p)?,
            None => PipelineConfig::default(),
        };
        if self.no_filter { cfg.filter = None; }
        if let (Some(v), Some(f)) = (self.voxel, cfg.filter.as_mut()) { f.voxel = v; }
        if let Some(v) = self.iters { cfg.plane.max_iterations = v; }
        if let Some(v) = self.plane_tol { cfg.plane.distance_tolerance = v; }
        if let Some(v) = self.seed { cfg.plane.seed = Some(v); }
        if let Some(v) = self.cluster_tol { cfg.cluster.tolerance = v; }
        if let Some(v) = self.min_size { cfg.cluster.min_size = v; }
        if let Some(v) = self.max_size { cfg.cluster.max_size = v; }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Print point count, attribute columns and bounds of a file (PCD / PLY / LAS)
    Info { input: String },

    /// Voxel downsample
    Voxel {
        input: String, output: String,
        #[arg(short, long, default_value_t=0.3)] size: f32,
    },

    /// Keep points inside a box, e.g. --min=-10,-5,-2 --max=30,8,1
    Crop {
        input: String, output: String,
        #[arg(long, allow_hyphen_values=true)] min: String,
        #[arg(long, allow_hyphen_values=true)] max: String,
        /// Remove the box instead of keeping it
        #[arg(long)] invert: bool,
    },

    /// RANSAC ground plane: write plane and remaining points
    Ground {
        input: String, ground: String, obstacles: String,
        #[arg(long, default_value_t=100)] iters: usize,
        #[arg(long, default_value_t=0.2)] tol: f32,
        #[arg(long)] seed: Option<u64>,
    },

    /// Euclidean clustering; writes cluster_NNN.pcd into OUT_DIR and prints boxes
    Cluster {
        input: String, out_dir: PathBuf,
        #[arg(long, default_value_t=0.5)] tol: f32,
        #[arg(long, default_value_t=10)] min_size: usize,
        #[arg(long, default_value_t=500)] max_size: usize,
    },

    /// Full pipeline on one frame; prints (or writes) the obstacle boxes as JSON
    Run {
        input: String,
        #[command(flatten)] pipeline: PipelineArgs,
        /// JSON report path (stdout if omitted)
        #[arg(short, long)] output: Option<PathBuf>,
        /// Also write each cluster as PCD here
        #[arg(long)] clusters_dir: Option<PathBuf>,
    },

    /// Full pipeline over every frame in a directory, in file-name order
    Stream {
        dir: PathBuf,
        #[command(flatten)] pipeline: PipelineArgs,
        /// Write one <frame>.json report per frame here
        #[arg(short, long)] out_dir: Option<PathBuf>,
    },

    /// Print the default pipeline config as YAML
    DefaultConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match args.cmd {
        Cmd::Info { input } => cmd_info(&input),
        Cmd::Voxel { input, output, size } => cmd_voxel(&input, &output, size),
        Cmd::Crop { input, output, min, max, invert } => cmd_crop(&input, &output, &min, &max, invert),
        Cmd::Ground { input, ground, obstacles, iters, tol, seed } =>
            cmd_ground(&input, &ground, &obstacles, iters, tol, seed),
        Cmd::Cluster { input, out_dir, tol, min_size, max_size } =>
            cmd_cluster(&input, &out_dir, ClusterConfig { tolerance: tol, min_size, max_size }),
        Cmd::Run { input, pipeline, output, clusters_dir } =>
            cmd_run(&input, &pipeline.resolve()?, output.as_deref(), clusters_dir.as_deref()),
        Cmd::Stream { dir, pipeline, out_dir } => cmd_stream(&dir, &pipeline.resolve()?, out_dir.as_deref()),
        Cmd::DefaultConfig => {
            print!("{}", PipelineConfig::default().to_yaml()?);
            Ok(())
        }
    }
}

// ---------- commands ----------

fn cmd_info(path: &str) -> Result<()> {
    let cloud = terrasect_io::read_auto(path)?;
    println!("points: {}", cloud.len());
    let attrs = cloud.aligned_attr_keys();
    if !attrs.is_empty() {
        println!("attributes: {}", attrs.join(", "));
    }
    if let Ok(b) = bounding_box((&cloud).into()) {
        println!("bounds: min={:?} max={:?}", b.min, b.max);
    }
    Ok(())
}

fn cmd_voxel(input: &str, output: &str, size: f32) -> Result<()> {
    let cloud = terrasect_io::read_auto(input)?;
    let out = terrasect_filters::voxel_downsample(&cloud, size)?;
    terrasect_io::write_auto(output, &out)?;
    println!("downsampled: {} -> {}", cloud.len(), out.len());
    Ok(())
}

fn cmd_crop(input: &str, output: &str, min: &str, max: &str, invert: bool) -> Result<()> {
    let region = parse_box(min, max)?;
    let cloud = terrasect_io::read_auto(input)?;
    let out = if invert {
        terrasect_filters::remove_box(&cloud, &region)
    } else {
        terrasect_filters::crop_box(&cloud, &region)
    };
    terrasect_io::write_auto(output, &out)?;
    println!("crop: {} -> {}", cloud.len(), out.len());
    Ok(())
}

fn cmd_ground(input: &str, ground_out: &str, obstacles_out: &str, iters: usize, tol: f32, seed: Option<u64>) -> Result<()> {
    anyhow::ensure!(iters > 0 && tol > 0.0, "--iters and --tol must be positive");
    let cloud = terrasect_io::read_auto(input)?;

    let t = t0();
    let (ground, obstacles) = RansacPlane { max_iterations: iters, distance_tolerance: tol, seed }.segment(&cloud);
    lap(t, "ransac");

    terrasect_io::write_auto(ground_out, &ground)?;
    terrasect_io::write_auto(obstacles_out, &obstacles)?;
    println!("ground: {} plane / {} other", ground.len(), obstacles.len());
    Ok(())
}

fn cmd_cluster(input: &str, out_dir: &Path, cfg: ClusterConfig) -> Result<()> {
    anyhow::ensure!(cfg.tolerance > 0.0, "--tol must be positive");
    anyhow::ensure!(cfg.min_size <= cfg.max_size, "--min-size exceeds --max-size");
    let cloud = terrasect_io::read_auto(input)?;

    let t = t0();
    let clusters = terrasect_segment::cluster_cloud(&cloud, &cfg)?;
    lap(t, "cluster");

    let boxes = clusters.iter().map(|c| bounding_box(c.into())).collect::<Result<Vec<_>, _>>()?;
    write_clusters(out_dir, &clusters)?;
    println!("cluster: {} points -> {} clusters in {}", cloud.len(), clusters.len(), out_dir.display());
    print_boxes(&clusters, &boxes);
    Ok(())
}

fn cmd_run(input: &str, cfg: &PipelineConfig, output: Option<&Path>, clusters_dir: Option<&Path>) -> Result<()> {
    let t_read = t0();
    let cloud = terrasect_io::read_auto(input)?;
    lap(t_read, "read");

    let frame = process_frame(&cloud, cfg)?;
    let tm = &frame.timings;
    info!(
        "filter {} us, segment {} us, index {} us, cluster {} us, boxes {} us",
        tm.filter_us, tm.segment_us, tm.index_us, tm.cluster_us, tm.boxes_us
    );

    if let Some(dir) = clusters_dir {
        write_clusters(dir, &frame.clusters)?;
    }
    let report = frame.report();
    match output {
        Some(p) => {
            let f = std::fs::File::create(p).with_context(|| format!("create {}", p.display()))?;
            serde_json::to_writer_pretty(f, &report)?;
            println!("run: {} obstacles -> {}", report.obstacles.len(), p.display());
            print_boxes(&frame.clusters, &frame.boxes);
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn cmd_stream(dir: &Path, cfg: &PipelineConfig, out_dir: Option<&Path>) -> Result<()> {
    let frames = terrasect_io::stream_dir(dir)?;
    if frames.is_empty() { bail!("no pcd/ply/las frames in {}", dir.display()); }
    if let Some(d) = out_dir {
        std::fs::create_dir_all(d).with_context(|| format!("create {}", d.display()))?;
    }

    let t_all = t0();
    for path in &frames {
        let cloud = terrasect_io::read_auto(path)?;
        let frame = process_frame(&cloud, cfg)?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        println!(
            "{name}: {} pts -> {} filtered, {} ground, {} obstacles in {} clusters ({:.1} ms)",
            frame.input_points,
            frame.filtered_points,
            frame.ground.len(),
            frame.obstacles.len(),
            frame.clusters.len(),
            frame.timings.total_us as f64 / 1000.0
        );
        if let Some(d) = out_dir {
            let p = d.join(format!("{name}.json"));
            let f = std::fs::File::create(&p).with_context(|| format!("create {}", p.display()))?;
            serde_json::to_writer_pretty(f, &frame.report())?;
        }
    }
    lap(t_all, &format!("stream ({} frames)", frames.len()));
    Ok(())
}
