use anyhow::{bail, Context, Result};
use clap::Parser;
use sam_interact::cache::{EmbeddingStore, FileEmbeddingStore};
use sam_interact::segmentation::{
    create_default_engine, EngineConfig, InteractionSession, Label, LabeledPoint, Point,
    SessionConfig, DEFAULT_MASK_COLOR,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the SAM2 image encoder (ONNX file)
    #[arg(long)]
    encoder: PathBuf,

    /// Path to the SAM2 mask decoder (ONNX file)
    #[arg(long)]
    decoder: PathBuf,

    /// Image to segment
    #[arg(short, long)]
    image: PathBuf,

    /// Prompt point as x,y,label in image pixels (label 1 = foreground, 0 = background).
    /// May be repeated; order is kept.
    #[arg(short, long = "point", value_parser = parse_point)]
    points: Vec<LabeledPoint>,

    /// Box prompt as x1,y1,x2,y2 in image pixels
    #[arg(long = "box", value_parser = parse_box)]
    box_corners: Option<[f32; 4]>,

    /// Refinement steps to run after the first decode
    #[arg(long, default_value_t = 0)]
    refine: u32,

    /// Directory for cached image embeddings
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory the mask PNGs are written to
    #[arg(short, long, default_value = "masks")]
    out_dir: PathBuf,

    /// Side of the square model input
    #[arg(long, default_value_t = 1024)]
    target_size: u32,

    /// ONNX Runtime intra-op threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_floats<const N: usize>(s: &str) -> Result<[f32; N], String> {
    let values: Vec<f32> = s
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| format!("'{}': {}", v, e)))
        .collect::<Result<_, _>>()?;
    values
        .try_into()
        .map_err(|v: Vec<f32>| format!("expected {} comma separated numbers, got {}", N, v.len()))
}

fn parse_point(s: &str) -> Result<LabeledPoint, String> {
    let (coords, label) = s
        .rsplit_once(',')
        .ok_or_else(|| "expected x,y,label".to_string())?;
    let [x, y] = parse_floats::<2>(coords)?;
    let label = label
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("label '{}': {}", label.trim(), e))?;
    let label = Label::try_from(label).map_err(|e| e.to_string())?;
    Ok(LabeledPoint::new(x, y, label))
}

fn parse_box(s: &str) -> Result<[f32; 4], String> {
    parse_floats::<4>(s)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("sam-interact starting");

    if args.points.is_empty() && args.box_corners.is_none() {
        bail!("at least one --point or a --box is required");
    }

    let image = image::open(&args.image)
        .with_context(|| format!("Failed to open image {}", args.image.display()))?;

    let engine = create_default_engine(
        EngineConfig::new(&args.encoder, &args.decoder).with_intra_threads(args.threads),
    )
    .context("Failed to load SAM2 models")?;

    let config = SessionConfig {
        target_size: args.target_size,
        mask_color: DEFAULT_MASK_COLOR,
    };
    let mut session = InteractionSession::new(engine, config);
    if let Some(dir) = &args.cache_dir {
        let store: Arc<dyn EmbeddingStore> =
            Arc::new(FileEmbeddingStore::new(dir).context("Failed to open embedding cache")?);
        session = session.with_store(store);
    }

    let start = Instant::now();
    session
        .prepare(&image)
        .await
        .context("Failed to prepare image")?;
    tracing::info!("Prepared in {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);

    // Prompts are given in image pixels; the decoder works in model space
    for p in &args.points {
        let mapped = session.map_to_model(p.point()).await?;
        session.add_point(LabeledPoint::new(mapped.x, mapped.y, p.label));
    }
    if let Some([x1, y1, x2, y2]) = args.box_corners {
        let transform = session
            .transform()
            .await
            .context("Session lost its image transform")?;
        session.set_box(transform.box_to_model(Point::new(x1, y1), Point::new(x2, y2)));
    }

    let mut result = session.decode().await.context("Failed to decode masks")?;
    tracing::info!("Decode scores: {:?}", result.output.scores);

    for step in 1..=args.refine {
        result = session.refine().await.context("Failed to refine masks")?;
        tracing::info!("Refine step {} scores: {:?}", step, result.output.scores);
    }

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;

    for (i, mask) in result.masks.iter().enumerate() {
        let path = args.out_dir.join(format!("mask_{}.png", i));
        mask.image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Mask {} score={:.2} -> {}", i, mask.score, path.display());
    }

    Ok(())
}
