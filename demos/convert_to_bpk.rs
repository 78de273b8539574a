//! Convert TimeSformer (or ImageNet ViT) weights from safetensors to Burn's bpk format
//!
//! The checkpoint is converted for the target configuration first (patch
//! kernel, classifier, embedding sizes, temporal attention), so an ImageNet
//! ViT-B/16 checkpoint becomes a ready-to-fine-tune TimeSformer.
//!
//! Usage:
//!   cargo run --example convert_to_bpk --release -- \
//!     --input /path/to/TimeSformer_divST_8x32_224_K400.safetensors \
//!     --output /path/to/timesformer_k400.bpk \
//!     --frames 8 --classes 400

use std::path::PathBuf;

use timesformer_burn::{AttentionType, Checkpoint, TimeSformerConfig, VisionTransformer};
use tracing_subscriber::EnvFilter;

type Backend = burn::backend::ndarray::NdArray<f32>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    // Default paths
    let mut input_path = PathBuf::from("models/TimeSformer_divST_8x32_224_K400.safetensors");
    let mut output_path = PathBuf::from("models/timesformer_k400.bpk");
    let mut config = TimeSformerConfig::default();

    // Parse arguments
    if let Some(i) = args.iter().position(|x| x == "--input" || x == "-i") {
        if i + 1 < args.len() {
            input_path = PathBuf::from(&args[i + 1]);
        }
    }

    if let Some(i) = args.iter().position(|x| x == "--output" || x == "-o") {
        if i + 1 < args.len() {
            output_path = PathBuf::from(&args[i + 1]);
        }
    }

    if let Some(i) = args.iter().position(|x| x == "--config" || x == "-c") {
        if i + 1 < args.len() {
            config = TimeSformerConfig::from_file(&args[i + 1]).map_err(|e| e.to_string())?;
        }
    }

    if let Some(i) = args.iter().position(|x| x == "--frames") {
        if i + 1 < args.len() {
            config.num_frames = args[i + 1].parse().map_err(|e| format!("--frames: {e}"))?;
        }
    }

    if let Some(i) = args.iter().position(|x| x == "--classes") {
        if i + 1 < args.len() {
            config.num_classes = args[i + 1].parse().map_err(|e| format!("--classes: {e}"))?;
        }
    }

    if let Some(i) = args.iter().position(|x| x == "--attention") {
        if i + 1 < args.len() {
            config.attention_type = args[i + 1].parse::<AttentionType>().map_err(|e| e.to_string())?;
        }
    }

    if args.iter().any(|x| x == "--help" || x == "-h") {
        eprintln!("Convert TimeSformer weights from safetensors to bpk format");
        eprintln!();
        eprintln!("Usage: convert_to_bpk [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  -i, --input <PATH>      Input safetensors file");
        eprintln!("  -o, --output <PATH>     Output bpk file");
        eprintln!("  -c, --config <PATH>     JSON model config (default: ViT-B/16, 8 frames, 400 classes)");
        eprintln!("      --frames <N>        Frames per clip");
        eprintln!("      --classes <N>       Output classes");
        eprintln!("      --attention <TYPE>  divided_space_time, space_only or joint_space_time");
        eprintln!("  -h, --help              Show this help");
        return Ok(());
    }

    println!("TimeSformer Converter - safetensors to bpk");
    println!("==========================================");
    println!();
    println!("Input: {:?}", input_path);
    println!("Output: {:?}", output_path);

    println!("\nConfig:");
    println!("  Attention: {}", config.attention_type);
    println!("  Embed dim: {}", config.embed_dim);
    println!("  Depth: {}", config.depth);
    println!("  Num heads: {}", config.num_heads);
    println!("  Frames: {}", config.num_frames);
    println!("  Classes: {}", config.num_classes);
    println!("  Approx params: {:.1}M", config.num_params() as f64 / 1e6);

    println!("\nInitializing model on CPU...");
    let device = Default::default();
    let mut model: VisionTransformer<Backend> = config.init(&device).map_err(|e| e.to_string())?;

    println!("Reading checkpoint...");
    let mut checkpoint = Checkpoint::from_safetensors(&input_path).map_err(|e| e.to_string())?;
    checkpoint.adapt(&config);

    let report = model.load_checkpoint(&checkpoint);
    println!("  Applied: {}", report.applied.len());
    println!("  Missing: {}", report.missing.len());
    println!("  Mismatched: {}", report.mismatched.len());
    println!("  Unused: {}", report.unexpected.len());

    println!("Saving to bpk format...");
    model
        .save_bpk(&output_path)
        .map_err(|e| format!("Failed to save: {e:?}"))?;

    // Print file sizes
    if let Ok(meta) = std::fs::metadata(&input_path) {
        println!("\nInput size: {:.2} MB", meta.len() as f64 / 1e6);
    }
    if let Ok(meta) = std::fs::metadata(&output_path) {
        println!("Output size: {:.2} MB", meta.len() as f64 / 1e6);
    }

    println!("\nConversion complete!");

    Ok(())
}
