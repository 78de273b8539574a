//! Example: Classify a video clip with TimeSformer
//!
//! Builds a registered model (optionally from pretrained weights), runs a
//! synthetic clip through it and prints the top-5 classes.
//!
//! # Usage
//!
//! ```bash
//! # CPU backend (default)
//! cargo run --example classify --release -- --weights TimeSformer_divST_8x32_224_K400.safetensors
//!
//! # Metal / CUDA
//! cargo run --example classify --release --no-default-features --features metal
//! cargo run --example classify --release --no-default-features --features cuda
//! ```
//!
//! Set `RUST_LOG=timesformer_burn=debug` to see checkpoint conversion details.

use std::path::PathBuf;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;
use timesformer_burn::{AttentionType, ModelOptions, ModelRegistry, TimeSformerConfig, VisionTransformer};
use tracing_subscriber::EnvFilter;

// Backend and device type selection based on features
#[cfg(feature = "metal")]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::metal(0)
    }
}

#[cfg(all(feature = "cuda", not(feature = "metal")))]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::cuda(0)
    }
}

#[cfg(all(feature = "cpu", not(feature = "metal"), not(feature = "cuda")))]
mod backend {
    pub type Backend = burn::backend::ndarray::NdArray<f32>;
    pub type Device = burn::backend::ndarray::NdArrayDevice;

    pub fn get_device() -> Device {
        Device::Cpu
    }
}

#[cfg(not(any(feature = "metal", feature = "cuda", feature = "cpu")))]
compile_error!("Please select a backend by enabling one of: metal, cuda, or cpu features");

use backend::{get_device, Backend};

struct Args {
    model: String,
    config: Option<PathBuf>,
    options: ModelOptions,
    batch: usize,
}

fn parse_args() -> Result<Option<Args>, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|x| x == "--help" || x == "-h") {
        eprintln!("Classify a synthetic clip with TimeSformer");
        eprintln!();
        eprintln!("Usage: classify [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  -m, --model <NAME>       Registered model (default: TimeSformer)");
        eprintln!("  -c, --config <PATH>      JSON model config, overrides --model");
        eprintln!("  -w, --weights <PATH>     Pretrained .safetensors or .bpk weights");
        eprintln!("      --frames <N>         Frames per clip (default: 8)");
        eprintln!("      --size <PX>          Frame size (default: 224)");
        eprintln!("      --classes <N>        Output classes (default: 400)");
        eprintln!("      --attention <TYPE>   divided_space_time, space_only or joint_space_time");
        eprintln!("      --batch <N>          Clips per batch (default: 1)");
        eprintln!("  -h, --help               Show this help");
        return Ok(None);
    }

    let value = |names: &[&str]| -> Option<String> {
        let i = args.iter().position(|x| names.contains(&x.as_str()))?;
        args.get(i + 1).cloned()
    };
    let number = |names: &[&str], default: usize| -> Result<usize, String> {
        match value(names) {
            Some(v) => v.parse().map_err(|e| format!("{}: {e}", names[0])),
            None => Ok(default),
        }
    };

    let defaults = ModelOptions::default();
    let attention_type = match value(&["--attention"]) {
        Some(v) => v.parse::<AttentionType>().map_err(|e| e.to_string())?,
        None => defaults.attention_type,
    };

    Ok(Some(Args {
        model: value(&["--model", "-m"]).unwrap_or_else(|| "TimeSformer".to_string()),
        config: value(&["--config", "-c"]).map(PathBuf::from),
        options: ModelOptions {
            img_size: number(&["--size"], defaults.img_size)?,
            num_classes: number(&["--classes"], defaults.num_classes)?,
            num_frames: number(&["--frames"], defaults.num_frames)?,
            attention_type,
            pretrained: value(&["--weights", "-w"]).map(PathBuf::from),
        },
        batch: number(&["--batch"], 1)?,
    }))
}

fn build_model(args: &Args, device: &backend::Device) -> Result<VisionTransformer<Backend>, String> {
    match &args.config {
        Some(path) => {
            let config = TimeSformerConfig::from_file(path).map_err(|e| e.to_string())?;
            let model = config.init(device).map_err(|e| e.to_string())?;
            match &args.options.pretrained {
                Some(weights) => model.with_weights(weights).map_err(|e| e.to_string()),
                None => Ok(model),
            }
        }
        None => ModelRegistry::with_defaults()
            .build(&args.model, &args.options, device)
            .map_err(|e| e.to_string()),
    }
}

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
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    println!("TimeSformer Classification Example");
    println!("==================================\n");

    let device = get_device();
    println!("Using device: {:?}", device);

    let model = build_model(&args, &device)?;
    let config = model.config();
    println!("\nConfig:");
    println!("  Attention: {}", config.attention_type);
    println!("  Frames: {}", config.num_frames);
    println!("  Frame size: {}x{}", config.img_size, config.img_size);
    println!("  Classes: {}", config.num_classes);
    println!("  Params: {:.1}M", config.num_params() as f64 / 1e6);

    // Normalized video statistics stand in for a decoded clip
    let shape = [args.batch, config.in_chans, config.num_frames, config.img_size, config.img_size];
    let clip = Tensor::<Backend, 5>::random(shape, Distribution::Normal(0.0, 1.0), &device);
    println!("\nInput: {:?}", shape);

    let start = std::time::Instant::now();
    let logits = model.try_forward(clip).map_err(|e| e.to_string())?;
    println!("Forward pass: {:.2?}", start.elapsed());

    let [batch, classes] = logits.dims();
    let probs = softmax(logits, 1)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| format!("{e:?}"))?;

    for (clip, row) in probs.chunks(classes).enumerate().take(batch) {
        let mut ranked: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        println!("\nClip {clip} top-5:");
        for (class, p) in ranked.iter().take(5) {
            println!("  class {:>4}  {:.4}", class, p);
        }
    }

    Ok(())
}
