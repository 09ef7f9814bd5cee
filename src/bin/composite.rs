// Lays the samples of several experiment variants side by side, one sheet per
// view and example:
//   cargo run --release --features clap --bin aerialbooth-composite -- --font arial.ttf
// Without --font the labels use the bundled DejaVu Sans.
use aerialbooth::{
    composite::{build_all, default_font, load_font, DEFAULT_VARIANTS},
    view::ViewMode,
    worklist::Worklist,
};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding one sub-directory per variant.
    #[arg(long, default_value = "exp_outputs")]
    root: PathBuf,

    /// The variants to compare, one column each.
    #[arg(long, num_args = 1.., default_values_t = DEFAULT_VARIANTS.map(String::from).to_vec())]
    variants: Vec<String>,

    /// The examples to build sheets for, all the built-in ones by default.
    #[arg(long, num_args = 1..)]
    examples: Vec<String>,

    #[arg(long, value_enum, num_args = 1..)]
    views: Vec<ViewMode>,

    #[arg(long, default_value_t = 5)]
    samples: usize,

    /// TrueType font for the labels, DejaVu Sans by default.
    #[arg(long, value_name = "FILE")]
    font: Option<PathBuf>,

    #[arg(long, default_value = "composite_outputs")]
    out_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();
    let args = Args::parse();
    let examples = if args.examples.is_empty() {
        Worklist::synthetic("", "").ids().map(String::from).collect()
    } else {
        args.examples.clone()
    };
    let views = if args.views.is_empty() { ViewMode::ALL.to_vec() } else { args.views.clone() };
    let font = match &args.font {
        Some(path) => load_font(path)?,
        None => default_font()?,
    };
    let written =
        build_all(&args.root, &args.variants, &examples, &views, args.samples, &font, &args.out_dir)?;
    info!("Composite images generation completed, {} written.", written.len());
    Ok(())
}
