use anyhow::{Context, Result};
use clap::Parser;
use platelens::barcode::{BarcodeCache, OpenFoodFacts};
use platelens::cache::MemoryResponseCache;
use platelens::capture::FoodCapture;
use platelens::config::Config;
use platelens::engine::{AnalysisOutcome, JsonlRecordStore, NutritionEngine};
use platelens::record::SynthesizedNutritionRecord;
use platelens::vision::client::OpenRouterVision;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "platelens",
    about = "Turn a food photo into a structured nutrition record",
    version
)]
struct Args {
    /// Path to the food photo
    photo: PathBuf,

    /// Scanned barcode of the product, if any
    #[arg(short, long)]
    barcode: Option<String>,

    /// Path to a nutrition-label photo, if any
    #[arg(short, long)]
    label: Option<PathBuf>,

    /// Override the configured vision model
    #[arg(short, long)]
    model: Option<String>,

    /// Print the record as JSON instead of the summary view
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load();

    let api_key = Config::api_key().context(
        "no vision API key configured. Set the OPENROUTER_API_KEY environment variable.",
    )?;

    let photo = std::fs::read(&args.photo)
        .with_context(|| format!("failed to read photo {}", args.photo.display()))?;
    let mut capture = FoodCapture::new(photo);
    if let Some(barcode) = &args.barcode {
        capture = capture.with_barcode(barcode);
    }
    if let Some(label_path) = &args.label {
        let label = std::fs::read(label_path)
            .with_context(|| format!("failed to read label photo {}", label_path.display()))?;
        capture = capture.with_label_photo(label);
    }

    let model = args.model.unwrap_or_else(|| config.vision_model.clone());
    let cache_dir = Config::cache_dir();
    let engine = NutritionEngine::new(
        Arc::new(OpenRouterVision::new(api_key, model)),
        Arc::new(OpenFoodFacts::new(config.product_db_url.clone())),
        Arc::new(MemoryResponseCache::new()),
        Arc::new(JsonlRecordStore::new(cache_dir.join("records.jsonl"))),
        BarcodeCache::open(&cache_dir, config.barcode_cache_ttl_days),
        config.engine_settings(),
    );

    eprintln!("  Analyzing photo...");
    let mut outcome = engine.analyze_food_capture(capture).await?;

    // Clarification turns are synchronous question/answer pairs on stdin
    loop {
        match outcome {
            AnalysisOutcome::Record(record) => {
                print_record(&record, args.json)?;
                return Ok(());
            }
            AnalysisOutcome::Clarification(prompt) => {
                eprintln!();
                eprintln!("  {}", prompt.question);
                eprint!("  > ");
                io::stderr().flush()?;

                let mut reply = String::new();
                io::stdin().read_line(&mut reply)?;
                outcome = engine
                    .respond_to_clarification(prompt.session_id, reply.trim())
                    .await?;
            }
        }
    }
}

fn print_record(record: &SynthesizedNutritionRecord, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!();
    println!("  {} ({})", record.dish_name, record.serving_description);
    println!(
        "  {:.0} kcal | protein {:.1}g | carbs {:.1}g | fat {:.1}g | fiber {:.1}g",
        record.nutrition.calories,
        record.nutrition.protein_g,
        record.nutrition.carbs_g,
        record.nutrition.fat_g,
        record.nutrition.fiber_g
    );
    println!(
        "  source: {} | confidence: {:.2}{}",
        record.source.label(),
        record.confidence,
        if record.needs_user_confirmation {
            " | needs confirmation"
        } else {
            ""
        }
    );
    println!();
    println!("  provenance:");
    for entry in &record.provenance {
        println!(
            "    {} {} - {}",
            if entry.used { "+" } else { "-" },
            entry.source.label(),
            entry.reason
        );
    }
    Ok(())
}
