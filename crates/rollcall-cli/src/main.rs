use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{FacePipeline, MatchDecision, RecognitionConfig};
use rollcall_gallery::{DirectoryStore, EnrollPolicy, Gallery, GalleryStore, IdentitySummary};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face gallery administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from one or more reference photos
    Enroll {
        /// Identity label, usually the student ID
        label: String,
        /// JPEG or PNG photos, each showing the student's face
        #[arg(required = true)]
        photos: Vec<PathBuf>,
        /// Add the photos to an existing identity instead of failing
        #[arg(long)]
        append: bool,
    },
    /// List enrolled identities
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove an identity and all its photos
    Remove {
        label: String,
    },
    /// Match a photo against the gallery
    Identify {
        photo: PathBuf,
    },
    /// Load the models and report their configuration
    Test,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RecognitionConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Enroll {
            label,
            photos,
            append,
        } => {
            let images = photos
                .iter()
                .map(|path| std::fs::read(path).with_context(|| format!("failed to read {}", path.display())))
                .collect::<Result<Vec<_>>>()?;
            let (mut pipeline, gallery) = load_gallery(&config)?;
            let policy = if append {
                EnrollPolicy::Append
            } else {
                EnrollPolicy::CreateNew
            };
            let report = gallery
                .enroll(&mut pipeline, &label, &images, policy)
                .map_err(|e| anyhow::anyhow!("enrollment failed ({}): {e}", e.code()))?;

            let verb = if report.created { "Enrolled" } else { "Updated" };
            println!("{verb} {} with {} new photo(s)", report.identity, report.stored.len());
            for source in &report.stored {
                println!("  {source}");
            }
            if report.duplicates > 0 {
                println!("Skipped {} photo(s) already enrolled", report.duplicates);
            }
        }
        Commands::List { json } => {
            let summaries = list_store(&open_store(&config)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No identities enrolled in {}", config.gallery_dir.display());
            } else {
                println!("{:<32} PHOTOS", "IDENTITY");
                for s in &summaries {
                    println!("{:<32} {}", s.identity, s.references);
                }
            }
        }
        Commands::Remove { label } => {
            let gallery = Gallery::new(open_store(&config)?, config.matcher());
            let removed = gallery.remove_identity(&label)?;
            println!("Removed {label} ({removed} photo(s))");
        }
        Commands::Identify { photo } => {
            let image = std::fs::read(&photo)
                .with_context(|| format!("failed to read {}", photo.display()))?;
            let (mut pipeline, gallery) = load_gallery(&config)?;
            if gallery.is_empty() {
                bail!("gallery at {} is empty", config.gallery_dir.display());
            }
            match gallery.process_frame(&mut pipeline, &image) {
                MatchDecision::Matched(m) => println!(
                    "Matched {} (distance {:.4}, confidence {:.1}%)",
                    m.identity,
                    m.distance,
                    m.confidence * 100.0
                ),
                MatchDecision::NoMatch { reason } => {
                    println!("No match: {} ({})", reason.message(), reason.code())
                }
            }
        }
        Commands::Test => {
            println!("Model directory: {}", config.model_dir.display());
            println!("Gallery:         {}", config.gallery_dir.display());
            println!(
                "Policy:          {} threshold={} margin={}",
                config.metric.as_str(),
                config.threshold,
                config.margin
            );
            let pipeline = FacePipeline::from_config(&config).context("failed to load face models")?;
            println!("Models loaded, embedding dimension {}", pipeline.dimension());
        }
    }

    Ok(())
}

fn open_store(config: &RecognitionConfig) -> Result<DirectoryStore> {
    DirectoryStore::open(&config.gallery_dir)
        .with_context(|| format!("failed to open gallery {}", config.gallery_dir.display()))
}

fn load_gallery(config: &RecognitionConfig) -> Result<(FacePipeline, Gallery<DirectoryStore>)> {
    let mut pipeline = FacePipeline::from_config(config).context("failed to load face models")?;
    // Skipped photos and load totals are logged by the gallery itself.
    let (gallery, _) = Gallery::load(open_store(config)?, config.matcher(), &mut pipeline)?;
    Ok((pipeline, gallery))
}

/// Identities straight from the store, without loading any models.
fn list_store(store: &DirectoryStore) -> Result<Vec<IdentitySummary>> {
    store
        .list_identities()?
        .into_iter()
        .map(|identity| -> Result<IdentitySummary> {
            let references = store.load_reference_images(&identity)?.len();
            Ok(IdentitySummary {
                identity,
                references,
            })
        })
        .collect()
}
