//! zipaccess - command-line front end

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use zipaccess::{
    ArchiveFacade, ArchiveProgress, BackendKind, BatchOptions, CreateOptions, ExtractOptions, Outcome, Settings,
};

#[derive(Parser)]
#[command(name = "zipaccess")]
#[command(version)]
#[command(about = "Extract and create ZIP archives with progress and cancellation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine to use: stream, central or 7z (defaults to the settings file)
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a file is a readable archive and summarize it
    Info {
        /// Path to the archive
        archive: PathBuf,
    },

    /// List entries of an archive
    List {
        /// Path to the archive
        archive: PathBuf,

        /// Password for encrypted entries
        #[arg(long, env = "ZIPACCESS_PASSWORD")]
        password: Option<String>,
    },

    /// Extract an archive
    Extract {
        /// Path to the archive
        archive: PathBuf,

        /// Output directory (defaults to the archive's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Password for encrypted entries
        #[arg(long, env = "ZIPACCESS_PASSWORD")]
        password: Option<String>,

        /// Delete the archive after a complete extraction
        #[arg(long)]
        delete_source: bool,

        /// Only extract these entries (case-insensitive, repeatable)
        #[arg(short, long = "entry")]
        entries: Vec<String>,
    },

    /// Create an archive from a directory
    Pack {
        /// Directory to pack
        input: PathBuf,

        /// Archive to create (defaults to <input>/<input name>.zip)
        archive: Option<PathBuf>,

        /// Encrypt entries with AES-256
        #[arg(long, env = "ZIPACCESS_PASSWORD")]
        password: Option<String>,

        /// Store entries under the input directory's own name
        #[arg(long)]
        include_root: bool,
    },

    /// Extract every .zip under a folder into per-archive folders
    ExtractFolder {
        /// Folder to search for archives
        folder: PathBuf,

        /// Output directory (defaults to the folder itself)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Password for encrypted entries
        #[arg(long, env = "ZIPACCESS_PASSWORD")]
        password: Option<String>,

        /// Remove each archive after extraction
        #[arg(long)]
        move_source: bool,

        /// Move archives here instead of deleting them (must exist)
        #[arg(long)]
        move_to: Option<PathBuf>,
    },
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

/// Progress bar driven by the facade's notifications.
fn attach_progress(facade: &ArchiveFacade) -> Result<ProgressBar> {
    let pb = progress_bar()?;
    let bar = pb.clone();
    facade.on_progress(move |event| match event {
        ArchiveProgress::Changed { percent, item } => {
            bar.set_position(*percent as u64);
            if let Some(item) = item {
                bar.set_message(item.display().to_string());
            }
        }
        ArchiveProgress::Finished => bar.finish_with_message("done"),
    });
    Ok(pb)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "zipaccess=debug".parse()? } else { "zipaccess=warn".parse()? }),
            )
            .init();
    }

    let settings = Settings::load();
    let kind = cli.backend.unwrap_or(settings.backend);
    let facade = ArchiveFacade::new(kind, settings);

    match cli.command {
        Commands::Info { archive } => {
            if !archive.exists() {
                bail!("Archive not found: {}", archive.display());
            }
            if !facade.probe(&archive) {
                bail!("{} is not a readable archive ({} backend)", archive.display(), kind);
            }
            let entries = facade
                .list(&archive, None)
                .with_context(|| format!("Failed to list {}", archive.display()))?;
            let files = entries.iter().filter(|e| !e.is_directory).count();
            let total: u64 = entries.iter().map(|e| e.size).sum();

            println!("=== Archive Information ===");
            println!("Path:        {}", archive.display());
            println!("Backend:     {}", kind);
            println!("Entries:     {}", entries.len());
            println!("Files:       {}", files);
            println!("Directories: {}", entries.len() - files);
            println!("Total size:  {} bytes", total);
        }

        Commands::List { archive, password } => {
            let entries = facade
                .list(&archive, password.as_deref())
                .with_context(|| format!("Failed to list {}", archive.display()))?;
            for entry in &entries {
                println!("{}", entry);
            }
            eprintln!("\nTotal: {} entries", entries.len());
        }

        Commands::Extract {
            archive,
            output,
            password,
            delete_source,
            entries,
        } => {
            let mut options = ExtractOptions::new().with_delete_source(delete_source);
            if let Some(pass) = password {
                options = options.with_password(pass);
            }

            let pb = attach_progress(&facade)?;
            let output = output.unwrap_or_default();
            let result = if entries.is_empty() {
                facade.extract_all(&archive, &output, &options)
            } else {
                facade.extract_subset(&archive, &output, &options, &entries)
            };
            let outcome = result.with_context(|| format!("Failed to extract {}", archive.display()))?;

            match outcome {
                Outcome::Completed(stats) => {
                    println!(
                        "Extracted {} files, {} directories ({} bytes)",
                        stats.files, stats.directories, stats.bytes
                    );
                    if stats.skipped > 0 {
                        println!("Skipped {} unsafe entries", stats.skipped);
                    }
                }
                Outcome::Cancelled => {
                    pb.abandon_with_message("cancelled");
                    println!("Extraction cancelled.");
                }
            }
        }

        Commands::Pack {
            input,
            archive,
            password,
            include_root,
        } => {
            let mut options = CreateOptions::new().with_root_dir(include_root);
            if let Some(pass) = password {
                options = options.with_password(pass);
            }

            let _pb = attach_progress(&facade)?;
            let archive = archive.unwrap_or_default();
            let outcome = facade
                .create_from_directory(&input, &archive, &options)
                .with_context(|| format!("Failed to pack {}", input.display()))?;

            match outcome {
                Outcome::Completed(written) => println!("Packed {} entries", written.len()),
                Outcome::Cancelled => println!("Packing cancelled."),
            }
        }

        Commands::ExtractFolder {
            folder,
            output,
            password,
            move_source,
            move_to,
        } => {
            let mut options = BatchOptions::new().with_move_source(move_source);
            if let Some(pass) = password {
                options = options.with_password(pass);
            }
            if let Some(dir) = move_to {
                options = options.with_move_to(dir);
            }

            let _pb = attach_progress(&facade)?;
            let output = output.unwrap_or_default();
            let report = facade
                .extract_all_archives_in_folder(&folder, &output, &options)
                .with_context(|| format!("Failed to extract archives in {}", folder.display()))?;

            println!("\n=== Batch Summary ===");
            println!("Extracted: {}", report.directories.len());
            println!("Failed:    {}", report.failed.len());
            for failure in &report.failed {
                println!("  {}: {}", failure.archive.display(), failure.error);
            }
            if report.cancelled {
                println!("\nBatch cancelled.");
            }
        }
    }

    Ok(())
}
