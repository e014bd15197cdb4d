use anyhow::{Context, Result};
use clap::Parser;
use std::{
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shipwright_installer::{
    config::LOG_ENV,
    error::EXIT_USAGE,
    package::{self, PackageIndex},
};

#[derive(Debug, clap::Parser)]
#[command(name = "shipwright-builder", version, about = "Builds shipwright installer packages")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Validate a manifest and write the installer artifact
    Build {
        /// Path to the manifest
        #[arg(short, long, default_value = "shipwright.manifest.toml")]
        manifest: PathBuf,
        /// Directory the artifact is written to
        #[arg(short = 'o', long = "out-dir", default_value = "dist")]
        out_dir: PathBuf,
        /// Installer executable the package is appended to
        #[arg(long)]
        stub: Option<PathBuf>,
    },
    /// Validate a manifest without writing anything
    Check {
        #[arg(short, long, default_value = "shipwright.manifest.toml")]
        manifest: PathBuf,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(command: Command) -> Result<()> {
    let cwd = env::current_dir().context("current directory")?;
    match command {
        Command::Build {
            manifest,
            out_dir,
            stub,
        } => {
            let manifest = absolutize_path(&cwd, manifest);
            let out_dir = absolutize_path(&cwd, out_dir);
            let stub = stub.map(|p| absolutize_path(&cwd, p));
            info!(manifest = %manifest.display(), out_dir = %out_dir.display(), "building");
            let artifact = package::build(&manifest, &out_dir, stub.as_deref())?;
            println!("built {}", artifact.display());
        }
        Command::Check { manifest } => {
            let manifest = absolutize_path(&cwd, manifest);
            let index = package::prepare(&manifest)
                .with_context(|| format!("check {}", manifest.display()))?;
            println!("{}", summary(&index));
        }
    }
    Ok(())
}

fn summary(index: &PackageIndex) -> String {
    let table = index.table();
    let languages: Vec<&str> = table
        .languages()
        .iter()
        .map(|l| l.code.as_str())
        .collect();
    format!(
        "{} {} ({}): {} files, {} bytes, {} associations, {} tasks, languages {}",
        index.app.name,
        index.app.version,
        index.app.id,
        index.files.len(),
        index.payload_size(),
        index.associations.len(),
        index.tasks.len(),
        languages.join(",")
    )
}

fn absolutize_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
