#![forbid(unsafe_code)]

//! Command-line front end for the download pipeline.
//!
//! Every subcommand drives the same library components as the HTTP backend,
//! so `grab download` followed by `grab list` shows exactly what the server
//! would serve from the same storage root.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use grabtube::{
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    download::DownloadExecutor,
    extractor::{MediaExtractor, YtDlpExtractor},
    metadata::MetadataResolver,
    security::ensure_not_root,
    store::{FileStore, blocking},
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Fetch videos from supported platforms")]
struct Cli {
    /// Directory that holds downloaded files
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,
    /// Path to the yt-dlp executable
    #[arg(long, global = true)]
    ytdlp_bin: Option<PathBuf>,
    /// Alternative .env file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print title, author and downloadable formats for a URL
    Info { url: String },
    /// Download a URL into the storage root
    Download {
        url: String,
        #[arg(long, short, default_value = "best")]
        quality: String,
        #[arg(long, short, default_value = "mp4")]
        extension: String,
    },
    /// List stored downloads, newest first
    List,
    /// Remove a stored download
    Delete { file_name: String },
    /// Evict downloads older than the configured age
    Sweep {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Check that yt-dlp can be executed
    Health,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        let max_age_hours = match self.command {
            Command::Sweep { max_age_hours } => max_age_hours,
            _ => None,
        };
        RuntimeOverrides {
            storage_root: self.storage_root.clone(),
            ytdlp_bin: self.ytdlp_bin.clone(),
            env_path: self.env_file.clone(),
            max_age_hours,
            ..RuntimeOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grabtube=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    ensure_not_root("grab")?;

    let cli = Cli::parse();
    let config = resolve_runtime_config(cli.overrides())?;
    run(cli.command, &config).await
}

async fn run(command: Command, config: &RuntimeConfig) -> Result<()> {
    let extractor: Arc<dyn MediaExtractor> = Arc::new(YtDlpExtractor::from_config(config));
    let store = FileStore::from_config(config);

    match command {
        Command::Info { url } => {
            let resolver = MetadataResolver::new(extractor, config.metadata_concurrency);
            let metadata = resolver.resolve(&url).await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Download {
            url,
            quality,
            extension,
        } => {
            let executor = DownloadExecutor::new(extractor, store, config.download_concurrency);
            let stored = executor.execute(&url, &quality, &extension).await?;
            println!(
                "Saved {} ({})",
                config.storage_root.join(&stored.file_name).display(),
                stored.size_label()
            );
        }
        Command::List => {
            let files = blocking(move || store.list()).await?;
            if files.is_empty() {
                println!("No downloads in {}.", config.storage_root.display());
            }
            for file in files {
                println!(
                    "{}\t{}\t{}",
                    file.created_at.to_rfc3339(),
                    file.size_label(),
                    file.file_name
                );
            }
        }
        Command::Delete { file_name } => {
            let deleted = {
                let file_name = file_name.clone();
                blocking(move || store.delete(&file_name)).await?
            };
            if !deleted {
                bail!("{file_name} does not exist");
            }
            println!("Deleted {file_name}");
        }
        Command::Sweep { .. } => {
            let max_age = config.max_file_age;
            let removed = blocking(move || store.sweep(max_age))
                .await
                .context("sweeping expired downloads")?;
            println!(
                "Removed {removed} file(s) older than {}",
                format_age(config.max_file_age)
            );
        }
        Command::Health => {
            let version = extractor
                .probe()
                .await
                .map_err(|err| err.into_extraction_failure())
                .context("yt-dlp is not installed on the system")?;
            println!("yt-dlp {version}");
        }
    }
    Ok(())
}

fn format_age(age: Duration) -> String {
    let hours = age.as_secs() / 3600;
    if hours > 0 {
        format!("{hours}h")
    } else {
        format!("{}m", age.as_secs() / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_for(root: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig {
            storage_root: root.to_path_buf(),
            ytdlp_bin: root.join("missing-yt-dlp"),
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn download_defaults_to_best_mp4() {
        let cli = Cli::try_parse_from(["grab", "download", "https://youtu.be/x"]).unwrap();
        match cli.command {
            Command::Download {
                url,
                quality,
                extension,
            } => {
                assert_eq!(url, "https://youtu.be/x");
                assert_eq!(quality, "best");
                assert_eq!(extension, "mp4");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sweep_age_flows_into_overrides() {
        let cli = Cli::try_parse_from([
            "grab",
            "--storage-root",
            "/tmp/dl",
            "sweep",
            "--max-age-hours",
            "3",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.max_age_hours, Some(3));
        assert_eq!(overrides.storage_root, Some(PathBuf::from("/tmp/dl")));
    }

    #[tokio::test]
    async fn delete_reports_missing_file() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        fs::write(dir.path().join("video_abc.mp4"), b"x").unwrap();

        run(
            Command::Delete {
                file_name: "video_abc.mp4".into(),
            },
            &config,
        )
        .await
        .unwrap();
        assert!(!dir.path().join("video_abc.mp4").exists());

        let err = run(
            Command::Delete {
                file_name: "video_abc.mp4".into(),
            },
            &config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn health_fails_without_binary() {
        let dir = tempdir().unwrap();
        let err = run(Command::Health, &config_for(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn format_age_prefers_hours() {
        assert_eq!(format_age(Duration::from_secs(24 * 3600)), "24h");
        assert_eq!(format_age(Duration::from_secs(600)), "10m");
    }
}
