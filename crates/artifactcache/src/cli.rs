//! Exposes the command line application.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use artifactcache_service::ArtifactCacheService;
use artifactcache_service::config::Config;
use artifactcache_service::metrics;
use artifactcache_service::types::{ModuleMetadata, RequestId};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::logging;

/// Artifact cache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch an artifact, storing a freshly compiled one on a miss.
    Fetch(FetchArgs),

    /// Remove cache entries stored within a time range.
    Clear(ClearArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Path to a JSON file describing the module the artifact is compiled from.
    #[arg(long, value_name = "FILE")]
    metadata: PathBuf,

    /// The client the request is made for.
    #[arg(long, default_value_t = 0)]
    client: u32,

    /// The scope of the request within its client.
    #[arg(long, default_value_t = 0)]
    scope: u32,

    /// The compiled artifact to hand over on a miss.
    #[arg(long, value_name = "FILE")]
    compiled: Option<PathBuf>,

    /// Never store the compiled artifact.
    #[arg(long)]
    no_store: bool,

    /// Where to write the artifact. Defaults to stdout.
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ClearArgs {
    /// Start of the range as RFC 3339 timestamp. Defaults to the unix epoch.
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<SystemTime>,

    /// Exclusive end of the range as RFC 3339 timestamp. Defaults to now.
    #[arg(long, value_parser = parse_timestamp)]
    end: Option<SystemTime>,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "artifactcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_timestamp(value: &str) -> Result<SystemTime, humantime::TimestampError> {
    humantime::parse_rfc3339_weak(value)
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point, the runtime is only built below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("artifactcache")
        .enable_all()
        .build()?;
    let service = ArtifactCacheService::new(config.cache, runtime.handle().to_owned());

    let result = runtime.block_on(async {
        match cli.command {
            Command::Fetch(args) => fetch(&service, args).await.context("failed to fetch artifact"),
            Command::Clear(args) => clear(&service, args).await.context("failed to clear cache"),
        }
    });

    let outcome = runtime.block_on(service.shutdown());
    tracing::debug!(?outcome, "Artifact cache shut down");

    result
}

async fn read_metadata(path: &Path) -> Result<ModuleMetadata> {
    let contents = tokio::fs::read(path)
        .await
        .context("failed to read module metadata")?;
    serde_json::from_slice(&contents).context("failed to parse module metadata")
}

async fn fetch(service: &ArtifactCacheService, args: FetchArgs) -> Result<()> {
    let metadata = read_metadata(&args.metadata).await?;
    let id = RequestId::new(args.client, args.scope);

    let artifact = service
        .request_artifact(id, !args.no_store, &metadata)
        .await?;

    if artifact.is_hit {
        tracing::info!(%id, "Artifact cache hit");
    } else {
        let Some(ref compiled) = args.compiled else {
            service.finish_artifact(id, false);
            anyhow::bail!("artifact is not cached and no compiled artifact was given");
        };

        tracing::info!(%id, "Artifact cache miss");
        let result = copy_compiled(compiled, &artifact.file).await;
        service.finish_artifact(id, result.is_ok());
        result?;
        wait_for_store(service, id).await;
    }

    write_output(artifact.file, args.output.as_deref()).await
}

/// Hands the compiled artifact over to the cache through the delivered file.
async fn copy_compiled(compiled: &Path, delivered: &File) -> Result<()> {
    let mut source = tokio::fs::File::open(compiled)
        .await
        .context("failed to open compiled artifact")?;
    let mut target = tokio::fs::File::from_std(delivered.try_clone()?);
    let copied = tokio::io::copy(&mut source, &mut target).await?;
    target.flush().await?;
    tracing::debug!(bytes = copied, "Copied compiled artifact");
    Ok(())
}

/// Waits until the finished request left the coordinator, which is once its artifact is stored.
async fn wait_for_store(service: &ArtifactCacheService, id: RequestId) {
    while service.is_pending(id).await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn write_output(artifact: File, output: Option<&Path>) -> Result<()> {
    let mut artifact = tokio::fs::File::from_std(artifact);
    artifact.rewind().await?;

    let written = match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .context("failed to create output file")?;
            let written = tokio::io::copy(&mut artifact, &mut file).await?;
            file.flush().await?;
            written
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let written = tokio::io::copy(&mut artifact, &mut stdout).await?;
            stdout.flush().await?;
            written
        }
    };

    tracing::debug!(bytes = written, "Wrote artifact");
    Ok(())
}

async fn clear(service: &ArtifactCacheService, args: ClearArgs) -> Result<()> {
    let start = args.start.unwrap_or(SystemTime::UNIX_EPOCH);
    let end = args.end.unwrap_or_else(SystemTime::now);
    if end < start {
        anyhow::bail!("the end of the range lies before its start");
    }

    let removed = service.clear_entries_between(start, end).await?;
    tracing::info!(removed, "Cleared cache entries");
    println!("{removed}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use artifactcache_service::caching::{BackendConfig, FilesystemBackendConfig};
    use artifactcache_service::config::CacheConfig;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "artifactcache",
            "fetch",
            "--metadata",
            "module.json",
            "--client",
            "3",
            "--compiled",
            "app.nexe",
            "-c",
            "config.yml",
        ])
        .unwrap();

        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch command");
        };
        assert_eq!(args.client, 3);
        assert_eq!(args.scope, 0);
        assert_eq!(args.compiled.as_deref(), Some(Path::new("app.nexe")));
        assert!(!args.no_store);
        assert!(args.output.is_none());
    }

    #[test]
    fn test_parse_clear() {
        let cli = Cli::try_parse_from([
            "artifactcache",
            "clear",
            "--start",
            "2024-01-01T00:00:00Z",
        ])
        .unwrap();

        let Command::Clear(args) = cli.command else {
            panic!("expected clear command");
        };
        let start = args.start.unwrap();
        let since_epoch = start.duration_since(SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(since_epoch.as_secs(), 1_704_067_200);
        assert!(args.end.is_none());

        let err = Cli::try_parse_from(["artifactcache", "clear", "--end", "yesterday"]);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_fetch_stores_compiled_artifact() {
        artifactcache_test::setup();
        let dir = artifactcache_test::tempdir();
        let config = CacheConfig {
            backend: BackendConfig::Filesystem(FilesystemBackendConfig {
                path: dir.path().join("cache"),
            }),
            ..Default::default()
        };
        let service = ArtifactCacheService::new(config, tokio::runtime::Handle::current());

        // another client keeps compiling while the fetch waits for its store
        let other = ModuleMetadata {
            url: "https://example.com/other.pexe".into(),
            ..Default::default()
        };
        service
            .request_artifact(RequestId::new(2, 1), true, &other)
            .await
            .unwrap();

        let metadata = dir.path().join("module.json");
        fs::write(
            &metadata,
            r#"{"url": "https://example.com/app.pexe", "abi_version": 2, "etag": "v1"}"#,
        )
        .unwrap();
        let compiled = dir.path().join("app.nexe");
        fs::write(&compiled, b"compiled app").unwrap();

        let args = |compiled: Option<PathBuf>, output: &str| FetchArgs {
            metadata: metadata.clone(),
            client: 1,
            scope: 1,
            compiled,
            no_store: false,
            output: Some(dir.path().join(output)),
        };

        fetch(&service, args(Some(compiled), "miss.nexe"))
            .await
            .unwrap();
        assert_eq!(fs::read(dir.path().join("miss.nexe")).unwrap(), b"compiled app");

        // the second fetch is served from the cache without a compiled artifact
        fetch(&service, args(None, "hit.nexe")).await.unwrap();
        assert_eq!(fs::read(dir.path().join("hit.nexe")).unwrap(), b"compiled app");
        assert_eq!(service.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn test_fetch_miss_without_compiled_artifact() {
        artifactcache_test::setup();
        let dir = artifactcache_test::tempdir();
        let service = ArtifactCacheService::new(
            CacheConfig::default(),
            tokio::runtime::Handle::current(),
        );

        let metadata = dir.path().join("module.json");
        fs::write(&metadata, r#"{"url": "https://example.com/app.pexe"}"#).unwrap();

        let args = FetchArgs {
            metadata,
            client: 1,
            scope: 1,
            compiled: None,
            no_store: false,
            output: Some(dir.path().join("out.nexe")),
        };
        assert!(fetch(&service, args).await.is_err());

        let stats = service.stats().await;
        assert_eq!(stats.pending, 0);
    }
}
