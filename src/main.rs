use clap::Parser;
use color_eyre::eyre::{Result, bail, eyre};
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use urlimage::application::ImageService;
use urlimage::domain::{KeyResolver, LoadPhase};
use urlimage::infrastructure::{AppConfig, CliArgs, Command, ConfigStore};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let store = ConfigStore::new()?;
    let mut config = store.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

async fn fetch(
    config: &AppConfig,
    url: Option<&str>,
    identifier: Option<&str>,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let service = ImageService::new(config).await?;
    let session = service.unbound_session();
    session.bind_str(url, identifier)?;

    let phase = session
        .phase_changes()
        .fold(LoadPhase::Empty, |_, phase| async move { phase })
        .await;

    match phase {
        LoadPhase::Success(image) => {
            println!(
                "{} {}x{} from {} ({})",
                image.key,
                image.width(),
                image.height(),
                image.source,
                image.content_type.as_deref().unwrap_or("unknown type")
            );
            if let Some(path) = output {
                image.image.save(path)?;
                info!(path = %path.display(), "Wrote decoded image");
            }
            Ok(())
        }
        LoadPhase::Failure(err) => Err(err.into()),
        LoadPhase::Empty => bail!("load ended without a result"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = urlimage::VERSION, "Starting urlimage");

    match &args.command {
        Command::Fetch {
            url,
            identifier,
            output,
        } => {
            fetch(
                &config,
                url.as_deref(),
                identifier.as_deref(),
                output.as_deref(),
            )
            .await?;
        }
        Command::Key { url, identifier } => {
            let key = KeyResolver::resolve_str(url.as_deref(), identifier.as_deref())
                .ok_or_else(|| eyre!("no usable url or identifier"))?;
            println!("{key}");
        }
        Command::Purge => {
            let service = ImageService::new(&config).await?;
            let removed = service.purge_expired().await?;
            println!("Removed {removed} expired entries");
        }
        Command::Clear => {
            let service = ImageService::new(&config).await?;
            service.clear().await;
            println!("Cache cleared");
        }
        Command::Stats => {
            let service = ImageService::new(&config).await?;
            println!("{}", service.stats());
        }
    }

    Ok(())
}
