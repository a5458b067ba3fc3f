use clap::{Arg, Command};
use doomsday::config::Config;
use doomsday::server::DoomsdayServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("doomsday-server")
        .version(doomsday::version::VERSION)
        .about("Tracks certificate expiry across your credential stores")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("ddayconfig.yml"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("ddayconfig.yml");

    let config = Config::from_file(config_path)
        .map_err(|e| anyhow::anyhow!("Could not load config from {}: {}", config_path, e))?;
    config.validate()?;

    init_logging(&config)?;
    tracing::info!(
        "Starting doomsday server v{} with {} backend(s)",
        doomsday::version::version(),
        config.backends.len()
    );

    let server = DoomsdayServer::new(config)?;
    server.serve().await?;

    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.server.logfile.as_deref() {
        Some(path) if !path.is_empty() => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}
