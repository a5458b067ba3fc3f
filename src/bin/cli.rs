use chrono::{Duration, Utc};
use clap::{Arg, ArgMatches, Command};
use doomsday::client::DoomsdayClient;
use doomsday::config::{ClientConfig, ClientTarget};
use doomsday::duration::DurationParser;
use doomsday::types::CacheFilter;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = Command::new("doomsday")
        .version(doomsday::version::VERSION)
        .about("CLI for the doomsday certificate-expiry server")
        .subcommand(
            Command::new("target")
                .about("Set the target doomsday server")
                .arg(Arg::new("name").required(true).help("Target name"))
                .arg(Arg::new("address").required(true).help("Server address"))
                .arg(
                    Arg::new("skip-verify")
                        .short('k')
                        .long("skip-verify")
                        .action(clap::ArgAction::SetTrue)
                        .help("Skip TLS verification when talking to this target"),
                ),
        )
        .subcommand(Command::new("targets").about("List configured targets"))
        .subcommand(
            Command::new("login")
                .about("Authenticate against the current target")
                .arg(Arg::new("username").short('u').long("username"))
                .arg(Arg::new("password").short('p').long("password")),
        )
        .subcommand(
            Command::new("list")
                .about("List tracked certificates, soonest expiry first")
                .arg(
                    Arg::new("beyond")
                        .long("beyond")
                        .help("Only certificates expiring beyond this duration (e.g. 2d12h)"),
                )
                .arg(
                    Arg::new("within")
                        .long("within")
                        .help("Only certificates expiring within this duration (e.g. 30d)"),
                ),
        )
        .subcommand(Command::new("refresh").about("Ask the server to refresh all backends"))
        .subcommand(Command::new("info").about("Show server version and auth type"))
        .subcommand(Command::new("scheduler").about("Show the scheduler's tasks and workers"));

    match app.get_matches().subcommand() {
        Some(("target", matches)) => handle_target(matches),
        Some(("targets", _)) => handle_targets(),
        Some(("login", matches)) => handle_login(matches).await,
        Some(("list", matches)) => handle_list(matches).await,
        Some(("refresh", _)) => handle_refresh().await,
        Some(("info", _)) => handle_info().await,
        Some(("scheduler", _)) => handle_scheduler().await,
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn client() -> anyhow::Result<DoomsdayClient> {
    let config = ClientConfig::load()?;
    let target = config
        .current_target()
        .ok_or_else(|| anyhow::anyhow!("No target set (use `doomsday target')"))?;
    Ok(DoomsdayClient::new(
        &target.address,
        target.skip_verify,
        target.token.clone(),
    )?)
}

fn handle_target(matches: &ArgMatches) -> anyhow::Result<()> {
    let name = matches
        .get_one::<String>("name")
        .expect("clap enforces name");
    let address = matches
        .get_one::<String>("address")
        .expect("clap enforces address");

    let mut config = ClientConfig::load()?;
    config.targets.insert(
        name.clone(),
        ClientTarget {
            name: name.clone(),
            address: address.clone(),
            skip_verify: matches.get_flag("skip-verify"),
            token: None,
        },
    );
    config.current_target = Some(name.clone());
    config.save()?;

    println!("Now targeting `{}' at {}", name, address);
    Ok(())
}

fn handle_targets() -> anyhow::Result<()> {
    let config = ClientConfig::load()?;
    if config.targets.is_empty() {
        println!("No targets configured. Use `doomsday target' to add one.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct TargetRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Address")]
        address: String,
        #[tabled(rename = "Current")]
        current: String,
    }

    let mut rows: Vec<TargetRow> = config
        .targets
        .values()
        .map(|target| TargetRow {
            name: target.name.clone(),
            address: target.address.clone(),
            current: if config.current_target.as_deref() == Some(target.name.as_str()) {
                "*".to_string()
            } else {
                String::new()
            },
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}", Table::new(rows).with(Style::sharp()));
    Ok(())
}

async fn handle_login(matches: &ArgMatches) -> anyhow::Result<()> {
    let username = match matches.get_one::<String>("username") {
        Some(username) => username.clone(),
        None => {
            let mut input = String::new();
            eprint!("Username: ");
            std::io::stdin().read_line(&mut input)?;
            input.trim().to_string()
        }
    };
    let password = match matches.get_one::<String>("password") {
        Some(password) => password.clone(),
        None => rpassword::prompt_password("Password: ")?,
    };

    let mut client = client()?;
    let token = client.authenticate(&username, &password).await?;

    let mut config = ClientConfig::load()?;
    if let Some(name) = config.current_target.clone() {
        if let Some(target) = config.targets.get_mut(&name) {
            target.token = Some(token);
        }
    }
    config.save()?;

    println!("Logged in");
    Ok(())
}

async fn handle_list(matches: &ArgMatches) -> anyhow::Result<()> {
    let mut filter = CacheFilter::default();
    if let Some(beyond) = matches.get_one::<String>("beyond") {
        filter.beyond = Some(DurationParser::parse(beyond)?);
    }
    if let Some(within) = matches.get_one::<String>("within") {
        filter.within = Some(DurationParser::parse(within)?);
    }

    let cache = client()?.cache().await?;
    let items = filter.apply(cache.content);

    if items.is_empty() {
        println!("Nothing to show");
        return Ok(());
    }

    #[derive(Tabled)]
    struct CertRow {
        #[tabled(rename = "Common Name")]
        common_name: String,
        #[tabled(rename = "Expires In")]
        expires_in: String,
        #[tabled(rename = "Paths")]
        paths: String,
    }

    let now = Utc::now().timestamp();
    let rows: Vec<CertRow> = items
        .into_iter()
        .map(|item| {
            let remaining = item.not_after - now;
            CertRow {
                common_name: item.common_name,
                expires_in: if remaining <= 0 {
                    "EXPIRED".to_string()
                } else {
                    DurationParser::format(Duration::seconds(remaining))
                },
                paths: item
                    .paths
                    .iter()
                    .map(|path| format!("{}: {}", path.backend, path.location))
                    .collect::<Vec<_>>()
                    .join("\n"),
            }
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::sharp()));
    Ok(())
}

async fn handle_refresh() -> anyhow::Result<()> {
    client()?.refresh().await?;
    println!("Refresh queued");
    Ok(())
}

async fn handle_info() -> anyhow::Result<()> {
    let info = client()?.info().await?;
    println!("Version:   {}", info.version);
    println!("Auth type: {}", info.auth_type);
    Ok(())
}

async fn handle_scheduler() -> anyhow::Result<()> {
    let state = client()?.scheduler().await?;

    #[derive(Tabled)]
    struct TaskRow {
        #[tabled(rename = "ID")]
        id: u64,
        #[tabled(rename = "Backend")]
        backend: String,
        #[tabled(rename = "Kind")]
        kind: String,
        #[tabled(rename = "Reason")]
        reason: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "At")]
        at: String,
        #[tabled(rename = "Worker")]
        worker: String,
    }

    let task_row = |task: &doomsday::types::SchedulerTask| TaskRow {
        id: task.id,
        backend: task.backend.clone(),
        kind: task.kind.clone(),
        reason: task.reason.clone(),
        state: task.state.clone(),
        at: chrono::DateTime::from_timestamp(task.at, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| task.at.to_string()),
        worker: task
            .worker
            .map(|id| id.to_string())
            .unwrap_or_default(),
    };

    let mut rows: Vec<TaskRow> = state.running.iter().map(task_row).collect();
    rows.extend(state.pending.iter().map(task_row));

    println!("Tasks:");
    println!("{}", Table::new(rows).with(Style::sharp()));

    #[derive(Tabled)]
    struct WorkerRow {
        #[tabled(rename = "ID")]
        id: usize,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "Since")]
        since: String,
    }

    let workers: Vec<WorkerRow> = state
        .workers
        .iter()
        .map(|worker| WorkerRow {
            id: worker.id,
            state: worker.state.clone(),
            since: chrono::DateTime::from_timestamp(worker.state_at, 0)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| worker.state_at.to_string()),
        })
        .collect();

    println!("Workers:");
    println!("{}", Table::new(workers).with(Style::sharp()));
    Ok(())
}
