use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jobmap::config::{default_root_dir, EngineConfig, ExecutionMode, SandboxConfig};
use jobmap::dashboard::{self, ApiResponse, DashboardState, MapDetail, MapSummary, SubmitMapRequest};
use jobmap::engine::Engine;
use jobmap::scheduler::ComponentStatus;
use jobmap::shutdown::{install_shutdown_handler, shutdown_engine_on};
use jobmap::utils;

#[derive(Parser, Debug)]
#[command(name = "jobmap")]
#[command(version)]
#[command(about = "Map shell commands over inputs as batches of local jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the engine and its HTTP API until interrupted
    Serve(ServeArgs),

    /// Map management commands
    Map {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: MapCommands,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Directory holding map data (default: $JOBMAP_DIR or ~/.jobmap)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Number of components that may run at the same time
    #[arg(long, default_value = "4")]
    slots: usize,

    /// Memory budget shared by running components, in MB
    #[arg(long, default_value = "4096")]
    memory: u64,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    api_port: u16,

    /// Run components in Docker containers instead of local shells
    #[arg(long)]
    docker: bool,

    /// Docker image to use with --docker
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum MapCommands {
    /// Map a shell command over inputs; each input is passed as $1
    Submit {
        /// The command to run (e.g., 'echo $(($1 * 2))')
        command: String,
        /// Inputs, one component each
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Tag for the map (random and transient if omitted)
        #[arg(long, short)]
        tag: Option<String>,
        /// Memory each component needs, in MB
        #[arg(long)]
        memory: Option<u64>,
        /// Disk each component needs, in KB
        #[arg(long)]
        disk: Option<u64>,
    },
    /// List all maps
    List,
    /// Show the status of one map
    Status { tag: String },
    /// Hold every component of a map
    Hold { tag: String },
    /// Release held components
    Release { tag: String },
    /// Pause running components
    Pause { tag: String },
    /// Resume paused components
    Resume { tag: String },
    /// Send running components back to the queue
    Vacate { tag: String },
    /// Rerun every component of a finished map
    Rerun { tag: String },
    /// Remove a map and all of its data
    Remove {
        tag: String,
        /// Delete data without waiting for components to stop
        #[arg(long)]
        force: bool,
    },
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    let execution = if args.docker {
        ExecutionMode::Docker
    } else {
        ExecutionMode::Local
    };
    let mut config = EngineConfig::new(args.root.unwrap_or_else(default_root_dir))
        .with_slots(args.slots)
        .with_memory_mb(args.memory)
        .with_execution(execution)
        .with_api_addr(api_addr);
    config.sandbox = SandboxConfig {
        image: args.image,
        ..SandboxConfig::default()
    };

    let engine = Engine::start(config).await?;
    let shutdown = install_shutdown_handler();

    // Pick up maps left on disk by an earlier run
    let recovered = engine.load_maps().await?;
    tracing::info!(maps = recovered.len(), "Loaded existing maps");

    let api = tokio::spawn(dashboard::run_dashboard(
        api_addr,
        DashboardState {
            engine: engine.clone(),
        },
        shutdown.clone(),
    ));

    shutdown_engine_on(shutdown, engine).await;
    if let Err(e) = api.await {
        tracing::error!(error = %e, "API server task failed");
    }

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/maps{}", self.base, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let response = request.send().await?;
        let status = response.status();
        let body: ApiResponse<T> = response.json().await?;
        match (body.success, body.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(body
                .error
                .unwrap_or_else(|| format!("request failed with status {}", status))
                .into()),
        }
    }
}

fn print_summaries(summaries: &[MapSummary]) {
    if summaries.is_empty() {
        println!("No maps found.");
        return;
    }

    let mut headers = vec!["Tag"];
    headers.extend(ComponentStatus::display_statuses().iter().map(|s| s.as_str()));
    let rows: Vec<Vec<String>> = summaries
        .iter()
        .map(|summary| {
            let mut row = vec![summary.tag.clone()];
            row.extend(
                ComponentStatus::display_statuses()
                    .iter()
                    .map(|status| summary.counts[*status].to_string()),
            );
            row
        })
        .collect();
    println!("{}", utils::table(&headers, &rows, &["Tag"]));
}

fn print_detail(detail: &MapDetail) {
    println!("{}", detail.status);
    if !detail.holds.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = detail
            .holds
            .iter()
            .map(|(component, hold)| {
                vec![component.to_string(), hold.code.to_string(), hold.reason.clone()]
            })
            .collect();
        println!(
            "{}",
            utils::table(
                &["Component", "Code", "Hold Reason"],
                &rows,
                &["Component", "Hold Reason"]
            )
        );
    }
}

async fn handle_map_command(
    client: &ClientArgs,
    command: MapCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = ApiClient::new(&client.addr);

    match command {
        MapCommands::Submit {
            command,
            inputs,
            tag,
            memory,
            disk,
        } => {
            let request = SubmitMapRequest {
                tag,
                command,
                inputs,
                args: Vec::new(),
                request_memory_mb: memory,
                request_disk_kb: disk,
            };
            let summary: MapSummary = api
                .send(api.http.post(api.url("")).json(&request))
                .await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Table => {
                    println!("Map submitted successfully!");
                    println!("Tag:        {}", summary.tag);
                    println!("Components: {}", summary.num_components);
                }
            }
        }
        MapCommands::List => {
            let summaries: Vec<MapSummary> = api.send(api.http.get(api.url(""))).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
                OutputFormat::Table => print_summaries(&summaries),
            }
        }
        MapCommands::Status { tag } => {
            let detail: MapDetail = api
                .send(api.http.get(api.url(&format!("/{}", tag))))
                .await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
                OutputFormat::Table => print_detail(&detail),
            }
        }
        MapCommands::Remove { tag, force } => {
            let removed: String = api
                .send(
                    api.http
                        .delete(api.url(&format!("/{}", tag)))
                        .query(&[("force", force)]),
                )
                .await?;
            match client.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "removed": removed }))
                }
                OutputFormat::Table => println!("Removed map {}", removed),
            }
        }
        action => {
            let (tag, verb) = match action {
                MapCommands::Hold { tag } => (tag, "hold"),
                MapCommands::Release { tag } => (tag, "release"),
                MapCommands::Pause { tag } => (tag, "pause"),
                MapCommands::Resume { tag } => (tag, "resume"),
                MapCommands::Vacate { tag } => (tag, "vacate"),
                MapCommands::Rerun { tag } => (tag, "rerun"),
                _ => return Ok(()),
            };
            let summary: MapSummary = api
                .send(api.http.post(api.url(&format!("/{}/{}", tag, verb))))
                .await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Table => print_summaries(std::slice::from_ref(&summary)),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Map { client, command } => {
            if let Err(e) = handle_map_command(&client, command).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
