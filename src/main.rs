use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vnc_agent::agent::{Action, Approver, Planner, RunPhase, RunSummary};
use vnc_agent::credentials::{
    lookup, ChainedStore, CredentialStore, Credentials, EnvironmentStore, KeyringStore,
    NetrcStore,
};
use vnc_agent::planner::default_excluded_actions;
use vnc_agent::recorder::DiskRecorder;
use vnc_agent::store::FileSessionStore;
use vnc_agent::{
    AgentService, AnthropicPlanner, Decision, ExecuteRequest, GeminiPlanner, McpServer,
    ResumeRequest, SafetyVerdict, Settings, VncConnector,
};

#[derive(Parser, Debug)]
#[command(
    name = "vnc-agent",
    version,
    about = "Drive a remote desktop over VNC with a vision-language planner"
)]
struct Cli {
    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task against a desktop
    Run(RunArgs),
    /// Approve or deny a run that is awaiting approval
    Resume(ResumeArgs),
    /// Cancel a run that is awaiting approval
    Cancel {
        #[arg(long)]
        run_id: String,
    },
    /// List runs awaiting approval
    Pending,
    /// Serve the task tools to an MCP client over stdio
    Serve {
        #[command(flatten)]
        planner: PlannerArgs,
    },
    /// Manage stored VNC credentials
    Credentials(CredentialsArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PlannerKind {
    Gemini,
    Anthropic,
}

#[derive(Args, Debug, Default)]
struct Target {
    /// Logical session handle resolved through the credential store
    #[arg(long, conflicts_with = "vnc")]
    host: Option<String>,
    /// Direct VNC address (`host::port`, `host:display`, or `host`)
    #[arg(long)]
    vnc: Option<String>,
    /// Password for --vnc
    #[arg(long, requires = "vnc")]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct PlannerArgs {
    #[arg(long, value_enum, default_value_t = PlannerKind::Gemini)]
    planner: PlannerKind,
    /// Planner actions to leave out of the tool catalogue
    #[arg(long, value_delimiter = ',')]
    excluded_actions: Option<Vec<String>>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    task: String,
    #[command(flatten)]
    target: Target,
    #[command(flatten)]
    planner: PlannerArgs,
    #[arg(long)]
    step_limit: Option<usize>,
    /// Seconds before the run is abandoned
    #[arg(long)]
    timeout: Option<u64>,
    /// Execute gated batches without asking
    #[arg(long, action = ArgAction::SetTrue)]
    no_hitl: bool,
    /// Park gated runs for `resume` instead of prompting on stdin
    #[arg(long, action = ArgAction::SetTrue)]
    defer_approval: bool,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    decision: Decision,
    #[command(flatten)]
    target: Target,
    #[command(flatten)]
    planner: PlannerArgs,
}

#[derive(Args, Debug)]
struct CredentialsArgs {
    /// Use the OS keyring instead of the credentials file
    #[arg(long)]
    keyring: bool,
    #[command(subcommand)]
    command: CredentialsCommand,
}

#[derive(Subcommand, Debug)]
enum CredentialsCommand {
    /// Store credentials for a handle
    Set {
        handle: String,
        /// VNC address for the handle
        #[arg(long)]
        address: String,
        #[arg(long, env = "VNC_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Show the address stored for a handle
    Get { handle: String },
    /// List known handles
    List,
    /// Forget a handle
    Delete { handle: String },
}

/// Prompts on the terminal for every gated batch. End of input defers.
///
/// Stdin is read on a plain thread: a cancelled prompt drops the receiver
/// and leaves the thread behind instead of holding the runtime open.
struct StdinApprover;

fn read_decision() -> Option<Decision> {
    let stdin = std::io::stdin();
    loop {
        eprint!("approve or deny? [approve/deny] ");
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => match line.parse::<Decision>() {
                Ok(decision) => return Some(decision),
                Err(e) => eprintln!("{e}"),
            },
        }
    }
}

#[async_trait]
impl Approver for StdinApprover {
    async fn decide(&self, run_id: &str, verdict: &SafetyVerdict, pending: &[Action]) -> Option<Decision> {
        {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "\n[{run_id}] approval required: {}", verdict.reason_or_default());
            for (i, action) in pending.iter().enumerate() {
                let _ = writeln!(err, "  {}. {action}", i + 1);
            }
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let _ = tx.send(read_decision());
        });
        match rx.await {
            Ok(Some(decision)) => Some(decision),
            Ok(None) | Err(_) => {
                warn!(run_id, "no answer on stdin, deferring");
                None
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

fn credential_store(settings: &Settings, target: &Target) -> (Arc<dyn CredentialStore>, Option<String>) {
    if let Some(address) = &target.vnc {
        // the direct address doubles as the handle for this invocation
        let store = EnvironmentStore::new(Some(address.clone()), target.password.clone());
        return (Arc::new(store), Some(address.clone()));
    }
    let mut stores: Vec<Arc<dyn CredentialStore>> = Vec::new();
    if settings.keyring_enabled {
        stores.push(Arc::new(KeyringStore::default()));
    }
    stores.push(Arc::new(NetrcStore::new(&settings.credentials_file)));
    stores.push(Arc::new(EnvironmentStore::from_env()));
    let chain = ChainedStore::new(stores);
    (Arc::new(chain), target.host.clone())
}

fn build_planner(settings: &Settings, args: &PlannerArgs) -> Result<Arc<dyn Planner>> {
    let excluded = args
        .excluded_actions
        .clone()
        .unwrap_or_else(default_excluded_actions);
    let planner: Arc<dyn Planner> = match args.planner {
        PlannerKind::Gemini => Arc::new(
            GeminiPlanner::new(settings.gemini.clone(), excluded)?
                .with_max_width(settings.screenshot_max_width),
        ),
        PlannerKind::Anthropic => Arc::new(
            AnthropicPlanner::new(settings.anthropic.clone(), excluded)?
                .with_max_width(settings.screenshot_max_width),
        ),
    };
    Ok(planner)
}

fn build_service(
    settings: &Settings,
    credentials: Arc<dyn CredentialStore>,
    planner: Arc<dyn Planner>,
) -> AgentService {
    AgentService::new(
        Arc::new(VncConnector::default()),
        credentials,
        planner,
        Arc::new(FileSessionStore::new(&settings.state_dir)),
    )
    .with_recorder(Arc::new(DiskRecorder::new(&settings.runs_dir)))
    .with_limits(settings.limits)
}

fn report(summary: &RunSummary) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(match summary.status {
        RunPhase::Completed => ExitCode::SUCCESS,
        RunPhase::AwaitingApproval => {
            eprintln!(
                "run {} is awaiting approval: vnc-agent resume --run-id {} --decision approve|deny",
                summary.run_id, summary.run_id
            );
            ExitCode::from(2)
        }
        _ => ExitCode::from(1),
    })
}

async fn run(settings: Settings, args: RunArgs) -> Result<ExitCode> {
    let (credentials, handle) = credential_store(&settings, &args.target);
    let Some(handle) = handle else {
        bail!("either --host or --vnc is required");
    };
    let planner = build_planner(&settings, &args.planner)?;
    let mut service = build_service(&settings, credentials, planner);
    if !args.defer_approval {
        service = service.with_approver(Arc::new(StdinApprover));
    }
    let service = Arc::new(service);

    let watcher = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for run_id in watcher.active().await {
                warn!(%run_id, "interrupted, cancelling");
                let _ = watcher.cancel(&run_id).await;
            }
        }
    });

    let req = ExecuteRequest {
        session_handle: handle,
        task: args.task,
        step_limit: args.step_limit,
        timeout_seconds: args.timeout,
        hitl_enabled: !args.no_hitl,
    };
    let summary = service.execute(req).await?;
    report(&summary)
}

async fn serve(settings: Settings, args: PlannerArgs) -> Result<ExitCode> {
    let (credentials, _) = credential_store(&settings, &Target::default());
    let planner = build_planner(&settings, &args)?;
    let service = build_service(&settings, credentials, planner);
    let server = McpServer::new(service, Arc::new(DiskRecorder::new(&settings.runs_dir)));
    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("mcp session failed")?;
    Ok(ExitCode::SUCCESS)
}

async fn resume(settings: Settings, args: ResumeArgs) -> Result<ExitCode> {
    let (credentials, _) = credential_store(&settings, &args.target);
    let planner = build_planner(&settings, &args.planner)?;
    let service = build_service(&settings, credentials, planner);
    let summary = service
        .resume(ResumeRequest {
            run_id: args.run_id,
            decision: args.decision,
        })
        .await?;
    report(&summary)
}

async fn credentials(settings: Settings, args: CredentialsArgs) -> Result<ExitCode> {
    let netrc = NetrcStore::new(&settings.credentials_file);
    let (store, location): (Box<dyn CredentialStore>, String) = if args.keyring {
        (Box::new(KeyringStore::default()), "the OS keyring".into())
    } else {
        let location = netrc.path().display().to_string();
        (Box::new(netrc), location)
    };
    match args.command {
        CredentialsCommand::Set {
            handle,
            address,
            password,
        } => {
            store.set(&handle, &Credentials { address, password }).await?;
            println!("stored credentials for {handle} in {location}");
        }
        CredentialsCommand::Get { handle } => {
            let creds = lookup(store.as_ref(), &handle).await?;
            println!(
                "{handle}: {} (password {})",
                creds.address,
                if creds.password.is_some() { "set" } else { "not set" }
            );
        }
        CredentialsCommand::List => {
            if args.keyring {
                eprintln!("the OS keyring cannot list its entries");
            }
            for handle in store.list_hosts().await? {
                println!("{handle}");
            }
        }
        CredentialsCommand::Delete { handle } => {
            if !store.delete(&handle).await? {
                bail!("no credentials stored for {handle} in {location}");
            }
            println!("deleted {handle}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = Settings::from_env();
    info!(runs_dir = %settings.runs_dir.display(), "vnc-agent starting");

    match cli.command {
        Commands::Run(args) => run(settings, args).await,
        Commands::Resume(args) => resume(settings, args).await,
        Commands::Cancel { run_id } => {
            // closing a parked run never connects or plans
            let service = build_service(
                &settings,
                Arc::new(EnvironmentStore::default()),
                Arc::new(NoPlanner),
            );
            match service.cancel(&run_id).await? {
                Some(summary) => report(&summary),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Commands::Pending => {
            let service = build_service(
                &settings,
                Arc::new(EnvironmentStore::default()),
                Arc::new(NoPlanner),
            );
            let pending = service.pending().await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { planner } => serve(settings, planner).await,
        Commands::Credentials(cmd) => credentials(settings, cmd)
            .await
            .context("credential command failed"),
    }
}

/// Stands in where a command never reaches the planner.
struct NoPlanner;

#[async_trait]
impl Planner for NoPlanner {
    async fn propose(
        &self,
        _task: &str,
        _history: &[vnc_agent::agent::HistoryEntry],
        _screenshot: &vnc_agent::agent::Screenshot,
    ) -> Result<vnc_agent::agent::Proposal, vnc_agent::agent::PlannerError> {
        Err(vnc_agent::agent::PlannerError::Malformed(
            "no planner configured for this command".into(),
        ))
    }
}
