use clap::{ArgAction, Parser, Subcommand};
use statewalk::{
    COMMAND_PARAM, CommandTestExecutor, InterruptFlag, NoopTestExecutor, OutcomeTag, Restrictions,
    RunConfig, RuntimeEvent, RuntimeEventKind, RuntimeEventSink, SETUP_LIST_FILE_NAME, TestExecutor,
    TestGraph, TraversalResult, TraversalRunner, apply_setup_list, load_graph_dot,
    parse_setup_list, render_dot, runtime_event_channel, save_setup_list,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "statewalk")]
#[command(about = "Traverse a test dependency graph, reusing and cleaning object states")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Visualize(VisualizeArgs),
    SetupList(SetupListArgs),
    InspectSetupList(InspectSetupListArgs),
}

#[derive(clap::Args, Debug)]
struct GraphArgs {
    #[arg(long)]
    dot_file: Option<PathBuf>,
    #[arg(long)]
    dot_source: Option<String>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    graph: GraphArgs,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    logs_root: Option<PathBuf>,
    /// Command line restriction or override such as `only=quicktest` or `mem=4096`.
    /// Object selection with `vms=` is validated but does not narrow the run.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// Shell command used for nodes without their own `command` parameter
    #[arg(long)]
    command: Option<String>,
    /// Per-node command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    max_steps: Option<u64>,
    #[arg(long, action = ArgAction::SetTrue)]
    visualize_steps: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct VisualizeArgs {
    #[command(flatten)]
    graph: GraphArgs,
}

#[derive(clap::Args, Debug)]
struct SetupListArgs {
    #[command(flatten)]
    graph: GraphArgs,
    /// Directory receiving the setup list file
    #[arg(long)]
    logs_root: PathBuf,
}

#[derive(clap::Args, Debug)]
struct InspectSetupListArgs {
    #[arg(long)]
    setup_list: PathBuf,
    /// Also check the list against this graph
    #[arg(long)]
    dot_file: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Visualize(args) => visualize_command(args),
        Commands::SetupList(args) => setup_list_command(args),
        Commands::InspectSetupList(args) => inspect_setup_list_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let mut graph = load_graph(&args.graph)?;
    let param_str = restriction_params(&graph, &args.params)?;

    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);

    let interrupt = InterruptFlag::new();
    let signal_flag = interrupt.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, stopping after the current node");
            signal_flag.interrupt();
        }
    });

    let executor = build_executor(&graph, args.command, args.timeout);
    let run_result = TraversalRunner
        .run(
            &mut graph,
            RunConfig {
                run_id: args.run_id,
                param_str,
                logs_root: args.logs_root,
                executor,
                events: event_sink,
                interrupt,
                max_steps: args.max_steps,
                visualize_steps: args.visualize_steps,
                ..RunConfig::default()
            },
        )
        .await;
    signal_task.abort();

    // the sink is dropped with the config, so the printer drains and ends
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }
    let run_result = run_result.map_err(|error| error.to_string())?;

    print_run_summary(&run_result);
    Ok(exit_code_for_result(&run_result))
}

fn visualize_command(args: VisualizeArgs) -> Result<ExitCode, String> {
    let graph = load_graph(&args.graph)?;
    print!("{}", render_dot(&graph));
    Ok(ExitCode::SUCCESS)
}

fn setup_list_command(args: SetupListArgs) -> Result<ExitCode, String> {
    let graph = load_graph(&args.graph)?;
    let path = args.logs_root.join(SETUP_LIST_FILE_NAME);
    save_setup_list(&graph, &path).map_err(|error| error.to_string())?;
    println!("setup_list: {}", path.display());
    println!("nodes: {}", graph.node_count());
    Ok(ExitCode::SUCCESS)
}

fn inspect_setup_list_command(args: InspectSetupListArgs) -> Result<ExitCode, String> {
    let source = std::fs::read_to_string(&args.setup_list).map_err(|error| {
        format!(
            "failed reading setup list '{}': {error}",
            args.setup_list.display()
        )
    })?;
    let entries = parse_setup_list(&source).map_err(|error| error.to_string())?;

    if let Some(dot_file) = args.dot_file.as_deref() {
        let mut graph = load_graph_dot(&read_dot_file(dot_file)?).map_err(|e| e.to_string())?;
        apply_setup_list(&mut graph, &entries).map_err(|e| e.to_string())?;
    }

    if args.json {
        let entries: Vec<_> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.name,
                    "should_run": entry.should_run,
                    "should_clean": entry.should_clean,
                })
            })
            .collect();
        let json = serde_json::to_string_pretty(&serde_json::json!({
            "setup_list": args.setup_list.display().to_string(),
            "entries": entries,
        }))
        .map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("setup_list: {}", args.setup_list.display());
        println!("entries: {}", entries.len());
        println!(
            "should_run: {}",
            entries.iter().filter(|entry| entry.should_run).count()
        );
        println!(
            "should_clean: {}",
            entries.iter().filter(|entry| entry.should_clean).count()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn load_graph(args: &GraphArgs) -> Result<TestGraph, String> {
    let source = load_dot_source(args.dot_file.as_deref(), args.dot_source.as_deref())?;
    load_graph_dot(&source).map_err(|error| error.to_string())
}

fn load_dot_source(dot_file: Option<&Path>, dot_source: Option<&str>) -> Result<String, String> {
    match (dot_file, dot_source) {
        (Some(_), Some(_)) => Err("provide only one of --dot-file or --dot-source".to_string()),
        (None, None) => Err("one of --dot-file or --dot-source is required".to_string()),
        (Some(path), None) => read_dot_file(path),
        (None, Some(source)) => Ok(source.to_string()),
    }
}

fn read_dot_file(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("failed reading DOT file '{}': {e}", path.display()))
}

/// Parses `--param` tokens against the graph objects and returns the
/// override block passed to every resolved node.
fn restriction_params(graph: &TestGraph, tokens: &[String]) -> Result<String, String> {
    if tokens.is_empty() {
        return Ok(String::new());
    }
    let available_vms: Vec<String> = graph
        .objects()
        .map(|(_, object)| object.name.clone())
        .collect();
    let restrictions = Restrictions::from_cmd(tokens, &available_vms, &graph.params)
        .map_err(|error| error.to_string())?;
    restrictions
        .ensure_no_internal_selection(graph.nodes().map(|(_, node)| node.params.name()))
        .map_err(|error| error.to_string())?;
    if tokens.iter().any(|token| token.starts_with("vms=")) {
        warn!(
            "Object selection vms={} is validated but ignored by run, all graph objects stay in use",
            restrictions.selected_vms.join(",")
        );
    }
    Ok(restrictions.param_str)
}

fn build_executor(
    graph: &TestGraph,
    command: Option<String>,
    timeout: Option<u64>,
) -> Arc<dyn TestExecutor> {
    let has_graph_commands = graph.params.get(COMMAND_PARAM).is_some()
        || graph
            .nodes()
            .any(|(_, node)| node.params.get(COMMAND_PARAM).is_some());
    if command.is_none() && !has_graph_commands {
        info!("No test command configured, nodes will pass without running");
        return Arc::new(NoopTestExecutor);
    }

    let mut executor = CommandTestExecutor::new(command);
    if let Some(seconds) = timeout {
        executor = executor.with_timeout(Duration::from_secs(seconds));
    }
    Arc::new(executor)
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &RuntimeEventKind) -> &'static str {
    match kind {
        RuntimeEventKind::Traversal(_) => "traversal",
        RuntimeEventKind::Node(_) => "node",
        RuntimeEventKind::Task(_) => "task",
        RuntimeEventKind::Progress(_) => "progress",
    }
}

fn print_run_summary(result: &TraversalResult) {
    println!("run_id: {}", result.run_id);
    println!(
        "tags: {}",
        result
            .tags
            .iter()
            .map(|tag| tag.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "progress: {}/{} ({:.1}%)",
        result.progress.finished,
        result.progress.total,
        result.progress.percent()
    );
    println!("cancelled: {}", result.cancelled);
    println!("executed: {}", result.executed.join(", "));
    println!("failed: {}", result.failed.join(", "));
    println!("cleaned: {}", result.cleaned.join(", "));
}

fn exit_code_for_result(result: &TraversalResult) -> ExitCode {
    if result.is_interrupted() {
        ExitCode::from(130)
    } else if result.tags.contains(&OutcomeTag::TestsFailed) {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
