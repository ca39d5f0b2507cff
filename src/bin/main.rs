use std::{
    collections::HashMap,
    env, process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stigmer::{
    cli::{BackendAction, Cli, Commands, ConfigAction, ServerAction, parse_args},
    config::{self, BackendType, Config, ExecutionOverrides},
    constants, deploy, detect,
    error::StigmerError,
    exec,
    gateway::Backend,
    harvest,
    logs::{self, ViewOptions},
    paths::{self, Service},
    project,
    supervisor::Supervisor,
    worker,
};

fn main() {
    // Internal personalities dispatch on argv[1] before the CLI parser ever
    // sees the arguments; the parser would reject the reserved name and the
    // subprocess would die before its logging is configured.
    let mut argv = env::args_os();
    let _ = argv.next();
    if let Some(first) = argv.next() {
        match first.to_str() {
            Some(constants::INTERNAL_SERVER) => {
                process::exit(run_personality(constants::INTERNAL_SERVER, stigmer::server::run));
            }
            Some(constants::INTERNAL_WORKFLOW_RUNNER) => {
                process::exit(run_personality(
                    constants::INTERNAL_WORKFLOW_RUNNER,
                    worker::run,
                ));
            }
            _ => {}
        }
    }

    let args = parse_args();
    init_logging(&args);
    paths::init();

    if let Err(err) = dispatch(args) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

/// Runs an internal personality. The stderr banner is emitted before any
/// fallible setup so a crash always leaves a trace in the service's err log.
fn run_personality(name: &str, entry: fn() -> Result<(), StigmerError>) -> i32 {
    eprintln!(
        "stigmer {name} starting (pid {}, version {})",
        process::id(),
        env!("CARGO_PKG_VERSION")
    );
    init_personality_logging();

    match entry() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Personality logs go to stdout (redirected to the service's `.log` file)
/// as plain lines with RFC3339 UTC timestamps the log multiplexer can parse.
fn init_personality_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stdout)
        .init();
}

fn dispatch(args: Cli) -> Result<(), StigmerError> {
    match args.command {
        Commands::Server { action } => handle_server(action.unwrap_or(ServerAction::Start {
            execution_mode: None,
            sandbox_image: None,
            sandbox_auto_pull: None,
            sandbox_cleanup: None,
            sandbox_ttl: None,
        })),
        Commands::Apply { config, dry_run } => handle_apply(&config, dry_run),
        Commands::Run {
            reference,
            message,
            follow,
        } => handle_run(reference, message, follow),
        Commands::Logs {
            all,
            component,
            stderr,
            tail,
            follow,
        } => handle_logs(all, &component, stderr, tail, follow),
        Commands::Config { action } => handle_config(action),
        Commands::New { name } => handle_new(&name),
        Commands::Backend { action } => handle_backend(action),
    }
}

fn supervisor_with(overrides: ExecutionOverrides) -> Result<Supervisor, StigmerError> {
    let config = config::load_config()?;
    let execution = config::resolve_execution(&config, &overrides);
    Ok(Supervisor::new(config, execution))
}

fn handle_server(action: ServerAction) -> Result<(), StigmerError> {
    match action {
        ServerAction::Start {
            execution_mode,
            sandbox_image,
            sandbox_auto_pull,
            sandbox_cleanup,
            sandbox_ttl,
        } => {
            let supervisor = supervisor_with(ExecutionOverrides {
                mode: execution_mode,
                sandbox_image,
                auto_pull: sandbox_auto_pull,
                cleanup: sandbox_cleanup,
                ttl: sandbox_ttl,
            })?;
            supervisor.start_all()?;
            println!("Server started");
            Ok(())
        }
        ServerAction::Stop => {
            let supervisor = supervisor_with(ExecutionOverrides::default())?;
            supervisor.stop_all()?;
            println!("Server stopped");
            Ok(())
        }
        ServerAction::Restart {
            execution_mode,
            sandbox_image,
            sandbox_auto_pull,
            sandbox_cleanup,
            sandbox_ttl,
        } => {
            let supervisor = supervisor_with(ExecutionOverrides {
                mode: execution_mode,
                sandbox_image,
                auto_pull: sandbox_auto_pull,
                cleanup: sandbox_cleanup,
                ttl: sandbox_ttl,
            })?;
            supervisor.restart_all()?;
            println!("Server restarted");
            Ok(())
        }
        ServerAction::Status => {
            let supervisor = supervisor_with(ExecutionOverrides::default())?;
            for status in supervisor.status() {
                let state = if status.running { "Running" } else { "Stopped" };
                match status.holder {
                    Some(detect::Holder::Process(pid)) if status.running => {
                        println!("{:<16} {state} (pid {pid})", status.service.name());
                    }
                    Some(detect::Holder::Container(id)) if status.running => {
                        println!("{:<16} {state} (container {id})", status.service.name());
                    }
                    _ => println!("{:<16} {state}", status.service.name()),
                }
            }
            Ok(())
        }
        ServerAction::Logs { tail, follow } => handle_logs(true, &[], false, tail, follow),
    }
}

fn handle_apply(config_dir: &str, dry_run: bool) -> Result<(), StigmerError> {
    let config = config::load_config()?;
    let project_dir = std::path::Path::new(config_dir);

    if dry_run {
        let manifest = harvest::harvest(project_dir, preview_org(&config))?;
        let report = deploy::apply_dry_run(&manifest);
        print_report(&report);
        return Ok(());
    }

    let backend = connect_local_or_cloud(&config)?;
    let manifest = harvest::harvest(project_dir, &backend.org)?;
    let report = deploy::apply(&backend, &manifest)?;
    print_report(&report);
    println!("{}", report.summary());

    if report.has_failures() {
        return Err(StigmerError::Upstream(
            stigmer::error::UpstreamError::Internal(
                "one or more resources failed to deploy; re-run `stigmer apply` after fixing"
                    .into(),
            ),
        ));
    }
    Ok(())
}

fn preview_org(config: &Config) -> &str {
    match config.backend.backend_type {
        BackendType::Local => constants::LOCAL_ORG,
        BackendType::Cloud => &config.backend.cloud.organization,
    }
}

fn print_report(report: &deploy::DeployReport) {
    for result in &report.results {
        println!("{:<9} {:<24} {}", result.kind.as_str(), result.slug, result.outcome);
    }
}

/// Dials the backend, auto-starting the local daemon first when needed. The
/// connection is cached for the rest of the invocation.
fn connect_local_or_cloud(config: &Config) -> Result<Backend, StigmerError> {
    if config.backend.backend_type == BackendType::Local {
        let execution = config::resolve_execution(config, &ExecutionOverrides::default());
        Supervisor::new(config.clone(), execution).ensure_daemon()?;
    }
    stigmer::gateway::cached_backend(config)
}

fn handle_run(
    reference: Option<String>,
    message: Option<String>,
    follow: bool,
) -> Result<(), StigmerError> {
    let config = config::load_config()?;

    // Inside a project directory the latest definitions are applied first.
    let in_project = project::in_project_directory();
    if in_project {
        info!("project directory detected; applying before run");
        handle_apply(".", false)?;
    }

    let reference = match reference {
        Some(reference) => reference,
        None => {
            let cwd = env::current_dir()?;
            project::load_project(&cwd)
                .map(|manifest| manifest.name)
                .map_err(|_| StigmerError::Upstream(stigmer::error::UpstreamError::InvalidArgument(
                    "no reference given and no Stigmer.yaml in the current directory".into(),
                )))?
        }
    };

    let backend = connect_local_or_cloud(&config)?;
    let target = exec::resolve_target(&backend, &reference)?;
    info!("running {} '{}'", target.kind.as_str(), target.resource.slug);

    let execution_id =
        exec::create_execution(&backend, &target, message.as_deref(), HashMap::new())?;
    println!("Execution {execution_id} created");

    if !follow {
        return Ok(());
    }

    // Execution messages interleave with live component logs until the run
    // reaches a terminal phase.
    let stop = interrupt_flag();
    let log_stop = Arc::clone(&stop);
    let log_follower = std::thread::spawn(move || {
        let sources = logs::sources_for(&Service::all(), false);
        let mut out = std::io::stdout();
        let _ = logs::view(
            &sources,
            &ViewOptions {
                follow: true,
                tail: 0,
            },
            log_stop,
            &mut out,
        );
    });

    let streamed =
        exec::stream_messages(&backend, target.kind, &execution_id, Arc::clone(&stop));
    stop.store(true, Ordering::Relaxed);
    let _ = log_follower.join();
    let execution = streamed?;
    let phase = execution.phase();
    println!("Execution {execution_id} {}", stigmer::rpc::phase_name(phase));
    if phase == stigmer::rpc::proto::ExecutionPhase::Failed {
        return Err(StigmerError::Upstream(
            stigmer::error::UpstreamError::Internal(format!(
                "execution {execution_id} failed"
            )),
        ));
    }
    Ok(())
}

fn handle_logs(
    all: bool,
    components: &[String],
    stderr: bool,
    tail: usize,
    follow: bool,
) -> Result<(), StigmerError> {
    let config = config::load_config()?;

    let services: Vec<Service> = if all || components.is_empty() {
        Service::all().to_vec()
    } else {
        let mut resolved = Vec::new();
        for name in components {
            match Service::from_name(name) {
                Some(service) => resolved.push(service),
                None => {
                    return Err(StigmerError::Upstream(
                        stigmer::error::UpstreamError::InvalidArgument(format!(
                            "unknown component '{name}' (daemon, workflow-runner, agent-runner)"
                        )),
                    ));
                }
            }
        }
        resolved
    };

    if config.backend.backend_type == BackendType::Local {
        let execution = config::resolve_execution(&config, &ExecutionOverrides::default());
        if let Err(err) = Supervisor::new(config.clone(), execution).ensure_daemon() {
            // Logs of a stopped fleet are still viewable.
            warn!("daemon auto-start failed: {err}");
        }
    }

    let sources = logs::sources_for(&services, stderr);
    let options = ViewOptions { follow, tail };
    let stop = interrupt_flag();
    let mut stdout = std::io::stdout();
    logs::view(&sources, &options, stop, &mut stdout)
}

fn interrupt_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);
    if let Err(err) = ctrlc::set_handler(move || {
        stop_for_handler.store(true, Ordering::Relaxed);
    }) {
        warn!("cannot install interrupt handler: {err}");
    }
    stop
}

fn handle_config(action: ConfigAction) -> Result<(), StigmerError> {
    match action {
        ConfigAction::Get { key } => {
            let config = config::load_config()?;
            println!("{}", config::get_key(&config, &key)?);
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            paths::ensure_data_dir()?;
            let mut config = config::load_config()?;
            config::set_key(&mut config, &key, &value)?;
            config::save_config(&config)?;
            println!("{key} = {value}");
            Ok(())
        }
        ConfigAction::List => {
            let config = config::load_config()?;
            for key in config::CONFIG_KEYS {
                println!("{key} = {}", config::get_key(&config, key)?);
            }
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", paths::config_file().display());
            Ok(())
        }
    }
}

fn handle_new(name: &str) -> Result<(), StigmerError> {
    let dir = project::scaffold(name)?;
    println!("Created project in {}", dir.display());
    println!("Next: cd {name} && stigmer run");
    Ok(())
}

fn handle_backend(action: BackendAction) -> Result<(), StigmerError> {
    match action {
        BackendAction::Set { backend } => {
            paths::ensure_data_dir()?;
            let mut config = config::load_config()?;
            config.backend.backend_type = backend;
            config::save_config(&config)?;
            println!("Backend set to {}", backend.as_str());
            Ok(())
        }
    }
}
