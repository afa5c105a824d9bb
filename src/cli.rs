use crate::config::engine::EngineConfig;
use crate::config::types::{
    ContainerSpec, EngineError, IsolationLevel, ResourceLimits, RestartPolicy, VolumeBinding,
    EXIT_INTERNAL, EXIT_OK, EXIT_VALIDATION,
};
use crate::engine::export::{ExportBundle, ExportTarget};
use crate::engine::Engine;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Docker-free container engine for bot workers", long_about = None)]
struct Cli {
    /// Storage root holding the registry, logs and sandboxes
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct LimitArgs {
    /// Memory limit in MB
    #[arg(long)]
    memory_limit: Option<u64>,
    /// CPU limit in percent of one core
    #[arg(long)]
    cpu_limit: Option<u32>,
    /// Maximum number of processes
    #[arg(long)]
    max_processes: Option<u32>,
    /// Block IO limit in MB/s
    #[arg(long)]
    io_limit: Option<u64>,
}

impl LimitArgs {
    /// Overlay the given flags on `base`
    fn apply_to(&self, base: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_limit.or(base.memory_mb),
            cpu_percent: self.cpu_limit.or(base.cpu_percent),
            max_processes: self.max_processes.or(base.max_processes),
            io_bandwidth: self.io_limit.or(base.io_bandwidth),
        }
    }

    fn is_empty(&self) -> bool {
        self.memory_limit.is_none()
            && self.cpu_limit.is_none()
            && self.max_processes.is_none()
            && self.io_limit.is_none()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new container
    Create {
        name: String,
        /// Executable to run
        image: PathBuf,
        #[command(flatten)]
        limits: LimitArgs,
        /// Isolation level: minimal, standard or strict
        #[arg(long, default_value = "standard")]
        isolation: IsolationLevel,
        /// Volume binding (format: host:container[:ro])
        #[arg(long = "volume", value_name = "BINDING")]
        volumes: Vec<String>,
        /// Environment variable (format: KEY=VALUE)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Restart policy: never or on-failure
        #[arg(long, default_value = "never")]
        restart: RestartPolicy,
        /// Arguments passed to the image
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Start a container
    Start { id: String },
    /// Stop a running container
    Stop {
        id: String,
        /// Seconds to wait before SIGKILL
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List all containers
    List,
    /// Show one container as JSON
    Inspect { id: String },
    /// Print captured output
    Logs {
        id: String,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Show latest and historical samples
    Stats { id: String },
    /// Remove a stopped container
    Remove {
        id: String,
        /// Stop the container first if it is running
        #[arg(long)]
        force: bool,
    },
    /// Change the limits of a non-running container
    Update {
        id: String,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Export one or all containers as a bundle
    Export {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
        /// Write the bundle here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a bundle
    Import { file: PathBuf },
    /// Run the collector in the foreground until SIGINT/SIGTERM
    Monitor,
    /// Show engine counters
    Status,
}

impl Commands {
    /// Only long-running commands sample and enforce
    fn wants_collector(&self) -> bool {
        matches!(self, Commands::Monitor)
    }
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(_sig: libc::c_int) {
    // Only async-signal-safe work here
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn setup_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(stop_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        unsafe { sigaction(sig, &action) }
            .with_context(|| format!("failed to install {} handler", sig))?;
    }
    Ok(())
}

/// Map an error chain to the process exit code
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::exit_code)
        .unwrap_or(EXIT_INTERNAL)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.storage_root = root.clone();
    }
    config.enable_metrics = cli.command.wants_collector();
    Ok(config)
}

fn parse_env(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    anyhow!(EngineError::Validation(format!(
                        "invalid env '{}', expected KEY=VALUE",
                        pair
                    )))
                })
        })
        .collect()
}

/// Parse arguments, run one command and return the process exit code
pub fn run() -> i32 {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_VALIDATION } else { EXIT_OK };
            let _ = e.print();
            return code;
        }
    };

    match execute(cli) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let engine = Engine::open(config).context("failed to open engine")?;

    match cli.command {
        Commands::Create {
            name,
            image,
            limits,
            isolation,
            volumes,
            env,
            restart,
            args,
        } => {
            let mut spec = ContainerSpec::new(name, image)
                .with_limits(limits.apply_to(ResourceLimits::default()))
                .with_isolation(isolation)
                .with_restart_policy(restart)
                .with_args(args);
            for binding in &volumes {
                let volume = VolumeBinding::parse(binding)
                    .map_err(|e| anyhow!(EngineError::Validation(e)))?;
                spec = spec.with_volume(volume);
            }
            for (key, value) in parse_env(&env)? {
                spec = spec.with_env(key, value);
            }

            let container = engine.create(spec)?;
            println!("{}", container.id);
        }
        Commands::Start { id } => {
            let container = engine.start(&id)?;
            println!("{} {}", container.id, container.state);
        }
        Commands::Stop { id, timeout } => {
            let container = engine.stop(&id, timeout.map(Duration::from_secs))?;
            println!("{} {}", container.id, container.state);
        }
        Commands::List => print_json(&engine.list())?,
        Commands::Inspect { id } => print_json(&engine.inspect(&id)?)?,
        Commands::Logs { id, tail } => {
            for line in engine.logs(&id, tail)? {
                println!("{}", line);
            }
        }
        Commands::Stats { id } => print_json(&engine.stats(&id)?)?,
        Commands::Remove { id, force } => {
            let container = engine.remove(&id, force)?;
            println!("{} {}", container.id, container.state);
        }
        Commands::Update { id, limits } => {
            if limits.is_empty() {
                return Err(anyhow!(EngineError::Validation(
                    "update needs at least one limit flag".to_string()
                )));
            }
            let current = engine.inspect(&id)?;
            let container =
                engine.update_limits(&current.id, limits.apply_to(current.resource_limits))?;
            print_json(&container.resource_limits)?;
        }
        Commands::Export { id, all, output } => {
            let target = match (id, all) {
                (Some(id), false) => ExportTarget::One(id),
                (None, true) => ExportTarget::All,
                _ => {
                    return Err(anyhow!(EngineError::Validation(
                        "export needs an ID or --all".to_string()
                    )))
                }
            };
            let bundle = engine.export(target)?;
            match output {
                Some(path) => {
                    bundle.write_to(&path)?;
                    eprintln!(
                        "Exported {} container(s) to {}",
                        bundle.containers.len(),
                        path.display()
                    );
                }
                None => println!("{}", bundle.to_json()?),
            }
        }
        Commands::Import { file } => {
            let bundle = ExportBundle::read_from(&file)?;
            let imported = engine.import(&bundle)?;
            for container in imported {
                println!("{} {}", container.id, container.state);
            }
        }
        Commands::Monitor => {
            setup_signal_handlers()?;
            eprintln!(
                "Monitoring {} container(s); press Ctrl-C to stop",
                engine.list().len()
            );
            while !STOP_REQUESTED.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            engine.shutdown();
            print_json(&engine.counters())?;
        }
        Commands::Status => print_json(&engine.counters())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{EXIT_INVALID_STATE, EXIT_NOT_FOUND};

    #[test]
    fn test_exit_code_downcast() {
        let not_found = anyhow!(EngineError::NotFound("bot".into()));
        assert_eq!(exit_code_for(&not_found), EXIT_NOT_FOUND);

        let wrapped = anyhow::Error::new(EngineError::InvalidState {
            id: "x".into(),
            state: crate::config::types::ContainerState::Running,
            operation: "remove",
        })
        .context("remove failed");
        assert_eq!(exit_code_for(&wrapped), EXIT_INVALID_STATE);

        assert_eq!(exit_code_for(&anyhow!("plain")), EXIT_INTERNAL);
    }

    #[test]
    fn test_limit_flags_overlay() {
        let flags = LimitArgs {
            memory_limit: Some(256),
            ..LimitArgs::default()
        };
        let base = ResourceLimits {
            memory_mb: Some(512),
            cpu_percent: Some(50),
            ..ResourceLimits::default()
        };
        let merged = flags.apply_to(base);
        assert_eq!(merged.memory_mb, Some(256));
        assert_eq!(merged.cpu_percent, Some(50));
        assert!(!flags.is_empty());
    }

    #[test]
    fn test_create_parses_trailing_args() {
        let cli = Cli::try_parse_from([
            "botbox", "--root", "/tmp/x", "create", "bot", "/bin/sh", "--memory-limit", "64",
            "--isolation", "strict", "--env", "A=1", "--", "-c", "echo hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                isolation,
                args,
                limits,
                env,
                ..
            } => {
                assert_eq!(isolation, IsolationLevel::Strict);
                assert_eq!(args, vec!["-c", "echo hi"]);
                assert_eq!(limits.memory_limit, Some(64));
                assert_eq!(
                    parse_env(&env).unwrap(),
                    vec![("A".to_string(), "1".to_string())]
                );
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_stop_signal_sets_flag() {
        setup_signal_handlers().unwrap();
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        assert!(STOP_REQUESTED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_env_is_validation() {
        let err = parse_env(&["NOEQUALS".to_string()]).unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_VALIDATION);
    }
}
