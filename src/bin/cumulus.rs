use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use cumulus::compiler::core::Compiler;
use cumulus::compiler::loader::load_blueprint_from_yaml;
use cumulus::config::ReconcilerConfig;
use cumulus::error::{ReconcileError, Result};
use cumulus::providers::ProviderRegistry;
use cumulus::providers::simulated::SimulatedProvider;
use cumulus::runtime::engine::Engine;
use cumulus::runtime::plan::{Graph, Phase};
use cumulus::runtime::storage::{Deployment, DeploymentStore, FileDeploymentStore};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(author, version, about = "Declarative provisioning reconciler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Reconciler config file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding deployment records
    #[arg(long, env = "CUMULUS_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Upper bound on concurrent provider calls
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Args)]
struct InputArgs {
    /// Blueprint input (key=value, value parsed as JSON when possible)
    #[arg(long = "input", short = 'i', value_parser = parse_key_val)]
    values: Vec<(String, Value)>,

    /// YAML file with blueprint inputs; --input wins on conflicts
    #[arg(long = "inputs")]
    inputs_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a blueprint
    Install {
        /// Path to the blueprint YAML file
        blueprint: PathBuf,

        #[command(flatten)]
        inputs: InputArgs,

        /// Deployment id (generated from the blueprint name when omitted)
        #[arg(long)]
        deployment_id: Option<String>,
    },

    /// Tear down a deployment
    Uninstall {
        deployment_id: String,
    },

    /// Load a blueprint and build its graph without touching anything
    Validate {
        blueprint: PathBuf,

        #[command(flatten)]
        inputs: InputArgs,
    },

    /// Print the ordered operations of a phase
    Plan {
        blueprint: PathBuf,

        #[command(flatten)]
        inputs: InputArgs,

        #[arg(long, value_enum, default_value = "install")]
        phase: PhaseArg,
    },

    /// Show the node states of a deployment
    Status {
        deployment_id: String,
    },

    /// List stored deployments
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    Install,
    Uninstall,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Install => Phase::Install,
            PhaseArg::Uninstall => Phase::Uninstall,
        }
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ReconcilerConfig> {
    let mut config = match &cli.config {
        Some(path) => ReconcilerConfig::load(path)?,
        None => ReconcilerConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(n) = cli.max_concurrency {
        config.max_concurrency = n.max(1);
    }
    Ok(config)
}

fn collect_inputs(args: &InputArgs) -> Result<HashMap<String, Value>> {
    let mut inputs: HashMap<String, Value> = match &args.inputs_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read inputs file {}", path.display()))?;
            serde_yaml::from_str::<Option<HashMap<String, Value>>>(&content)
                .with_context(|| format!("invalid inputs file {}", path.display()))?
                .unwrap_or_default()
        }
        None => HashMap::new(),
    };
    inputs.extend(args.values.iter().cloned());
    Ok(inputs)
}

fn build_graph(path: &Path, args: &InputArgs) -> Result<Graph> {
    let blueprint = load_blueprint_from_yaml(path)?;
    info!(blueprint = %path.display(), nodes = blueprint.nodes.len(), "Loaded blueprint");
    let graph = Compiler::with_inputs(collect_inputs(args)?).compile(&blueprint)?;
    Ok(graph)
}

/// Adapters available to the command line: the logical adapter for abstract
/// nodes and a simulated cloud for infrastructure nodes.
fn providers() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_builtins();
    registry.register(Arc::new(SimulatedProvider::infrastructure("simulated")));
    registry
}

fn engine(config: ReconcilerConfig) -> Engine {
    let engine = Engine::new(providers(), config);
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight operations");
            token.cancel();
        }
    });
    engine
}

fn default_deployment_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("deployment");
    Deployment::generate_id(stem)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    let store = FileDeploymentStore::new(config.state_dir.clone());

    match cli.command {
        Commands::Install {
            blueprint,
            inputs,
            deployment_id,
        } => {
            let graph = build_graph(&blueprint, &inputs)?;
            let id = deployment_id.unwrap_or_else(|| default_deployment_id(&blueprint));
            let mut deployment = match store.load(&id).await? {
                Some(mut existing) => {
                    info!(deployment = %id, "Reconciling existing deployment");
                    existing.rebind(graph)?;
                    existing
                }
                None => Deployment::new(id, graph).with_blueprint(&blueprint),
            };

            let summary = engine(config).execute(&mut deployment, Phase::Install).await?;
            store.save(&deployment).await?;
            print!("{}", summary);
            Ok(summary.exit_code())
        }

        Commands::Uninstall { deployment_id } => {
            let mut deployment = store
                .load(&deployment_id)
                .await?
                .ok_or_else(|| ReconcileError::DeploymentNotFound(deployment_id.clone()))?;

            let summary = engine(config).execute(&mut deployment, Phase::Uninstall).await?;
            if summary.is_success() {
                store.delete(&deployment.id).await?;
            } else {
                store.save(&deployment).await?;
            }
            print!("{}", summary);
            Ok(summary.exit_code())
        }

        Commands::Validate { blueprint, inputs } => {
            let graph = build_graph(&blueprint, &inputs)?;
            let registry = providers();
            for node in graph.nodes() {
                if registry.resolve(node).is_none() {
                    return Err(ReconcileError::NoAdapter {
                        node: node.name.clone(),
                        node_type: node.node_type.clone(),
                    });
                }
            }
            println!(
                "{} is valid: {} nodes, order {}",
                blueprint.display(),
                graph.len(),
                graph.order().join(" -> ")
            );
            Ok(0)
        }

        Commands::Plan {
            blueprint,
            inputs,
            phase,
        } => {
            let graph = build_graph(&blueprint, &inputs)?;
            print!("{}", graph.plan(phase.into()));
            Ok(0)
        }

        Commands::Status { deployment_id } => {
            let deployment = store
                .load(&deployment_id)
                .await?
                .ok_or_else(|| ReconcileError::DeploymentNotFound(deployment_id.clone()))?;
            println!("deployment {} (updated {})", deployment.id, deployment.updated_at);
            for (name, instance) in &deployment.instances {
                let resource = instance.handle.as_ref().map(|h| h.id.as_str()).unwrap_or("-");
                let external = if instance.external { " (external)" } else { "" };
                println!("  {:<24} {:<14} {}{}", name, instance.state, resource, external);
            }
            if let Some(last) = &deployment.last_run {
                println!("last run: {} {}", last.phase, last.status);
            }
            Ok(0)
        }

        Commands::List => {
            for id in store.list().await? {
                match store.load(&id).await? {
                    Some(d) => {
                        let status = d
                            .last_run
                            .as_ref()
                            .map(|r| format!("{} {}", r.phase, r.status))
                            .unwrap_or_else(|| "never run".to_string());
                        println!("{:<32} {:>3} nodes  {}", id, d.instances.len(), status);
                    }
                    None => println!("{}", id),
                }
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
