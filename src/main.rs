use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use overseer::agent::{AgentId, TaskInfo};
use overseer::config::{AgentSpec, Config};
use overseer::monitoring::oracle::{create_oracle, Capability, OracleClient};
use overseer::monitoring::signals;
use overseer::monitoring::{
    AgentRegistryEntry, Collaborators, Intervention, LogEscalationSink, LogTaskCreator, Monitor,
    MonitorEvent, SessionHandle, SessionInspector, SystemDecision, TmuxInspector,
    TmuxLifecycleManager,
};
use overseer::tmux::Tmux;
use overseer::{olog, olog_warn, Error, Result};

/// Overseer - supervises long-running coding agents in tmux sessions
#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    OVERSEER_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.overseer/overseer.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.overseer/overseer.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Supervise the agents declared in the config until Ctrl-C
    Run,

    /// Print what the monitor sees in a session
    Inspect {
        /// tmux session name
        session: String,

        /// Number of trailing lines to read
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },

    /// List agent sessions with the configured prefix
    Sessions,

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    overseer::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run => run_monitor(config),
        Command::Inspect { session, lines } => run_inspect(&config, session, lines),
        Command::Sessions => run_sessions(&config),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn run_monitor(config: Config) -> Result<()> {
    if !Tmux::is_available() {
        return Err(Error::Tmux("tmux not found in PATH".to_string()));
    }
    if config.agents.is_empty() {
        eprintln!("No [[agents]] in config; nothing to supervise.");
        return Ok(());
    }
    olog!(
        "Overseer starting: provider={}, {} agent(s)",
        config.oracle.provider,
        config.agents.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let oracle = OracleClient::from_config(create_oracle(&config.oracle)?, &config.oracle);
        let lifecycle = Arc::new(TmuxLifecycleManager::new(&config.agent, &config.delivery)?);
        let (monitor, mut events) = Monitor::new(
            &config,
            Collaborators {
                oracle: oracle.clone(),
                inspector: Arc::new(TmuxInspector::new(config.monitor.session_read_timeout())),
                lifecycle: lifecycle.clone(),
                escalations: Arc::new(LogEscalationSink),
                tasks: Arc::new(LogTaskCreator),
            },
        )?;

        for spec in &config.agents {
            let entry = register_spec(spec, &lifecycle, &oracle).await?;
            println!("  {} -> {} ({})", entry.agent_id.short(), entry.session, entry.task.task_id);
            monitor.register_entry(entry).await?;
        }

        let handle = monitor.spawn();
        println!(
            "Supervising {} agent(s) every {}s. Ctrl-C to stop.",
            config.agents.len(),
            config.monitor.guardian_interval_secs
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                Some(event) = events.recv() => print_event(&event),
            }
        }

        println!("Stopping, waiting for in-flight evaluations...");
        let summary = handle.monitor().system_summary().await;
        handle.shutdown().await?;
        println!("{}", summary);
        Ok(())
    })
}

async fn register_spec(
    spec: &AgentSpec,
    lifecycle: &TmuxLifecycleManager,
    oracle: &OracleClient,
) -> Result<AgentRegistryEntry> {
    let id = spec
        .id
        .clone()
        .map(AgentId::from)
        .unwrap_or_else(AgentId::generate);
    let mut task = TaskInfo::new(spec.task_id.as_str(), spec.description.clone());
    task.done_definition = spec.done_definition.clone();
    task.complexity = spec.complexity;

    let incomplete = task.complexity.is_none() || task.done_definition.is_none();
    if incomplete && oracle.supports(Capability::EnrichTask) {
        match oracle.enrich_task(&task).await {
            Ok(enriched) => enriched.apply_to(&mut task),
            Err(e) => olog_warn!("task {}: enrichment failed: {}", task.task_id, e),
        }
    }

    let session = if spec.spawn {
        lifecycle.spawn(&id, &task, Some(spec.session.as_str())).await?
    } else if Tmux::session_exists(&spec.session) {
        SessionHandle::new(spec.session.clone())
    } else {
        return Err(Error::SessionUnavailable(spec.session.clone()));
    };
    Ok(AgentRegistryEntry::new(id, task, session).with_role(spec.role))
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Evaluated(report) => {
            if report.state_changed() || report.intervention != Intervention::None {
                println!(
                    "[{}] {} {} -> {} ({})",
                    report.at.format("%H:%M:%S"),
                    report.agent_id.short(),
                    report.state,
                    report.decision,
                    report.intervention
                );
            }
        }
        MonitorEvent::DeliveryFailed { agent_id, attempts } => {
            eprintln!("delivery to {} failed after {} attempts", agent_id.short(), attempts);
        }
        MonitorEvent::EvaluationPanicked { agent_id, error } => {
            eprintln!("evaluation of {} aborted: {}", agent_id.short(), error);
        }
        MonitorEvent::AgentRemoved { agent_id, reason } => {
            println!("{} removed ({})", agent_id.short(), reason);
        }
        MonitorEvent::AgentReplaced { old, new } => {
            println!("{} replaced by {}", old.short(), new.short());
        }
        MonitorEvent::SystemEvaluated(report) => {
            if report.decision != SystemDecision::Continue {
                println!("conductor: {} ({} agents)", report.decision.label(), report.agents);
            }
        }
        MonitorEvent::SessionReaped { session } => {
            println!("killed orphaned session {}", session);
        }
    }
}

fn run_inspect(config: &Config, session: String, lines: usize) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(async {
        TmuxInspector::new(config.monitor.session_read_timeout())
            .read_recent_output(&SessionHandle::new(session), lines)
            .await
    })?;

    for line in &output {
        println!("{}", line);
    }
    let text = output.join("\n");
    println!();
    println!("--- signals ---");
    println!("phase:   {}", signals::infer_phase(&output));
    println!("waiting: {}", signals::is_waiting_for_input(&text));
    if let Some(question) = signals::extract_question(&text) {
        println!("question: {}", question);
    }
    if let Some(error) = signals::last_error(&output) {
        println!("error:   {}", error);
    }
    Ok(())
}

fn run_sessions(config: &Config) -> Result<()> {
    let prefix = format!("{}_", config.agent.session_prefix);
    let sessions: Vec<String> = Tmux::list_sessions()?
        .into_iter()
        .filter(|s| s.starts_with(&prefix))
        .collect();
    if sessions.is_empty() {
        println!("No agent sessions.");
    }
    for session in sessions {
        println!("{}", session);
    }
    Ok(())
}
