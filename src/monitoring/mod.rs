//! The agent-monitoring core.
//!
//! A per-agent [`Guardian`] reads each agent's terminal output, asks the
//! reasoning oracle where the agent is heading and steers, restarts or
//! recreates it. A system-wide [`Conductor`] looks at all agents together
//! for duplicated work, resource contention and gaps. The [`Monitor`] runs
//! both on their own intervals over a shared [`AgentRegistry`].

pub mod conductor;
pub mod delivery;
pub mod escalation;
pub mod guardian;
pub mod inspector;
pub mod lifecycle;
pub mod monitor;
pub mod oracle;
pub mod registry;
pub mod signals;
pub mod trajectory;
pub mod types;

pub use conductor::{Conductor, ConductorReport};
pub use delivery::{deliver_with_retry, SteeringMessage};
pub use escalation::{
    ChannelEscalationSink, ChannelTaskCreator, Escalation, EscalationSink, EscalationSource,
    LogEscalationSink, LogTaskCreator, TaskCreator,
};
pub use guardian::{CycleReport, Guardian, GuardianDeps, Intervention};
pub use inspector::{SessionHandle, SessionInspector, TmuxInspector};
pub use lifecycle::{AgentLifecycleManager, Replacement, TmuxLifecycleManager};
pub use monitor::{Collaborators, LoopState, Monitor, MonitorEvent, MonitorHandle, SweepSummary};
pub use oracle::{create_oracle, Capability, Judged, OracleClient, ReasoningOracle};
pub use registry::{AgentRegistry, AgentRegistryEntry, RestartVerdict, SharedRegistry};
pub use trajectory::{JudgmentSummary, TrajectoryContext};
pub use types::{
    AgentState, AgentStateAnalysis, AgentSummary, ConductorJudgment, CoordinationNeed,
    DecisionKind, DuplicateGroup, EnrichedTask, GuardianJudgment, MonitoringDecision,
    SteeringType, SystemDecision, TrajectoryPhase,
};
