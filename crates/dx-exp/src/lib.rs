//! Parameter sweeps, experiment registration and multi-node command dispatch.

mod cluster;
mod context;
mod dispatch;
mod fanout;
mod grid;
mod hash;
mod plan;
mod process;
mod registry;
mod report;
mod serde;
mod signal;
mod target;
mod template;

pub mod testing;

pub use cluster::{ClusterConfig, ServerSpec, TransportKind};
pub use context::ExperimentContext;
pub use dispatch::{Dispatcher, RunOpts};
pub use fanout::{
    CommandFanout, CommandLog, CommandResult, FailureLatch, Fanout, FanoutResult, PendingCommand,
};
pub use grid::{GridIter, GridParameter, ParameterBinding, ParameterGrid, ParameterSpec};
pub use hash::{instance_id, stable_hash_string};
pub use plan::{load_plan, ExperimentDecl, FailurePolicy, Plan, RunDefaults, ServerSelection};
pub use process::{
    shell_quote, transport_for, LocalTarget, LocalTransport, ProcessHandle, SshTarget, SshTransport,
};
pub use registry::{Experiment, ExperimentFn, ExperimentOptions, ExperimentRegistry, ExperimentShape};
pub use report::{ExperimentReport, InstanceReport, InstanceState, RunReport, REPORT_FILE};
pub use signal::ControlSignal;
pub use target::{CommandHandle, CommandStatus, RemoteTarget, TargetInfo, Transport, UnreachableTarget};
pub use template::CommandTemplate;

pub use crate::serde::{from_json_slice, to_canonical_json_bytes};
