use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use dx_exp::{load_plan, transport_for, Dispatcher};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the plan YAML file.
    #[arg(long)]
    pub plan: PathBuf,
    /// Run only the named experiments; may be repeated.
    #[arg(long = "only", value_name = "EXPERIMENT")]
    pub only: Vec<String>,
    /// Attempts per binding before the run fails.
    #[arg(long)]
    pub max_attempts: Option<u32>,
    /// Pause between attempts, in milliseconds.
    #[arg(long)]
    pub backoff_ms: Option<u64>,
    /// Kill commands still running after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Capture standard output of launched commands into the report.
    #[arg(long, default_value_t = false)]
    pub capture_output: bool,
    /// Directory receiving run_report.json.
    #[arg(long, default_value = ".")]
    pub out: PathBuf,
}

pub fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let plan = load_plan(&args.plan)?;
    let registry = plan.build_registry()?;
    tracing::info!(plan = %args.plan.display(), experiments = registry.len(), "plan loaded");
    let mut opts = plan.run_opts();
    if let Some(max_attempts) = args.max_attempts {
        opts.max_attempts = Some(max_attempts);
    }
    if let Some(backoff_ms) = args.backoff_ms {
        opts.backoff = Duration::from_millis(backoff_ms);
    }
    if let Some(timeout_secs) = args.timeout_secs {
        opts.command_timeout = Some(Duration::from_secs(timeout_secs));
    }
    opts.only = args.only.clone();

    let transport = transport_for(plan.cluster.transport, args.capture_output);
    let mut report = Dispatcher::new(transport.as_ref(), opts).run_all(&registry);
    report.plan_hash = Some(plan.plan_hash()?);
    let path = report.persist(&args.out)?;

    for exp in &report.experiments {
        let done = exp.instances.iter().filter(|instance| instance.error.is_none()).count();
        println!(
            "{:<24} {}/{} instances, {} attempts",
            exp.name,
            done,
            exp.instances.len(),
            exp.total_attempts()
        );
    }
    println!("report: {}", path.display());
    report.into_result()?;
    Ok(())
}
