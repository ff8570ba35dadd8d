use std::error::Error;
use std::path::PathBuf;

use clap::Args;
use dx_core::DxError;
use dx_exp::{load_plan, TargetInfo};

#[derive(Args, Debug)]
pub struct GridArgs {
    /// Path to the plan YAML file.
    #[arg(long)]
    pub plan: PathBuf,
    /// Experiment whose bindings to print.
    #[arg(long)]
    pub experiment: String,
    /// Also print the command every target would run, per step.
    #[arg(long, default_value_t = false)]
    pub render: bool,
}

pub fn run(args: &GridArgs) -> Result<(), Box<dyn Error>> {
    let plan = load_plan(&args.plan)?;
    let registry = plan.build_registry()?;
    let (decl, experiment) = plan
        .experiment(&args.experiment)
        .zip(registry.get(&args.experiment))
        .ok_or_else(|| {
            DxError::config("cli.unknown_experiment", "plan has no such experiment")
                .with_context("name", args.experiment.clone())
        })?;
    let templates = plan.templates_for(decl)?;
    let targets: Vec<TargetInfo> = experiment
        .targets()
        .iter()
        .enumerate()
        .map(|(index, server)| TargetInfo::from_server(server, index))
        .collect();

    for (index, binding) in experiment.bindings().enumerate() {
        println!("{index:>4} {binding}");
        if !args.render {
            continue;
        }
        for (step, template) in templates.iter().enumerate() {
            for target in &targets {
                let command = template.render(&binding, target, targets.len())?;
                println!("       step {} [{}] {}", step + 1, target.name, command);
            }
        }
    }
    Ok(())
}
