use std::error::Error;
use std::path::PathBuf;

use clap::Args;
use dx_exp::load_plan;
use serde_json::json;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Path to the plan YAML file.
    #[arg(long)]
    pub plan: PathBuf,
    /// Emit JSON instead of a table.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn run(args: &ListArgs) -> Result<(), Box<dyn Error>> {
    let plan = load_plan(&args.plan)?;
    let registry = plan.build_registry()?;
    let rows: Vec<_> = registry
        .list_experiments()
        .iter()
        .map(|exp| {
            json!({
                "name": exp.name(),
                "shape": exp.shape(),
                "targets": exp.targets().iter().map(|server| server.name.as_str()).collect::<Vec<_>>(),
                "instances": exp.instance_count(),
                "raise_on_rc": exp.options().raise_on_rc,
            })
        })
        .collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for exp in registry.list_experiments() {
        let targets: Vec<_> = exp.targets().iter().map(|server| server.name.as_str()).collect();
        println!(
            "{:<24} {:<6} instances={:<5} targets={}",
            exp.name(),
            format!("{:?}", exp.shape()).to_lowercase(),
            exp.instance_count(),
            targets.join(",")
        );
    }
    Ok(())
}
