use super::BuildFileArgs;
use boxforge::BuildPlan;
use clap::{Args, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Text,
    Json,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub input: BuildFileArgs,

    /// Output format
    #[arg(long, value_enum, default_value_t = PlanFormat::Text)]
    pub format: PlanFormat,
}

pub async fn execute(args: ValidateArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let (spec, context) = args.input.load()?;
    let plan = BuildPlan::create(&spec, &context)?;

    match args.format {
        PlanFormat::Text => println!("{}", plan),
        PlanFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}
