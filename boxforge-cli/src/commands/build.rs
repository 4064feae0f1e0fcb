use super::BuildFileArgs;
use anyhow::Context;
use boxforge::AssemblyRequest;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub input: BuildFileArgs,

    /// Directory the OCI image layout is written to
    #[arg(short, long)]
    pub output: PathBuf,

    /// Tag recorded in the image index
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Print the build report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: BuildArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let (spec, context) = args.input.load()?;
    let forge = global.create_forge()?;

    let mut assembly = forge.assembly(AssemblyRequest {
        spec,
        context,
        output: args.output,
        tag: args.tag,
    });

    // Dropping the running assembly on Ctrl-C removes its workspace and
    // any staged output.
    let outcome = tokio::select! {
        result = assembly.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let report = match outcome {
        Some(result) => {
            result.with_context(|| format!("Build stopped at state '{}'", assembly.state()))?
        }
        None => anyhow::bail!("Build interrupted at state '{}'", assembly.state()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.manifest_digest);
        println!("Output: {}", report.output.display());
        if let Some(tag) = &report.tag {
            println!("Tag:    {}", tag);
        }
        println!("Entry:  {}", report.entry.join(" "));
    }
    Ok(())
}
