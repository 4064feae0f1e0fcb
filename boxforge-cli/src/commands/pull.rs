use clap::Args;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Pinned base image reference, e.g. python:3.12.4-slim or python@sha256:...
    pub reference: String,
}

pub async fn execute(args: PullArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let forge = global.create_forge()?;
    let image = forge.pull(&args.reference).await?;

    println!("{}", image.manifest_digest);
    println!("Source: {}", image.source);
    println!("Layers: {}", image.layers.len());
    Ok(())
}
