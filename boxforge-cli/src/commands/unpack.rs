use anyhow::Context;
use boxforge::images::archive::unpack_image;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct UnpackArgs {
    /// OCI image layout directory
    pub image: PathBuf,

    /// Directory to write the root filesystem to (absent or empty)
    pub dest: PathBuf,

    /// Tag to select when the layout holds several images
    #[arg(short, long)]
    pub tag: Option<String>,
}

pub async fn execute(args: UnpackArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    super::ensure_empty_dir(&args.dest)?;
    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("Failed to create {}", args.dest.display()))?;

    let stats = unpack_image(&args.image, args.tag.as_deref(), &args.dest)?;
    println!(
        "Unpacked {} layers ({} entries, {}) into {}",
        stats.layers,
        stats.entries,
        super::human_size(stats.bytes),
        args.dest.display()
    );
    Ok(())
}
