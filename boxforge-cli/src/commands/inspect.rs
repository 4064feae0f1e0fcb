use boxforge::images::{ConfigSummary, OciImageLayout, config_summary};
use clap::{Args, ValueEnum};
use comfy_table::{ContentArrangement, Table, presets};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectFormat {
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// OCI image layout directory
    pub image: PathBuf,

    /// Tag to select when the layout holds several images
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = InspectFormat::Table)]
    pub format: InspectFormat,
}

#[derive(Debug, Serialize)]
struct ImageDetails {
    manifest_digest: String,
    config_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    annotations: BTreeMap<String, String>,
    layers: Vec<LayerDetails>,
    config: ConfigSummary,
}

#[derive(Debug, Serialize)]
struct LayerDetails {
    digest: String,
    media_type: String,
    size: u64,
}

pub async fn execute(args: InspectArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let image = OciImageLayout::open_ref(&args.image, args.tag.as_deref())?;
    let manifest = image.manifest();

    let details = ImageDetails {
        manifest_digest: image.manifest_digest().to_string(),
        config_digest: manifest.config().digest().to_string(),
        tag: image.ref_name().map(String::from),
        annotations: manifest
            .annotations()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        layers: manifest
            .layers()
            .iter()
            .map(|l| LayerDetails {
                digest: l.digest().to_string(),
                media_type: l.media_type().to_string(),
                size: l.size(),
            })
            .collect(),
        config: config_summary(image.config()),
    };

    match args.format {
        InspectFormat::Json => println!("{}", serde_json::to_string_pretty(&details)?),
        InspectFormat::Table => print_table(&details),
    }
    Ok(())
}

fn print_table(details: &ImageDetails) {
    let config = &details.config;
    let or_none = |v: &[String]| {
        if v.is_empty() {
            "(none)".to_string()
        } else {
            v.join(" ")
        }
    };

    println!("Manifest:    {}", details.manifest_digest);
    println!("Config:      {}", details.config_digest);
    if let Some(tag) = &details.tag {
        println!("Tag:         {}", tag);
    }
    println!("Platform:    {}/{}", config.os, config.architecture);
    if let Some(created) = &config.created {
        println!("Created:     {}", created);
    }
    println!("Entrypoint:  {}", or_none(&config.entrypoint));
    println!("Cmd:         {}", or_none(&config.cmd));
    println!(
        "WorkingDir:  {}",
        config.working_dir.as_deref().unwrap_or("/")
    );
    for (i, env) in config.env.iter().enumerate() {
        let label = if i == 0 { "Env:" } else { "" };
        println!("{:<12} {}", label, env);
    }
    for (key, value) in &details.annotations {
        println!("Annotation:  {}={}", key, value);
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "DIGEST", "SIZE", "MEDIA TYPE"]);
    for (i, layer) in details.layers.iter().enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            layer.digest.clone(),
            super::human_size(layer.size),
            layer.media_type.clone(),
        ]);
    }
    println!("{table}");
}
