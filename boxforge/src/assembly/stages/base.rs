//! Stage 1: select the base runtime.
//!
//! Resolves the pinned base either from a local OCI layout or from the
//! registry cache, pulling on a miss.

use crate::build::{BaseSpec, BuildContext, BuildSpec};
use crate::images::{BaseImage, ImageStore, OciImageLayout};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};

pub struct BaseInput<'a> {
    pub spec: &'a BuildSpec,
    pub context: &'a BuildContext,
    pub images: &'a ImageStore,
}

pub async fn run(input: BaseInput<'_>) -> BoxforgeResult<BaseImage> {
    let image = match &input.spec.base {
        BaseSpec::Layout(path) => {
            let dir = input.context.resolve(path)?;
            if !dir.is_dir() {
                return Err(BoxforgeError::Image(format!(
                    "Base image layout not found: {}",
                    path.display()
                )));
            }
            let layout = OciImageLayout::open(&dir)?;
            BaseImage::from_layout(&layout)?
        }
        BaseSpec::Image(_) => {
            let reference = input.spec.base_reference()?.ok_or_else(|| {
                BoxforgeError::Internal("registry base without a reference".into())
            })?;
            input.images.pull(&reference).await?
        }
    };

    image.check_blobs()?;

    tracing::info!(
        base = %image.source,
        manifest = %image.manifest_digest,
        layers = image.layers.len(),
        "Base runtime selected"
    );
    Ok(image)
}
