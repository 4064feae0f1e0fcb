//! Shared constants between the builder library and the CLI

/// OCI media types and annotation keys written into produced images.
pub mod oci {
    /// Content of the `oci-layout` marker file.
    pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

    /// Annotation carrying the image tag inside `index.json`.
    pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

    /// Manifest annotation naming the base image's manifest digest.
    pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

    /// Manifest annotation naming the base image reference (registry bases).
    pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";

    /// Opaque directory marker (hides lower-layer content of a directory).
    pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

    /// Prefix of a single-entry whiteout.
    pub const WHITEOUT_PREFIX: &str = ".wh.";
}

/// Default in-image destinations for build inputs.
pub mod defaults {
    /// Source tree destination
    pub const SOURCE_DEST: &str = "/src";

    /// Configuration tree (relative to build context)
    pub const CONFIG_PATH: &str = "conf";

    /// Configuration tree destination
    pub const CONFIG_DEST: &str = "/conf";

    /// Environment file name pattern (matched against context root entries)
    pub const ENV_FILE_PATTERN: &str = ".env*";

    /// Environment files land in the image root
    pub const ENV_FILE_DEST: &str = "/";

    /// Dependency manifest (relative to build context)
    pub const MANIFEST_PATH: &str = "requirements.txt";

    /// Dependency manifest destination
    pub const MANIFEST_DEST: &str = "/requirements.txt";

    /// Interpreter used to render the entry command
    pub const INTERPRETER: &str = "python";

    /// Install prefix inside the image
    pub const INSTALL_PREFIX: &str = "/usr/local";

    /// Build file looked up when `-f` is not given
    pub const BUILD_FILE: &str = "boxforge.yaml";
}
