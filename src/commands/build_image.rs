//! `taskq build-image`: build the task runtime image.

use anyhow::{Result, bail};

use crate::paths::QueuePaths;
use crate::runtime::docker;

pub fn build_image(paths: &QueuePaths, rebuild: bool, no_pull: bool) -> Result<i32> {
    let dockerfile = paths.root().join("Dockerfile");
    let context = paths.root().to_path_buf();
    let image = docker::DEFAULT_IMAGE;
    let pull = !no_pull;

    if !dockerfile.exists() {
        bail!("Dockerfile not found: {}", dockerfile.display());
    }

    println!("Building runtime image: {image}");
    println!("  Dockerfile: {}", dockerfile.display());
    println!("  Context: {}", context.display());
    println!("  Pull base image: {}", if pull { "yes" } else { "no" });
    println!("  Rebuild (no cache): {}", if rebuild { "yes" } else { "no" });

    let output = docker::build_runtime_image(image, &dockerfile, &context, rebuild, pull)?;
    if !output.trim().is_empty() {
        println!("{}", output.trim());
    }

    println!("Runtime image ready: {image}");
    Ok(0)
}
