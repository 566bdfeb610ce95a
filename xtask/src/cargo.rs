//! Running cargo from the workspace root

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Command;

/// Run the workspace tests with `POSIXRT_LOG` set to `log_level`
pub fn run_workspace_tests(log_level: &str) -> Result<()> {
    let workspace_root = find_workspace_root()?;

    println!("Running workspace tests (POSIXRT_LOG={})", log_level);

    let status = Command::new("cargo")
        .current_dir(&workspace_root)
        .args(["test", "--workspace"])
        .env("POSIXRT_LOG", log_level)
        .status()
        .context("Failed to execute cargo test")?;

    if !status.success() {
        anyhow::bail!("cargo test failed with exit code: {:?}", status.code());
    }
    Ok(())
}

/// Find the workspace root by looking for Cargo.toml with [workspace]
fn find_workspace_root() -> Result<PathBuf> {
    let mut current = std::env::current_dir()
        .context("Failed to get current directory")?;

    loop {
        let cargo_toml = current.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml)
                .context("Failed to read Cargo.toml")?;
            if content.contains("[workspace]") {
                return Ok(current);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => anyhow::bail!("Could not find workspace root"),
        }
    }
}
