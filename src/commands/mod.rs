pub mod backtest;
pub mod compare_strategies;
pub mod compliance;
pub mod execution_plan;
pub mod generate_panel;
pub mod optimize;
pub mod risk;
pub mod signals;

use crate::panel::{AssetPanel, PanelProvider, SnapshotPanelProvider};
use anyhow::{anyhow, Context, Result};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tokio::fs as async_fs;

pub async fn ensure_panel_file(path: &Path) -> Result<()> {
    if async_fs::metadata(path).await.is_ok() {
        return Ok(());
    }

    Err(anyhow!(
        "Asset panel snapshot not found at {}. Generate one with `generate-panel` before running this command.",
        path.display()
    ))
}

pub async fn load_panel(path: &Path) -> Result<AssetPanel> {
    ensure_panel_file(path).await?;
    let panel = SnapshotPanelProvider::new(path)
        .load_panel()
        .with_context(|| format!("failed to load asset panel from {}", path.display()))?;
    info!(
        "Loaded panel with {} symbols over {} dates",
        panel.symbols().len(),
        panel.dates().len()
    );
    Ok(panel)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Pretty JSON to `output`, or stdout when no path is given.
pub fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
