use crate::panel::{PanelProvider, SyntheticPanelConfig, SyntheticPanelProvider};
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(config: SyntheticPanelConfig, output_path: &Path) -> Result<()> {
    info!(
        "Generating synthetic panel: {} symbols, {} trading days, seed {}",
        config.symbols, config.trading_days, config.seed
    );
    let panel = SyntheticPanelProvider::new(config).load_panel()?;
    panel.save_to_file(output_path)?;
    info!(
        "Asset panel snapshot successfully written to {}",
        output_path.display()
    );
    Ok(())
}
