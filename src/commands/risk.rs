use crate::commands::{load_panel, read_json, write_json};
use crate::models::PortfolioWeights;
use crate::risk::{LiquidityReport, RiskEngine, RiskParams, RiskReport, ScenarioDrawdownMode};
use anyhow::Result;
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct RiskOutput {
    report: RiskReport,
    liquidity: LiquidityReport,
}

pub struct RiskArgs {
    pub weights_file: PathBuf,
    pub params_file: Option<PathBuf>,
    pub confidence: Option<f64>,
    pub sequential_drawdown: bool,
}

pub async fn run(panel_file: &Path, args: RiskArgs, output: Option<&Path>) -> Result<()> {
    let panel = load_panel(panel_file).await?;
    let weights: PortfolioWeights = read_json(&args.weights_file)?;
    let mut params: RiskParams = match &args.params_file {
        Some(path) => read_json(path)?,
        None => RiskParams::default(),
    };
    if let Some(confidence) = args.confidence {
        params.var_confidence = confidence;
        params.es_confidence = confidence;
    }
    if args.sequential_drawdown {
        params.drawdown_mode = ScenarioDrawdownMode::SequentialPath;
    }

    let report = crate::assess_risk(&weights, &panel, &params)?;
    let liquidity = RiskEngine::liquidity_stress(&weights, &panel.security_master(report.as_of));
    info!(
        "VaR {:.0}%: parametric {:.2}%, historical {:.2}%; ES historical {:.2}%; worst scenario loss {:.2}%",
        report.var_confidence * 100.0,
        report.var_parametric * 100.0,
        report.var_historical * 100.0,
        report.es_historical * 100.0,
        report.stress.metrics.worst_case_loss * 100.0
    );
    write_json(&RiskOutput { report, liquidity }, output)
}
