use crate::commands::{load_panel, read_json, write_json};
use crate::compliance::{ComplianceRuleset, ComplianceStatus, RiskInputs};
use crate::models::{PortfolioWeights, SecurityMaster};
use anyhow::Result;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub struct ComplianceArgs {
    pub weights_file: PathBuf,
    /// Built-in ruleset id, used when no ruleset file is given.
    pub ruleset: String,
    pub ruleset_file: Option<PathBuf>,
    /// Panel supplying sector, country and liquidity attributes.
    pub panel_file: Option<PathBuf>,
    pub var_95: Option<f64>,
    pub tracking_error: Option<f64>,
}

pub async fn run(args: ComplianceArgs, output: Option<&Path>) -> Result<()> {
    let weights: PortfolioWeights = read_json(&args.weights_file)?;
    let ruleset = match &args.ruleset_file {
        Some(path) => read_json(path)?,
        None => ComplianceRuleset::builtin(&args.ruleset)?,
    };
    let securities = match &args.panel_file {
        Some(path) => {
            let panel = load_panel(path).await?;
            match panel.last_date() {
                Some(date) => panel.security_master(date),
                None => SecurityMaster::new(),
            }
        }
        None => {
            warn!("No panel given; rules needing security attributes will warn");
            SecurityMaster::new()
        }
    };
    let risk = RiskInputs {
        var_95: args.var_95,
        tracking_error: args.tracking_error,
    };

    let verdict = crate::check_compliance(&weights, &ruleset, &securities, &risk)?;
    let summary = &verdict.report.summary;
    match verdict.status {
        ComplianceStatus::Block => warn!(
            "{}: BLOCK ({} failed, {} warnings)",
            ruleset.id, summary.failed_checks, summary.warning_checks
        ),
        status => info!(
            "{}: {} ({} passed, {} warnings)",
            ruleset.id, status, summary.passed_checks, summary.warning_checks
        ),
    }
    write_json(&verdict, output)
}
