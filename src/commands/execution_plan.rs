use crate::commands::{load_panel, read_json, write_json};
use crate::compliance::{ApprovedWeights, ComplianceGate, ComplianceRuleset, ExceptionRequest, RiskInputs};
use crate::execution::{plan_execution, SlicingAlgorithm, SlicingParams};
use crate::models::{PortfolioWeights, SecurityMaster};
use anyhow::{Context, Result};
use log::info;
use std::path::{Path, PathBuf};

pub struct ExecutionArgs {
    pub current_file: Option<PathBuf>,
    pub target_file: PathBuf,
    pub ruleset: String,
    /// Reviewed exception requests, JSON array.
    pub exceptions_file: Option<PathBuf>,
    pub panel_file: Option<PathBuf>,
    pub portfolio_value: f64,
    pub algorithm: SlicingAlgorithm,
}

pub async fn run(args: ExecutionArgs, output: Option<&Path>) -> Result<()> {
    let current: PortfolioWeights = match &args.current_file {
        Some(path) => read_json(path)?,
        None => PortfolioWeights::new(),
    };
    let target: PortfolioWeights = read_json(&args.target_file)?;
    let exceptions: Vec<ExceptionRequest> = match &args.exceptions_file {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let ruleset = ComplianceRuleset::builtin(&args.ruleset)?;
    let securities = match &args.panel_file {
        Some(path) => {
            let panel = load_panel(path).await?;
            match panel.last_date() {
                Some(date) => panel.security_master(date),
                None => SecurityMaster::new(),
            }
        }
        None => SecurityMaster::new(),
    };
    let verdict = ComplianceGate::check(&target, &ruleset, &securities, &RiskInputs::default())?;
    let approved = ApprovedWeights::from_verdict(&verdict, &exceptions)
        .context("target weights did not clear compliance")?;

    let params = SlicingParams {
        algorithm: args.algorithm,
        ..Default::default()
    };
    let plan = plan_execution(&current, &approved, args.portfolio_value, &params, None)?;
    info!(
        "{} orders, {} slices, ${:.2} notional",
        plan.orders.len(),
        plan.slices.len(),
        plan.total_notional
    );
    write_json(&plan, output)
}
