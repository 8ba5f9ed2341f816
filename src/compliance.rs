//! Pre-trade compliance gate.
//!
//! Every check runs independently and reports PASS, WARNING or FAIL with the
//! findings behind it. Any FAIL makes the verdict BLOCK, otherwise any WARNING
//! makes it REVIEW. A BLOCK verdict is an ordinary result, not an error; the
//! only way past it is [`ApprovedWeights::from_verdict`] with approved
//! exception requests covering every violation.

use crate::error::{EngineError, Result};
use crate::models::{PortfolioWeights, SecurityMaster};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

const LIMIT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionLimits {
    pub max_single_position: Option<f64>,
    pub min_position_size: Option<f64>,
    /// Largest allowed short, as a non-negative magnitude.
    pub max_short_position: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorLimits {
    pub max_sector_weight: Option<f64>,
    /// May be negative for short books.
    pub min_sector_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeverageLimits {
    pub max_gross_exposure: Option<f64>,
    pub max_net_exposure: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_portfolio_beta: Option<f64>,
    /// Largest allowed 95% VaR, as a positive loss.
    pub max_var_95: Option<f64>,
    pub max_tracking_error: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityLimits {
    pub min_adv_ratio: Option<f64>,
    pub max_illiquid_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceRuleset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub position_limits: PositionLimits,
    pub sector_limits: SectorLimits,
    pub leverage_limits: LeverageLimits,
    pub risk_limits: RiskLimits,
    pub liquidity: LiquidityLimits,
    pub max_concentration_index: Option<f64>,
    pub restricted_securities: BTreeSet<String>,
    pub watchlist_securities: BTreeSet<String>,
    pub min_esg_score: Option<f64>,
    pub sanctioned_countries: BTreeSet<String>,
}

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ComplianceRuleset {
    pub const BUILTIN_IDS: [&'static str; 2] = ["long_only_fund", "long_short_fund"];

    /// Looks up one of the built-in rulesets by id.
    pub fn builtin(id: &str) -> Result<Self> {
        let restricted = string_set(&["TOXIC_STOCK", "SANCTIONED_ENTITY"]);
        let watchlist = string_set(&["VOLATILE_STOCK", "LOW_LIQUIDITY"]);
        let sanctioned = string_set(&["IR", "KP", "CU"]);
        match id {
            "long_only_fund" => Ok(Self {
                id: id.to_string(),
                name: "Long-Only Fund".to_string(),
                description: "Standard long-only fund compliance rules".to_string(),
                position_limits: PositionLimits {
                    max_single_position: Some(0.05),
                    min_position_size: Some(0.001),
                    max_short_position: Some(0.0),
                },
                sector_limits: SectorLimits {
                    max_sector_weight: Some(0.30),
                    min_sector_weight: Some(0.0),
                },
                leverage_limits: LeverageLimits {
                    max_gross_exposure: Some(1.0),
                    max_net_exposure: Some(1.0),
                },
                risk_limits: RiskLimits {
                    max_portfolio_beta: Some(1.2),
                    max_var_95: Some(0.03),
                    max_tracking_error: Some(0.05),
                },
                liquidity: LiquidityLimits {
                    min_adv_ratio: Some(0.01),
                    max_illiquid_weight: Some(0.20),
                },
                max_concentration_index: Some(0.15),
                restricted_securities: restricted,
                watchlist_securities: watchlist,
                min_esg_score: Some(50.0),
                sanctioned_countries: sanctioned,
            }),
            "long_short_fund" => Ok(Self {
                id: id.to_string(),
                name: "Long-Short Fund".to_string(),
                description: "Long-short fund with leverage".to_string(),
                position_limits: PositionLimits {
                    max_single_position: Some(0.08),
                    min_position_size: Some(0.001),
                    max_short_position: Some(0.05),
                },
                sector_limits: SectorLimits {
                    max_sector_weight: Some(0.40),
                    min_sector_weight: Some(-0.20),
                },
                leverage_limits: LeverageLimits {
                    max_gross_exposure: Some(2.0),
                    max_net_exposure: Some(0.5),
                },
                risk_limits: RiskLimits {
                    max_portfolio_beta: Some(0.8),
                    max_var_95: Some(0.04),
                    max_tracking_error: Some(0.08),
                },
                liquidity: LiquidityLimits {
                    min_adv_ratio: Some(0.005),
                    max_illiquid_weight: Some(0.30),
                },
                max_concentration_index: Some(0.20),
                restricted_securities: restricted,
                watchlist_securities: watchlist,
                min_esg_score: Some(30.0),
                sanctioned_countries: sanctioned,
            }),
            _ => Err(EngineError::validation(format!(
                "unknown compliance ruleset: {}",
                id
            ))),
        }
    }
}

/// Portfolio risk figures some rules compare against; computed elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskInputs {
    /// 95% VaR as a positive loss.
    pub var_95: Option<f64>,
    pub tracking_error: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    PositionLimits,
    RestrictedSecurities,
    WatchlistSecurities,
    LeverageLimits,
    BetaLimits,
    SectorLimits,
    LiquidityRequirements,
    ConcentrationLimits,
    VarLimits,
    TrackingErrorLimits,
    EsgRequirements,
    RegulatoryLimits,
}

impl CheckKind {
    pub const ALL: [CheckKind; 12] = [
        CheckKind::PositionLimits,
        CheckKind::RestrictedSecurities,
        CheckKind::WatchlistSecurities,
        CheckKind::LeverageLimits,
        CheckKind::BetaLimits,
        CheckKind::SectorLimits,
        CheckKind::LiquidityRequirements,
        CheckKind::ConcentrationLimits,
        CheckKind::VarLimits,
        CheckKind::TrackingErrorLimits,
        CheckKind::EsgRequirements,
        CheckKind::RegulatoryLimits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::PositionLimits => "position_limits",
            CheckKind::RestrictedSecurities => "restricted_securities",
            CheckKind::WatchlistSecurities => "watchlist_securities",
            CheckKind::LeverageLimits => "leverage_limits",
            CheckKind::BetaLimits => "beta_limits",
            CheckKind::SectorLimits => "sector_limits",
            CheckKind::LiquidityRequirements => "liquidity_requirements",
            CheckKind::ConcentrationLimits => "concentration_limits",
            CheckKind::VarLimits => "var_limits",
            CheckKind::TrackingErrorLimits => "tracking_error_limits",
            CheckKind::EsgRequirements => "esg_requirements",
            CheckKind::RegulatoryLimits => "regulatory_limits",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Ok,
    Review,
    Block,
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComplianceStatus::Ok => "OK",
            ComplianceStatus::Review => "REVIEW",
            ComplianceStatus::Block => "BLOCK",
        };
        f.write_str(label)
    }
}

/// One violation or warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable key used by exception requests.
    pub id: String,
    pub check: CheckKind,
    pub rule: String,
    pub symbol: Option<String>,
    pub sector: Option<String>,
    pub current: Option<f64>,
    pub limit: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub status: CheckStatus,
    pub violations: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

struct CheckBuilder {
    check: CheckKind,
    violations: Vec<Finding>,
    warnings: Vec<Finding>,
}

impl CheckBuilder {
    fn new(check: CheckKind) -> Self {
        Self {
            check,
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn finding(
        &self,
        rule: &str,
        subject: Subject<'_>,
        current: Option<f64>,
        limit: Option<f64>,
        message: String,
    ) -> Finding {
        let (symbol, sector, key) = match subject {
            Subject::Symbol(symbol) => (Some(symbol.to_string()), None, symbol),
            Subject::Sector(sector) => (None, Some(sector.to_string()), sector),
            Subject::Portfolio => (None, None, "portfolio"),
        };
        Finding {
            id: format!("{}:{}:{}", self.check, rule, key),
            check: self.check,
            rule: rule.to_string(),
            symbol,
            sector,
            current,
            limit,
            message,
        }
    }

    fn violation(
        &mut self,
        rule: &str,
        subject: Subject<'_>,
        current: Option<f64>,
        limit: Option<f64>,
        message: String,
    ) {
        let finding = self.finding(rule, subject, current, limit, message);
        self.violations.push(finding);
    }

    fn warning(
        &mut self,
        rule: &str,
        subject: Subject<'_>,
        current: Option<f64>,
        limit: Option<f64>,
        message: String,
    ) {
        let finding = self.finding(rule, subject, current, limit, message);
        self.warnings.push(finding);
    }

    fn missing(&mut self, rule: &str, symbol: &str, attribute: &str) {
        self.warning(
            rule,
            Subject::Symbol(symbol),
            None,
            None,
            format!("{} unavailable for {}; rule not evaluated", attribute, symbol),
        );
    }

    fn finish(self) -> CheckResult {
        let status = if !self.violations.is_empty() {
            CheckStatus::Fail
        } else if !self.warnings.is_empty() {
            CheckStatus::Warning
        } else {
            CheckStatus::Pass
        };
        CheckResult {
            check: self.check,
            status,
            violations: self.violations,
            warnings: self.warnings,
        }
    }
}

#[derive(Clone, Copy)]
enum Subject<'a> {
    Symbol(&'a str),
    Sector(&'a str),
    Portfolio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_checks: usize,
    pub passed_checks: usize,
    pub warning_checks: usize,
    pub failed_checks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub summary: ReportSummary,
    pub violations: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub ruleset_id: String,
    pub status: ComplianceStatus,
    pub checks: Vec<CheckResult>,
    pub report: ComplianceReport,
    pub weights: PortfolioWeights,
    pub evaluated_at: DateTime<Utc>,
}

impl ComplianceVerdict {
    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == kind)
    }

    pub fn violations(&self) -> impl Iterator<Item = &Finding> {
        self.checks.iter().flat_map(|c| c.violations.iter())
    }
}

pub struct ComplianceGate;

impl ComplianceGate {
    pub fn check(
        weights: &PortfolioWeights,
        ruleset: &ComplianceRuleset,
        securities: &SecurityMaster,
        risk: &RiskInputs,
    ) -> Result<ComplianceVerdict> {
        if weights.is_empty() {
            return Err(EngineError::validation("weights are empty"));
        }
        if let Some((symbol, _)) = weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(EngineError::validation(format!(
                "weight for {} is not finite",
                symbol
            )));
        }
        let held: Vec<(&str, f64)> = weights
            .iter()
            .filter(|(_, w)| **w != 0.0)
            .map(|(s, w)| (s.as_str(), *w))
            .collect();

        let checks: Vec<CheckResult> = CheckKind::ALL
            .iter()
            .map(|kind| match kind {
                CheckKind::PositionLimits => position_limits(&held, ruleset),
                CheckKind::RestrictedSecurities => restricted_securities(&held, ruleset, securities),
                CheckKind::WatchlistSecurities => watchlist_securities(&held, ruleset, securities),
                CheckKind::LeverageLimits => leverage_limits(weights, ruleset),
                CheckKind::BetaLimits => beta_limits(&held, ruleset, securities),
                CheckKind::SectorLimits => sector_limits(&held, ruleset, securities),
                CheckKind::LiquidityRequirements => liquidity_requirements(&held, ruleset, securities),
                CheckKind::ConcentrationLimits => concentration_limits(weights, ruleset),
                CheckKind::VarLimits => var_limits(ruleset, risk),
                CheckKind::TrackingErrorLimits => tracking_error_limits(ruleset, risk),
                CheckKind::EsgRequirements => esg_requirements(&held, ruleset, securities),
                CheckKind::RegulatoryLimits => regulatory_limits(&held, ruleset, securities),
            })
            .collect();

        let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            ComplianceStatus::Block
        } else if checks.iter().any(|c| c.status == CheckStatus::Warning) {
            ComplianceStatus::Review
        } else {
            ComplianceStatus::Ok
        };
        let report = build_report(&checks, status);

        if status == ComplianceStatus::Block {
            warn!(
                "Compliance BLOCK under {}: {} violations",
                ruleset.id,
                report.violations.len()
            );
        } else {
            info!("Compliance {} under {}", status, ruleset.id);
        }

        Ok(ComplianceVerdict {
            ruleset_id: ruleset.id.clone(),
            status,
            checks,
            report,
            weights: weights.clone(),
            evaluated_at: Utc::now(),
        })
    }
}

fn position_limits(held: &[(&str, f64)], ruleset: &ComplianceRuleset) -> CheckResult {
    let limits = &ruleset.position_limits;
    let mut check = CheckBuilder::new(CheckKind::PositionLimits);
    for (symbol, weight) in held {
        if let Some(max) = limits.max_single_position {
            if weight.abs() > max + LIMIT_TOLERANCE {
                check.violation(
                    "max_single_position",
                    Subject::Symbol(symbol),
                    Some(*weight),
                    Some(max),
                    format!("Position {} ({:.2}%) exceeds maximum size {:.2}%", symbol, weight * 100.0, max * 100.0),
                );
            }
        }
        if let Some(min) = limits.min_position_size {
            if weight.abs() < min {
                check.warning(
                    "min_position_size",
                    Subject::Symbol(symbol),
                    Some(*weight),
                    Some(min),
                    format!("Position {} below minimum size threshold", symbol),
                );
            }
        }
        if let Some(max_short) = limits.max_short_position {
            if *weight < -max_short - LIMIT_TOLERANCE {
                check.violation(
                    "max_short_position",
                    Subject::Symbol(symbol),
                    Some(*weight),
                    Some(-max_short),
                    format!("Short position {} exceeds limit", symbol),
                );
            }
        }
    }
    check.finish()
}

fn restricted_securities(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::RestrictedSecurities);
    for (symbol, weight) in held {
        let flagged = securities.get(symbol).map(|i| i.restricted).unwrap_or(false);
        if flagged || ruleset.restricted_securities.contains(*symbol) {
            check.violation(
                "restricted_securities",
                Subject::Symbol(symbol),
                Some(*weight),
                Some(0.0),
                format!("Security {} is on the restricted list", symbol),
            );
        }
    }
    check.finish()
}

fn watchlist_securities(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::WatchlistSecurities);
    for (symbol, weight) in held {
        let flagged = securities.get(symbol).map(|i| i.watchlist).unwrap_or(false);
        if flagged || ruleset.watchlist_securities.contains(*symbol) {
            check.warning(
                "watchlist_securities",
                Subject::Symbol(symbol),
                Some(*weight),
                None,
                format!("Security {} is on the watchlist", symbol),
            );
        }
    }
    check.finish()
}

fn leverage_limits(weights: &PortfolioWeights, ruleset: &ComplianceRuleset) -> CheckResult {
    let limits = &ruleset.leverage_limits;
    let mut check = CheckBuilder::new(CheckKind::LeverageLimits);
    let gross = weights.gross_exposure();
    let net = weights.net_exposure();
    if let Some(max) = limits.max_gross_exposure {
        if gross > max + LIMIT_TOLERANCE {
            check.violation(
                "max_gross_exposure",
                Subject::Portfolio,
                Some(gross),
                Some(max),
                format!("Gross exposure {:.2}% exceeds limit {:.2}%", gross * 100.0, max * 100.0),
            );
        }
    }
    if let Some(max) = limits.max_net_exposure {
        if net.abs() > max + LIMIT_TOLERANCE {
            check.violation(
                "max_net_exposure",
                Subject::Portfolio,
                Some(net),
                Some(max),
                format!("Net exposure {:.2}% exceeds limit {:.2}%", net * 100.0, max * 100.0),
            );
        }
    }
    check.finish()
}

fn beta_limits(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::BetaLimits);
    let max = match ruleset.risk_limits.max_portfolio_beta {
        Some(max) => max,
        None => return check.finish(),
    };
    let mut beta = 0.0;
    for (symbol, weight) in held {
        match securities.market_beta(symbol) {
            Some(b) => beta += b * weight,
            None => check.missing("max_portfolio_beta", symbol, "market beta"),
        }
    }
    if beta.abs() > max + LIMIT_TOLERANCE {
        check.violation(
            "max_portfolio_beta",
            Subject::Portfolio,
            Some(beta),
            Some(max),
            format!("Portfolio beta {:.2} exceeds limit {:.2}", beta, max),
        );
    }
    check.finish()
}

fn sector_limits(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let limits = &ruleset.sector_limits;
    let mut check = CheckBuilder::new(CheckKind::SectorLimits);
    if limits.max_sector_weight.is_none() && limits.min_sector_weight.is_none() {
        return check.finish();
    }
    let mut exposures: BTreeMap<&str, f64> = BTreeMap::new();
    for (symbol, weight) in held {
        match securities.sector_of(symbol) {
            Some(sector) => *exposures.entry(sector).or_insert(0.0) += weight,
            None => check.missing("sector_weight", symbol, "sector"),
        }
    }
    for (sector, exposure) in exposures {
        if let Some(max) = limits.max_sector_weight {
            if exposure > max + LIMIT_TOLERANCE {
                check.violation(
                    "max_sector_weight",
                    Subject::Sector(sector),
                    Some(exposure),
                    Some(max),
                    format!("Sector {} exposure {:.2}% exceeds limit {:.2}%", sector, exposure * 100.0, max * 100.0),
                );
                continue;
            }
        }
        if let Some(min) = limits.min_sector_weight {
            if exposure < min - LIMIT_TOLERANCE {
                check.violation(
                    "min_sector_weight",
                    Subject::Sector(sector),
                    Some(exposure),
                    Some(min),
                    format!("Sector {} exposure {:.2}% below limit {:.2}%", sector, exposure * 100.0, min * 100.0),
                );
            }
        }
    }
    check.finish()
}

fn liquidity_requirements(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let limits = &ruleset.liquidity;
    let mut check = CheckBuilder::new(CheckKind::LiquidityRequirements);
    let min_adv = match limits.min_adv_ratio {
        Some(min) => min,
        None => return check.finish(),
    };
    let mut illiquid_weight = 0.0;
    for (symbol, weight) in held {
        match securities.get(symbol).and_then(|i| i.adv_ratio) {
            Some(adv) if adv < min_adv => {
                check.warning(
                    "min_adv_ratio",
                    Subject::Symbol(symbol),
                    Some(adv),
                    Some(min_adv),
                    format!("Security {} has low liquidity (ADV ratio: {:.3})", symbol, adv),
                );
                illiquid_weight += weight.abs();
            }
            Some(_) => {}
            None => check.missing("min_adv_ratio", symbol, "ADV ratio"),
        }
    }
    if let Some(max) = limits.max_illiquid_weight {
        if illiquid_weight > max + LIMIT_TOLERANCE {
            check.violation(
                "max_illiquid_weight",
                Subject::Portfolio,
                Some(illiquid_weight),
                Some(max),
                format!("Illiquid weight {:.2}% exceeds limit {:.2}%", illiquid_weight * 100.0, max * 100.0),
            );
        }
    }
    check.finish()
}

fn concentration_limits(weights: &PortfolioWeights, ruleset: &ComplianceRuleset) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::ConcentrationLimits);
    if let Some(max) = ruleset.max_concentration_index {
        let index = weights.herfindahl();
        if index > max + LIMIT_TOLERANCE {
            check.violation(
                "max_concentration_index",
                Subject::Portfolio,
                Some(index),
                Some(max),
                format!("Concentration index {:.3} exceeds limit {:.3}", index, max),
            );
        }
    }
    check.finish()
}

fn var_limits(ruleset: &ComplianceRuleset, risk: &RiskInputs) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::VarLimits);
    if let Some(max) = ruleset.risk_limits.max_var_95 {
        match risk.var_95 {
            Some(var) if var > max + LIMIT_TOLERANCE => check.violation(
                "max_var_95",
                Subject::Portfolio,
                Some(var),
                Some(max),
                format!("Portfolio VaR {:.2}% exceeds limit {:.2}%", var * 100.0, max * 100.0),
            ),
            Some(_) => {}
            None => check.warning(
                "max_var_95",
                Subject::Portfolio,
                None,
                Some(max),
                "Portfolio VaR unavailable; rule not evaluated".to_string(),
            ),
        }
    }
    check.finish()
}

fn tracking_error_limits(ruleset: &ComplianceRuleset, risk: &RiskInputs) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::TrackingErrorLimits);
    if let Some(max) = ruleset.risk_limits.max_tracking_error {
        match risk.tracking_error {
            Some(te) if te > max + LIMIT_TOLERANCE => check.violation(
                "max_tracking_error",
                Subject::Portfolio,
                Some(te),
                Some(max),
                format!("Tracking error {:.2}% exceeds limit {:.2}%", te * 100.0, max * 100.0),
            ),
            Some(_) => {}
            None => check.warning(
                "max_tracking_error",
                Subject::Portfolio,
                None,
                Some(max),
                "Tracking error unavailable; rule not evaluated".to_string(),
            ),
        }
    }
    check.finish()
}

fn esg_requirements(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::EsgRequirements);
    if let Some(min) = ruleset.min_esg_score {
        for (symbol, _) in held {
            match securities.get(symbol).and_then(|i| i.esg_score) {
                Some(score) if score < min => check.warning(
                    "min_esg_score",
                    Subject::Symbol(symbol),
                    Some(score),
                    Some(min),
                    format!("Security {} has low ESG score ({:.1})", symbol, score),
                ),
                Some(_) => {}
                None => check.missing("min_esg_score", symbol, "ESG score"),
            }
        }
    }
    check.finish()
}

fn regulatory_limits(
    held: &[(&str, f64)],
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
) -> CheckResult {
    let mut check = CheckBuilder::new(CheckKind::RegulatoryLimits);
    if ruleset.sanctioned_countries.is_empty() {
        return check.finish();
    }
    for (symbol, _) in held {
        match securities.get(symbol).and_then(|i| i.country.as_deref()) {
            Some(country) if ruleset.sanctioned_countries.contains(country) => check.violation(
                "sanctioned_country",
                Subject::Symbol(symbol),
                None,
                None,
                format!("Security {} from sanctioned country {}", symbol, country),
            ),
            Some(_) => {}
            None => check.missing("sanctioned_country", symbol, "country"),
        }
    }
    check.finish()
}

fn build_report(checks: &[CheckResult], status: ComplianceStatus) -> ComplianceReport {
    let count = |wanted: CheckStatus| checks.iter().filter(|c| c.status == wanted).count();
    let summary = ReportSummary {
        total_checks: checks.len(),
        passed_checks: count(CheckStatus::Pass),
        warning_checks: count(CheckStatus::Warning),
        failed_checks: count(CheckStatus::Fail),
    };
    let violations: Vec<Finding> = checks.iter().flat_map(|c| c.violations.clone()).collect();
    let warnings: Vec<Finding> = checks.iter().flat_map(|c| c.warnings.clone()).collect();

    let mut recommendations = Vec::new();
    if !violations.is_empty() {
        recommendations.push("Address all violations before proceeding with trade".to_string());
    }
    if !warnings.is_empty() {
        recommendations.push("Review warnings and consider adjustments".to_string());
    }
    if status == ComplianceStatus::Ok {
        recommendations.push("All compliance checks passed - trade can proceed".to_string());
    }

    ComplianceReport {
        summary,
        violations,
        warnings,
        recommendations,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionStatus {
    Pending,
    Approved,
    Rejected,
}

/// Request to override one violation. Starts PENDING; only an explicit
/// review moves it on.
///
/// Reviewed requests read back from JSON are re-validated: a non-pending
/// status needs a reviewer other than the requester and a review time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExceptionRecord")]
pub struct ExceptionRequest {
    id: Uuid,
    violation_id: String,
    justification: String,
    requested_by: String,
    requested_at: DateTime<Utc>,
    status: ExceptionStatus,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
}

/// Wire shape of [`ExceptionRequest`] before validation.
#[derive(Deserialize)]
struct ExceptionRecord {
    id: Uuid,
    violation_id: String,
    justification: String,
    requested_by: String,
    requested_at: DateTime<Utc>,
    status: ExceptionStatus,
    #[serde(default)]
    reviewed_by: Option<String>,
    #[serde(default)]
    reviewed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExceptionRecord> for ExceptionRequest {
    type Error = EngineError;

    fn try_from(record: ExceptionRecord) -> Result<Self> {
        let request = Self {
            id: record.id,
            violation_id: record.violation_id,
            justification: record.justification,
            requested_by: record.requested_by,
            requested_at: record.requested_at,
            status: record.status,
            reviewed_by: record.reviewed_by,
            reviewed_at: record.reviewed_at,
        };
        if request.justification.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "exception {} has no justification",
                request.id
            )));
        }
        match request.status {
            ExceptionStatus::Pending => {
                if request.reviewed_by.is_some() || request.reviewed_at.is_some() {
                    return Err(EngineError::validation(format!(
                        "pending exception {} carries review fields",
                        request.id
                    )));
                }
            }
            ExceptionStatus::Approved | ExceptionStatus::Rejected => {
                if !request.independently_reviewed() {
                    return Err(EngineError::validation(format!(
                        "exception {} is marked {:?} without an independent review",
                        request.id, request.status
                    )));
                }
            }
        }
        Ok(request)
    }
}

impl ExceptionRequest {
    pub fn new<V, J, U>(violation_id: V, justification: J, requested_by: U) -> Result<Self>
    where
        V: Into<String>,
        J: Into<String>,
        U: Into<String>,
    {
        let justification = justification.into();
        if justification.trim().is_empty() {
            return Err(EngineError::validation(
                "exception request needs a justification",
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            violation_id: violation_id.into(),
            justification,
            requested_by: requested_by.into(),
            requested_at: Utc::now(),
            status: ExceptionStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn violation_id(&self) -> &str {
        &self.violation_id
    }

    pub fn justification(&self) -> &str {
        &self.justification
    }

    pub fn requested_by(&self) -> &str {
        &self.requested_by
    }

    pub fn status(&self) -> ExceptionStatus {
        self.status
    }

    pub fn reviewed_by(&self) -> Option<&str> {
        self.reviewed_by.as_deref()
    }

    pub fn approve<S: Into<String>>(&mut self, reviewer: S) -> Result<()> {
        self.review(reviewer.into(), ExceptionStatus::Approved)
    }

    pub fn reject<S: Into<String>>(&mut self, reviewer: S) -> Result<()> {
        self.review(reviewer.into(), ExceptionStatus::Rejected)
    }

    fn review(&mut self, reviewer: String, outcome: ExceptionStatus) -> Result<()> {
        if self.status != ExceptionStatus::Pending {
            return Err(EngineError::validation(format!(
                "exception {} was already reviewed",
                self.id
            )));
        }
        if reviewer.trim().is_empty() || reviewer == self.requested_by {
            return Err(EngineError::validation(format!(
                "exception {} cannot be reviewed by its requester",
                self.id
            )));
        }
        self.status = outcome;
        self.reviewed_by = Some(reviewer);
        self.reviewed_at = Some(Utc::now());
        Ok(())
    }

    fn independently_reviewed(&self) -> bool {
        match &self.reviewed_by {
            Some(reviewer) => {
                !reviewer.trim().is_empty()
                    && reviewer != &self.requested_by
                    && self.reviewed_at.is_some()
            }
            None => false,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == ExceptionStatus::Approved && self.independently_reviewed()
    }
}

/// Weights that have cleared the compliance gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedWeights {
    weights: PortfolioWeights,
    ruleset_id: String,
    overridden: Vec<String>,
}

impl ApprovedWeights {
    pub fn from_verdict(
        verdict: &ComplianceVerdict,
        exceptions: &[ExceptionRequest],
    ) -> Result<Self> {
        let mut overridden = Vec::new();
        if verdict.status == ComplianceStatus::Block {
            let approved: BTreeSet<&str> = exceptions
                .iter()
                .filter(|e| e.is_approved())
                .map(|e| e.violation_id())
                .collect();
            let uncovered: Vec<&str> = verdict
                .violations()
                .map(|v| v.id.as_str())
                .filter(|id| !approved.contains(id))
                .collect();
            if !uncovered.is_empty() {
                return Err(EngineError::Blocked(format!(
                    "ruleset {} blocked the weights: {}",
                    verdict.ruleset_id,
                    uncovered.join(", ")
                )));
            }
            overridden = verdict.violations().map(|v| v.id.clone()).collect();
            warn!(
                "Compliance BLOCK under {} overridden by {} approved exceptions",
                verdict.ruleset_id,
                overridden.len()
            );
        }
        Ok(Self {
            weights: verdict.weights.clone(),
            ruleset_id: verdict.ruleset_id.clone(),
            overridden,
        })
    }

    pub fn weights(&self) -> &PortfolioWeights {
        &self.weights
    }

    pub fn ruleset_id(&self) -> &str {
        &self.ruleset_id
    }

    /// Violation ids waived by approved exceptions.
    pub fn overridden(&self) -> &[String] {
        &self.overridden
    }

    pub fn into_weights(self) -> PortfolioWeights {
        self.weights
    }
}
