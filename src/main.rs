use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use quant_engine::{
    commands::{
        backtest, compare_strategies, compliance, execution_plan, generate_panel, optimize, risk,
        signals,
    },
    config::EngineSettings,
    execution::SlicingAlgorithm,
    models::RebalanceFrequency,
    panel::SyntheticPanelConfig,
};
use std::path::PathBuf;

const DEFAULT_PANEL_FILE: &str = "data/panel.bin";

#[derive(Parser)]
#[command(name = "quant-engine")]
#[command(about = "Factor research, portfolio construction and backtesting")]
struct Cli {
    /// Path to the asset panel snapshot
    #[arg(long = "panel-file", value_name = "PATH", global = true)]
    panel_file: Option<PathBuf>,
    /// Write JSON results here instead of stdout
    #[arg(short, long, value_name = "PATH", global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a seeded synthetic asset panel snapshot
    GeneratePanel {
        #[arg(long, default_value_t = 20)]
        symbols: usize,
        #[arg(long, default_value_t = 504)]
        days: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// First calendar date of the panel (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
    },
    /// Compute factor signals, or backtest them by quantile
    Signals {
        /// Comma separated factor names
        #[arg(long, value_delimiter = ',', default_value = "momentum,value,quality")]
        factors: Vec<String>,
        #[arg(long)]
        lookback: Option<usize>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Run a top-minus-bottom quintile backtest at this rebalance frequency
        #[arg(long)]
        backtest: Option<RebalanceFrequency>,
    },
    /// Optimize a portfolio from factor-implied expected returns
    Optimize {
        #[arg(long, value_delimiter = ',', default_value = "momentum,value,quality")]
        factors: Vec<String>,
        /// mean_variance, black_litterman or risk_parity
        #[arg(long, default_value = "mean_variance")]
        method: String,
        /// Covariance lookback in trading days
        #[arg(long, default_value_t = 252)]
        window: usize,
        /// Constraint set as JSON
        #[arg(long, value_name = "PATH")]
        constraints: Option<PathBuf>,
        /// Black-Litterman views as a JSON array
        #[arg(long, value_name = "PATH")]
        views: Option<PathBuf>,
        #[arg(long)]
        max_position: Option<f64>,
        /// Run every method and report each one
        #[arg(long)]
        compare: bool,
    },
    /// Assess VaR, expected shortfall, exposures and stress scenarios for weights
    Risk {
        /// Weights as a JSON object of symbol to weight
        #[arg(long, value_name = "PATH")]
        weights: PathBuf,
        /// Risk parameters as JSON
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        #[arg(long)]
        confidence: Option<f64>,
        /// Compound scenario returns as a path for max drawdown
        #[arg(long)]
        sequential_drawdown: bool,
    },
    /// Run the compliance gate on weights
    Compliance {
        #[arg(long, value_name = "PATH")]
        weights: PathBuf,
        /// Built-in ruleset id (long_only_fund, long_short_fund)
        #[arg(long, default_value = "long_only_fund")]
        ruleset: String,
        /// Custom ruleset as JSON; overrides --ruleset
        #[arg(long, value_name = "PATH")]
        ruleset_file: Option<PathBuf>,
        #[arg(long)]
        var_95: Option<f64>,
        #[arg(long)]
        tracking_error: Option<f64>,
    },
    /// Backtest one strategy config over the panel
    Backtest {
        /// Strategy config as JSON
        #[arg(long, value_name = "PATH")]
        strategy: PathBuf,
        /// Backtest parameters as JSON
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        #[arg(long)]
        frequency: Option<RebalanceFrequency>,
        /// Built-in compliance ruleset evaluated at each rebalance
        #[arg(long)]
        ruleset: Option<String>,
    },
    /// Backtest several strategy configs in parallel
    CompareStrategies {
        /// JSON array of strategy configs
        #[arg(long, value_name = "PATH")]
        strategies: PathBuf,
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        #[arg(long)]
        frequency: Option<RebalanceFrequency>,
        #[arg(long)]
        ruleset: Option<String>,
    },
    /// Slice approved target weights into TWAP or VWAP orders
    PlanExecution {
        #[arg(long, value_name = "PATH")]
        target: PathBuf,
        #[arg(long, value_name = "PATH")]
        current: Option<PathBuf>,
        #[arg(long, default_value = "long_only_fund")]
        ruleset: String,
        /// Reviewed exception requests as a JSON array
        #[arg(long, value_name = "PATH")]
        exceptions: Option<PathBuf>,
        #[arg(long, default_value_t = 1_000_000.0)]
        portfolio_value: f64,
        #[arg(long, default_value = "vwap")]
        algorithm: SlicingAlgorithm,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli {
        panel_file,
        output,
        command,
    } = cli;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting quant-engine. Research tool only; not investment advice.");

    let settings = EngineSettings::from_env()?;
    let output = output.as_deref();

    match command {
        Commands::GeneratePanel {
            symbols,
            days,
            seed,
            start,
        } => {
            let mut config = SyntheticPanelConfig {
                symbols,
                trading_days: days,
                seed,
                ..Default::default()
            };
            if let Some(start) = start {
                config.start_date = start;
            }
            let output_path = resolve_panel_path(output.map(PathBuf::from).or(panel_file));
            generate_panel::run(config, &output_path).await?;
        }
        Commands::Signals {
            factors,
            lookback,
            as_of,
            backtest,
        } => {
            let args = signals::SignalsArgs {
                factors: &factors,
                lookback,
                as_of,
                backtest,
            };
            signals::run(&resolve_panel_path(panel_file), args, output).await?;
        }
        Commands::Optimize {
            factors,
            method,
            window,
            constraints,
            views,
            max_position,
            compare,
        } => {
            let args = optimize::OptimizeArgs {
                factors,
                method,
                window,
                constraints_file: constraints,
                views_file: views,
                max_position,
                compare,
            };
            optimize::run(&settings, &resolve_panel_path(panel_file), args, output).await?;
        }
        Commands::Risk {
            weights,
            params,
            confidence,
            sequential_drawdown,
        } => {
            let args = risk::RiskArgs {
                weights_file: weights,
                params_file: params,
                confidence,
                sequential_drawdown,
            };
            risk::run(&resolve_panel_path(panel_file), args, output).await?;
        }
        Commands::Compliance {
            weights,
            ruleset,
            ruleset_file,
            var_95,
            tracking_error,
        } => {
            let args = compliance::ComplianceArgs {
                weights_file: weights,
                ruleset,
                ruleset_file,
                panel_file,
                var_95,
                tracking_error,
            };
            compliance::run(args, output).await?;
        }
        Commands::Backtest {
            strategy,
            params,
            frequency,
            ruleset,
        } => {
            let args = backtest::BacktestArgs {
                strategy_file: strategy,
                params_file: params,
                frequency,
                ruleset,
            };
            backtest::run(&settings, &resolve_panel_path(panel_file), args, output).await?;
        }
        Commands::CompareStrategies {
            strategies,
            params,
            frequency,
            ruleset,
        } => {
            let args = compare_strategies::CompareArgs {
                strategies_file: strategies,
                params_file: params,
                frequency,
                ruleset,
            };
            compare_strategies::run(&settings, &resolve_panel_path(panel_file), args, output)
                .await?;
        }
        Commands::PlanExecution {
            target,
            current,
            ruleset,
            exceptions,
            portfolio_value,
            algorithm,
        } => {
            let args = execution_plan::ExecutionArgs {
                current_file: current,
                target_file: target,
                ruleset,
                exceptions_file: exceptions,
                panel_file,
                portfolio_value,
                algorithm,
            };
            execution_plan::run(args, output).await?;
        }
    }

    Ok(())
}

fn resolve_panel_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_PANEL_FILE)
}
