#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use rearrest::cache::{CacheMode, ResultCache};
use rearrest::config::AnalysisConfig;
use rearrest::data::{OutcomeKind, SubjectTable};
use rearrest::export::{discrimination_summary, log_rank_summary, prediction_error_summary};
use rearrest::pipeline::{
    Stages, discrimination, fit_models, fit_summary, load_table, prediction_error, run_outcome,
    survival_curves, write_discrimination, write_fits, write_prediction_error,
};
use rearrest::prediction_error::ResamplingScheme;
use rearrest::progress::{ResamplingProgress, ResamplingStage};

#[derive(Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Violent,
    Nonviolent,
    Both,
}

impl OutcomeArg {
    fn kinds(self) -> &'static [OutcomeKind] {
        match self {
            Self::Violent => &[OutcomeKind::Violent],
            Self::Nonviolent => &[OutcomeKind::Nonviolent],
            Self::Both => &OutcomeKind::ALL,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SchemeArg {
    /// Repeated k-fold cross-validation
    Cv,
    /// .632+ bootstrap
    Bootstrap,
}

impl From<SchemeArg> for ResamplingScheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::Cv => ResamplingScheme::CrossValidation,
            SchemeArg::Bootstrap => ResamplingScheme::Bootstrap632Plus,
        }
    }
}

#[derive(Args)]
pub struct CommonArgs {
    /// Subject table with release age, dACC and outcome columns (tab or comma delimited)
    pub input: PathBuf,

    /// TOML analysis configuration; defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Which outcome to analyse
    #[arg(long, value_enum, default_value_t = OutcomeArg::Both)]
    pub outcome: OutcomeArg,

    /// Directory for result tables (overrides the configuration)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ResamplingArgs {
    /// Directory holding cached resampling results (overrides the configuration)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Recompute and overwrite cached results
    #[arg(long, conflicts_with = "require_cache")]
    pub refresh: bool,

    /// Fail instead of recomputing when a cached result is missing
    #[arg(long)]
    pub require_cache: bool,

    /// Number of resampling repetitions for every estimate
    #[arg(long, value_name = "N")]
    pub repetitions: Option<usize>,

    /// Base seed for the per-repetition random streams
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ResamplingArgs {
    fn cache_mode(&self) -> CacheMode {
        if self.refresh {
            CacheMode::Refresh
        } else if self.require_cache {
            CacheMode::Require
        } else {
            CacheMode::Use
        }
    }
}

#[derive(Parser)]
#[command(
    name = "rearrest",
    about = "Does dACC activity improve rearrest prediction over release age?",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Kaplan-Meier curves overall and by dACC group, with the log-rank test.
    Curves(CommonArgs),

    /// Fits the Age, dACC and Age+dACC Cox models to the full sample.
    Fit(CommonArgs),

    /// Brier-score prediction error of the Cox models under resampling.
    #[command(name = "prediction-error")]
    PredictionError {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        resampling: ResamplingArgs,
        /// Resampling scheme; every configured scheme runs when omitted
        #[arg(long, value_enum)]
        scheme: Option<SchemeArg>,
    },

    /// Four time-dependent AUC estimators under repeated cross-validation.
    Auc {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        resampling: ResamplingArgs,
    },

    /// The full analysis for each outcome, writing every table and a summary.
    Run {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        resampling: ResamplingArgs,
    },

    /// Show version and build information.
    #[command(about = "Show version and build information")]
    Version,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

/// Progress bar over the repetitions of the stage currently running.
#[derive(Default)]
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|guard| guard.clone())
    }
}

impl ResamplingProgress for BarProgress {
    fn on_stage_start(&self, stage: ResamplingStage, total_repetitions: usize) {
        let pb = create_progress_bar(total_repetitions as u64, stage.describe());
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(pb);
        }
    }

    fn on_repetition_finish(&self, stage: ResamplingStage) {
        if let Some(pb) = self.current() {
            pb.inc(1);
        } else {
            log::debug!("repetition finished outside a tracked {stage} stage");
        }
    }

    fn on_stage_finish(&self, stage: ResamplingStage) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_with_message(format!("{stage} done"));
            }
        }
    }
}

/// Loaded inputs shared by every subcommand.
struct Session {
    config: AnalysisConfig,
    table: SubjectTable,
    outcomes: Vec<OutcomeKind>,
}

impl Session {
    fn open(
        common: &CommonArgs,
        resampling: Option<&ResamplingArgs>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match &common.config {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(dir) = &common.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(args) = resampling {
            if let Some(dir) = &args.cache_dir {
                config.cache_dir = dir.clone();
            }
            if let Some(repetitions) = args.repetitions {
                config.resampling.repetitions = repetitions;
                config.auc.repetitions = repetitions;
            }
            if let Some(seed) = args.seed {
                config.resampling.seed = seed;
            }
        }
        config.validate()?;

        let table = load_table(&common.input, &config)?;
        println!(
            "Loaded {} subjects from '{}'",
            table.num_subjects(),
            common.input.display()
        );

        let requested = common.outcome.kinds();
        let outcomes: Vec<OutcomeKind> = requested
            .iter()
            .copied()
            .filter(|&kind| {
                let present = table.has_outcome(kind);
                if !present && requested.len() > 1 {
                    log::warn!("Skipping {}: outcome columns not present", kind.describe());
                }
                present || requested.len() == 1
            })
            .collect();
        if outcomes.is_empty() {
            return Err("the input contains no outcome columns".into());
        }

        Ok(Self {
            config,
            table,
            outcomes,
        })
    }

    fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn cache(&self, args: &ResamplingArgs) -> ResultCache {
        ResultCache::new(&self.config.cache_dir, args.cache_mode())
    }
}

fn report_written(path: &Path) {
    println!("Wrote {}", path.display());
}

fn run_curves(common: CommonArgs) -> CliResult {
    let session = Session::open(&common, None)?;
    for &kind in &session.outcomes {
        let data = session.table.outcome(kind)?;
        let curves = survival_curves(&data)?;
        println!(
            "{}: {} subjects, {} events, median survival {}",
            kind.describe(),
            data.len(),
            data.num_events(),
            curves
                .overall
                .median_survival()
                .map_or_else(|| "not reached".to_string(), |t| format!("{t:.1} months"))
        );
        if let Some(test) = &curves.log_rank {
            println!("{}", log_rank_summary(test));
        }
        for path in curves.write(session.output_dir(), kind)? {
            report_written(&path);
        }
    }
    Ok(())
}

fn run_fit(common: CommonArgs) -> CliResult {
    let session = Session::open(&common, None)?;
    for &kind in &session.outcomes {
        let data = session.table.outcome(kind)?;
        let fits = fit_models(&data, &session.config)?;
        println!("{}:", kind.describe());
        for fit in &fits {
            println!("  {}", fit_summary(fit));
        }
        report_written(&write_fits(session.output_dir(), kind, &fits)?);
    }
    Ok(())
}

fn run_prediction_error(
    common: CommonArgs,
    resampling: ResamplingArgs,
    scheme: Option<SchemeArg>,
) -> CliResult {
    let session = Session::open(&common, Some(&resampling))?;
    let cache = session.cache(&resampling);
    let progress = BarProgress::default();
    let schemes: Vec<ResamplingScheme> = match scheme {
        Some(arg) => vec![arg.into()],
        None => session.config.resampling.schemes.clone(),
    };
    for &kind in &session.outcomes {
        let data = session.table.outcome(kind)?;
        for &scheme in &schemes {
            let result = prediction_error(&data, &session.config, scheme, &cache, &progress)?;
            println!("{}", prediction_error_summary(&result));
            report_written(&write_prediction_error(session.output_dir(), &result)?);
        }
    }
    Ok(())
}

fn run_auc(common: CommonArgs, resampling: ResamplingArgs) -> CliResult {
    let session = Session::open(&common, Some(&resampling))?;
    let cache = session.cache(&resampling);
    let progress = BarProgress::default();
    for &kind in &session.outcomes {
        let data = session.table.outcome(kind)?;
        let result = discrimination(&data, &session.config, &cache, &progress)?;
        println!("{}", discrimination_summary(&result));
        report_written(&write_discrimination(session.output_dir(), &result)?);
    }
    Ok(())
}

fn run_all(common: CommonArgs, resampling: ResamplingArgs) -> CliResult {
    let session = Session::open(&common, Some(&resampling))?;
    let cache = session.cache(&resampling);
    let progress = BarProgress::default();
    for &kind in &session.outcomes {
        let report = run_outcome(
            &session.table,
            kind,
            &session.config,
            Stages::ALL,
            &cache,
            &progress,
        )?;
        for line in report.summary_lines() {
            println!("{line}");
        }
        for path in report.write(session.output_dir())? {
            report_written(&path);
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Curves(common)) => run_curves(common),
        Some(Commands::Fit(common)) => run_fit(common),
        Some(Commands::PredictionError {
            common,
            resampling,
            scheme,
        }) => run_prediction_error(common, resampling, scheme),
        Some(Commands::Auc { common, resampling }) => run_auc(common, resampling),
        Some(Commands::Run { common, resampling }) => run_all(common, resampling),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const YEAR: u64 = 365 * DAY;

    let (value, unit) = match seconds {
        s if s < MINUTE => return format!("{s} seconds ago"),
        s if s < HOUR => (s as f64 / MINUTE as f64, "minutes"),
        s if s < DAY => (s as f64 / HOUR as f64, "hours"),
        s if s < WEEK => (s as f64 / DAY as f64, "days"),
        s if s < YEAR => (s as f64 / WEEK as f64, "weeks"),
        s => (s as f64 / YEAR as f64, "years"),
    };
    format!("{value:.1} {unit} ago")
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("REARREST_RELEASE_TAG");
    let build_timestamp: u64 = option_env!("REARREST_BUILD_TIMESTAMP")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);

    println!("rearrest {version}");

    match release_tag {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
