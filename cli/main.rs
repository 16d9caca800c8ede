#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use phenosimplex::cohort::ReferenceCohort;
use phenosimplex::config::RunConfig;
use phenosimplex::geometry::select_features_max_volume;
use phenosimplex::progress::{BatchProgressObserver, BatchProgressStage};
use phenosimplex::roc::{auc, roc_curve, threshold_for_specificity};
use phenosimplex::tables::{
    read_feature_list, read_feature_matrix, read_labeled_scores, read_query_samples,
    read_reference_key, read_tumor_fractions, write_failures, write_report,
};
use phenosimplex::{
    AggregateMethod, Deconvolver, FeatureMatrix, OperatingCondition, ReferenceSimplex,
    SimplexBuilder,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum AggregateCli {
    Median,
    TrimmedMean,
    Mean,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ConditionCli {
    WholeGenome,
    UltraLowPass,
}

impl From<ConditionCli> for OperatingCondition {
    fn from(value: ConditionCli) -> Self {
        match value {
            ConditionCli::WholeGenome => OperatingCondition::WholeGenome,
            ConditionCli::UltraLowPass => OperatingCondition::UltraLowPass,
        }
    }
}

#[derive(Args)]
pub struct BuildArgs {
    /// Reference feature matrix TSV (sample column followed by feature columns); repeatable
    #[arg(long = "reference", value_name = "PATH", required = true)]
    pub references: Vec<PathBuf>,

    /// Reference key TSV mapping sample identifiers to phenotype labels
    #[arg(long, value_name = "PATH")]
    pub key: PathBuf,

    /// Feature list (one name per line); all matrix columns are used when omitted
    #[arg(long, value_name = "PATH")]
    pub features: Option<PathBuf>,

    /// Comma-separated phenotypes to keep, in vertex order
    #[arg(long, value_delimiter = ',')]
    pub phenotypes: Option<Vec<String>>,

    /// Pick the feature subset maximizing the weighted simplex volume
    #[arg(long)]
    pub select_features: bool,

    /// Min/max standardize features on the reference cohorts
    #[arg(long)]
    pub standardize: bool,

    /// Aggregate used to collapse each cohort into its vertex
    #[arg(long, value_enum)]
    pub aggregate: Option<AggregateCli>,

    /// Proportion trimmed from each tail by the trimmed-mean aggregate
    #[arg(long, default_value = "0.1")]
    pub trim_proportion: f64,

    /// Run configuration TOML; command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Where to write the basis artifact
    #[arg(long, default_value = "basis.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct DeconvolveArgs {
    /// Query feature matrix TSV
    #[arg(value_name = "QUERY_PATH")]
    pub query: PathBuf,

    /// Basis artifact written by `build`
    #[arg(long, value_name = "PATH")]
    pub basis: PathBuf,

    /// Tumor-fraction TSV (sample, tumor_fraction); blank or NA means unknown
    #[arg(long, value_name = "PATH")]
    pub tumor_fractions: Option<PathBuf>,

    /// Run configuration TOML; command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Label of the healthy reference phenotype
    #[arg(long)]
    pub normal_phenotype: Option<String>,

    /// Phenotype whose weight is thresholded into a call
    #[arg(long)]
    pub phenotype: Option<String>,

    /// Operating condition selecting the calibrated threshold
    #[arg(long, value_enum)]
    pub condition: Option<ConditionCli>,

    /// Threshold for the selected condition, overriding the configured one
    #[arg(long)]
    pub threshold: Option<f64>,

    #[arg(long, default_value = "deconvolution.tsv")]
    pub output: PathBuf,

    #[arg(long, default_value = "failures.tsv")]
    pub failures: PathBuf,
}

#[derive(Args)]
pub struct RocArgs {
    /// Labeled score table TSV
    #[arg(value_name = "TABLE_PATH")]
    pub table: PathBuf,

    /// Column holding 1/0 (or true/false) truth labels
    #[arg(long, default_value = "truth")]
    pub truth_column: String,

    /// Column holding the scores, e.g. a phenotype weight column of a report
    #[arg(long)]
    pub score_column: String,

    #[arg(long, default_value = "1000")]
    pub num_thresholds: usize,

    /// Report the smallest threshold reaching this specificity
    #[arg(long)]
    pub target_specificity: Option<f64>,
}

#[derive(Parser)]
#[command(
    name = "phenosimplex",
    about = "Phenotype deconvolution of cfDNA feature profiles",
    long_about = "Builds a reference simplex from labeled cohorts, projects tumor-fraction \
                 corrected samples onto it, and thresholds phenotype weights into calls."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a reference simplex from labeled reference cohorts
    #[command(about = "Build a reference simplex (outputs: basis.toml)")]
    Build(BuildArgs),

    /// Deconvolve query samples against a saved reference simplex
    #[command(about = "Deconvolve samples (outputs: deconvolution.tsv, failures.tsv)")]
    Deconvolve(DeconvolveArgs),

    /// Summarize an ROC curve over labeled scores
    #[command(about = "Calibrate a threshold from labeled scores")]
    Roc(RocArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Build(args)) => build(args),
        Some(Commands::Deconvolve(args)) => deconvolve(args),
        Some(Commands::Roc(args)) => roc(args),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(RunConfig::load(path)?)
        }
        None => Ok(RunConfig::default()),
    }
}

pub fn build(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(aggregate) = args.aggregate {
        config.basis.aggregate = match aggregate {
            AggregateCli::Median => AggregateMethod::Median,
            AggregateCli::TrimmedMean => AggregateMethod::TrimmedMean {
                proportion: args.trim_proportion,
            },
            AggregateCli::Mean => AggregateMethod::Mean,
        };
    }
    if args.standardize {
        config.basis.standardize = true;
    }

    let feature_list = match &args.features {
        Some(path) => Some(read_feature_list(path)?),
        None => None,
    };

    let mut matrices = Vec::with_capacity(args.references.len());
    for path in &args.references {
        println!("Loading reference matrix from: {}", path.display());
        matrices.push(read_feature_matrix(path, feature_list.as_deref())?);
    }
    let reference = FeatureMatrix::concat(matrices)?;
    let key = read_reference_key(&args.key)?;
    let cohorts: Vec<ReferenceCohort> = key.resolve(&reference, args.phenotypes.as_deref())?;

    let candidates = reference.features().to_vec();
    let features = if args.select_features {
        select_features_max_volume(&cohorts, &candidates, config.basis.aggregate)?
    } else {
        candidates
    };
    println!(
        "Building simplex over {} feature(s) for phenotypes: {}",
        features.len(),
        cohorts
            .iter()
            .map(|c| format!("{} (n={})", c.label(), c.len()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (simplex, warning) = SimplexBuilder::new(config.basis.aggregate)
        .with_standardization(config.basis.standardize)
        .build_checked(&cohorts, &features)?;
    if let Some(warning) = warning {
        eprintln!("Warning: {warning}");
    }
    let geometry = simplex.geometry()?;
    println!(
        "Simplex affine rank {} of {}, volume {:.4e}",
        geometry.affine_rank,
        simplex.k().saturating_sub(1),
        geometry.volume
    );

    simplex.save(&args.output)?;
    println!("Basis saved to: {}", args.output.display());
    Ok(())
}

struct BarProgress {
    pb: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { pb }
    }
}

impl BatchProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: BatchProgressStage, total_samples: usize) {
        self.pb.set_length(total_samples as u64);
        self.pb.set_message(stage.to_string());
    }

    fn on_sample_done(&self, _stage: BatchProgressStage, _sample: &str, _succeeded: bool) {
        self.pb.inc(1);
    }

    fn on_stage_finish(&self, _stage: BatchProgressStage) {
        self.pb.finish_and_clear();
    }
}

pub fn deconvolve(args: DeconvolveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(normal) = args.normal_phenotype {
        config.normal_phenotype = normal;
    }
    if let Some(phenotype) = args.phenotype {
        config.classification.phenotype = Some(phenotype);
    }
    if let Some(condition) = args.condition {
        config.classification.condition = condition.into();
    }
    if let Some(value) = args.threshold {
        match config.classification.condition {
            OperatingCondition::WholeGenome => config.classification.thresholds.whole_genome = value,
            OperatingCondition::UltraLowPass => {
                config.classification.thresholds.ultra_low_pass = value
            }
        }
    }
    config.validate()?;

    println!("Loading basis from: {}", args.basis.display());
    let simplex = ReferenceSimplex::load(&args.basis)?;
    println!(
        "Basis has {} phenotype(s) over {} feature(s)",
        simplex.k(),
        simplex.n_features()
    );

    let fractions = match &args.tumor_fractions {
        Some(path) => read_tumor_fractions(path)?,
        None => HashMap::new(),
    };
    let query = read_query_samples(&args.query, simplex.features(), &fractions)?;

    let deconvolver = Deconvolver::new(&simplex, &config)?;
    let mut report = deconvolver.run_batch(&query.samples, &BarProgress::new());
    report.add_failures(query.failures);

    write_report(
        &args.output,
        &report,
        simplex.phenotypes(),
        &config.normal_phenotype,
    )?;
    println!(
        "Results for {} sample(s) saved to: {}",
        report.successes.len(),
        args.output.display()
    );
    write_failures(&args.failures, &report.failures)?;
    println!(
        "{} sample(s) failed; details saved to: {}",
        report.failures.len(),
        args.failures.display()
    );
    Ok(())
}

pub fn roc(args: RocArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (truth, scores) = read_labeled_scores(&args.table, &args.truth_column, &args.score_column)?;
    println!(
        "Loaded {} scores ({} positive)",
        scores.len(),
        truth.iter().filter(|&&t| t).count()
    );
    let curve = roc_curve(&truth, &scores, args.num_thresholds)?;
    println!("AUC: {:.4}", auc(&curve));
    if let Some(target) = args.target_specificity {
        let point = threshold_for_specificity(&truth, &scores, target, args.num_thresholds)?;
        println!(
            "Threshold {:.4} reaches specificity {:.4} with sensitivity {:.4}",
            point.threshold,
            1.0 - point.fpr,
            point.tpr
        );
    }
    Ok(())
}
