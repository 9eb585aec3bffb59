use crate::parse::{
    read_criterion_table, read_lrt_table, read_run_table, scan_genotype_dir, scan_run_outputs,
    ScanConfig,
};

use crate::progress::{create_spinner, finish_spinner};

use crate::stats::{
    bootstrap_lrt, compute_criteria, select_best_k, summarize_by_model, BestK, LrtConfig,
    ModelKSummary, DEFAULT_ALPHA,
};

use clap::{Args as ClapArgs, Parser, Subcommand};
use colored::*;
use csv::WriterBuilder;
use log::{info, warn};
use prettytable::{row, Table};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

// Define command-line arguments using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Worker threads for the bootstrap stage
    #[arg(long = "threads", global = true)]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect log-likelihoods from clustering run outputs into one table
    Parse(ParseArgs),
    /// Compute AIC and BIC for every run
    Criteria(CriteriaArgs),
    /// Bootstrap likelihood-ratio test between adjacent K values
    Lrt(LrtArgs),
    /// Summarize criteria and LRT tables and report the best K
    Summary(SummaryArgs),
}

#[derive(ClapArgs, Debug)]
pub struct ParseArgs {
    /// Base directory of the clustering run outputs
    #[arg(long = "indir")]
    pub indir: PathBuf,

    /// Output CSV file
    #[arg(long = "outfile", default_value = "structure_loglik_summary.csv")]
    pub outfile: PathBuf,

    /// File name prefix preceding `K<k>_f`
    #[arg(long = "prefix", default_value = "structure_run_")]
    pub prefix: String,
}

#[derive(ClapArgs, Debug)]
pub struct CriteriaArgs {
    /// Base directory of the clustering run outputs
    #[arg(long = "indir", conflicts_with = "input", required_unless_present = "input")]
    pub indir: Option<PathBuf>,

    /// Log-likelihood table written by `parse`
    #[arg(long = "input")]
    pub input: Option<PathBuf>,

    /// Directory holding the `model<N>_replicate<M>_cleaned.str` genotype files
    #[arg(long = "strdir")]
    pub strdir: PathBuf,

    /// Output CSV file
    #[arg(long = "outfile", default_value = "structure_aic_bic_summary.csv")]
    pub outfile: PathBuf,

    /// Optional CSV for the per-replicate best K
    #[arg(long = "best_k_output")]
    pub best_k_output: Option<PathBuf>,

    /// Alleles observed per locus
    #[arg(long = "alleles_per_locus", default_value = "2")]
    pub alleles_per_locus: u32,

    /// File name prefix preceding `K<k>_f`
    #[arg(long = "prefix", default_value = "structure_run_")]
    pub prefix: String,
}

#[derive(ClapArgs, Debug)]
pub struct LrtArgs {
    /// Log-likelihood table written by `parse`
    #[arg(long = "input")]
    pub input: PathBuf,

    /// Output CSV file
    #[arg(long = "output", default_value = "bootstrap_lrt_results.csv")]
    pub output: PathBuf,

    /// Number of bootstrap replicates
    #[arg(long = "bootstraps", default_value = "100", allow_hyphen_values = true)]
    pub bootstraps: i64,

    /// Seed for reproducible resampling
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Significance level used when choosing K from the test chain
    #[arg(long = "alpha", default_value = "0.05")]
    pub alpha: f64,
}

#[derive(ClapArgs, Debug)]
pub struct SummaryArgs {
    /// Criteria table written by `criteria`
    #[arg(long = "criteria")]
    pub criteria: PathBuf,

    /// LRT table written by `lrt`
    #[arg(long = "lrt")]
    pub lrt: Option<PathBuf>,

    /// Significance level used when choosing K from the test chain
    #[arg(long = "alpha", default_value = "0.05")]
    pub alpha: f64,

    /// Optional CSV for the per-replicate best K
    #[arg(long = "output")]
    pub output: Option<PathBuf>,
}

/// One clustering run: the log-likelihood reported for a (model, replicate, K).
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub model: String,
    pub replicate: u32,
    pub k: u32,
    pub log_likelihood: f64,
    pub source: String,
}

impl RunRecord {
    pub fn group_key(&self) -> GroupKey {
        (self.model.clone(), self.replicate)
    }
}

/// (model, replicate)
pub type GroupKey = (String, u32);

/// Shape of the genotype matrix a replicate was clustered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenotypeDimensions {
    pub individuals: u64,
    pub alleles: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriterionRecord {
    pub model: String,
    pub replicate: u32,
    pub k: u32,
    pub log_likelihood: f64,
    pub individuals: u64,
    pub alleles: u64,
    pub free_parameters: u64,
    pub aic: f64,
    /// `None` when the matrix had no individuals and ln(I) is undefined.
    pub bic: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LrtRecord {
    pub model: String,
    pub replicate: u32,
    pub k0: u32,
    pub k1: u32,
    pub loglik_k0: f64,
    pub loglik_k1: f64,
    pub t_obs: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A run output or genotype file could not be parsed.
    MalformedSource,
    /// A group or K pair lacks the companion data it must be joined with.
    MissingJoinKey,
    /// Input that makes a statistic undefined, or an empty result set.
    DegenerateInput,
    /// A later run output replaced an earlier one for the same key.
    DuplicateRun,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiagnosticKind::MalformedSource => write!(f, "malformed source"),
            DiagnosticKind::MissingJoinKey => write!(f, "missing join key"),
            DiagnosticKind::DegenerateInput => write!(f, "degenerate input"),
            DiagnosticKind::DuplicateRun => write!(f, "duplicate run"),
        }
    }
}

/// A non-fatal condition met while building a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}

/// Logs a diagnostic and appends it to `diagnostics`.
pub fn record_diagnostic(
    diagnostics: &mut Vec<Diagnostic>,
    kind: DiagnosticKind,
    subject: impl Into<String>,
    message: impl Into<String>,
) {
    let diagnostic = Diagnostic {
        kind,
        subject: subject.into(),
        message: message.into(),
    };
    warn!("{}", diagnostic);
    diagnostics.push(diagnostic);
}

/// Records produced by one stage plus everything it had to skip.
#[derive(Debug, Clone)]
pub struct StageOutcome<T> {
    pub records: Vec<T>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> StageOutcome<T> {
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

// Custom error types
#[derive(Debug, thiserror::Error)]
pub enum KSelectError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Invalid search pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub fn run(args: &Args) -> Result<(), KSelectError> {
    match &args.command {
        Command::Parse(cmd) => run_parse(cmd),
        Command::Criteria(cmd) => run_criteria(cmd),
        Command::Lrt(cmd) => run_lrt(cmd),
        Command::Summary(cmd) => run_summary(cmd),
    }
}

fn run_parse(args: &ParseArgs) -> Result<(), KSelectError> {
    println!("{}", "Scanning for STRUCTURE output files...".green());
    let spinner = create_spinner(&format!("Scanning {}", args.indir.display()));
    let scan = ScanConfig {
        prefix: args.prefix.clone(),
    };
    let outcome = scan_run_outputs(&args.indir, &scan)?;
    finish_spinner(&spinner, &format!("Collected {} runs", outcome.records.len()));
    display_diagnostics(&outcome.diagnostics, 20);

    if outcome.records.is_empty() {
        println!("{}", "No valid STRUCTURE output files parsed.".yellow());
        return Ok(());
    }

    let mut writer = create_and_setup_csv_writer(&args.outfile)?;
    write_run_records(&mut writer, &outcome.records)?;
    writer.flush()?;
    println!(
        "{}",
        format!(
            "Done. Parsed log-likelihoods written to {} with {} rows.",
            args.outfile.display(),
            outcome.records.len()
        )
        .green()
    );
    Ok(())
}

fn run_criteria(args: &CriteriaArgs) -> Result<(), KSelectError> {
    if args.alleles_per_locus == 0 {
        return Err(KSelectError::Configuration(
            "alleles_per_locus must be at least 1".to_string(),
        ));
    }

    let mut diagnostics = Vec::new();
    let runs = match (&args.indir, &args.input) {
        (Some(indir), _) => {
            let scan = ScanConfig {
                prefix: args.prefix.clone(),
            };
            scan_run_outputs(indir, &scan)?
        }
        (None, Some(input)) => read_run_table(input)?,
        (None, None) => {
            return Err(KSelectError::Configuration(
                "either --indir or --input is required".to_string(),
            ))
        }
    };
    diagnostics.extend(runs.diagnostics);

    let dims = scan_genotype_dir(&args.strdir, args.alleles_per_locus)?;
    info!("Loaded genotype dimensions for {} replicates", dims.dimensions.len());
    diagnostics.extend(dims.diagnostics);

    let criteria = compute_criteria(&runs.records, &dims.dimensions);
    diagnostics.extend(criteria.diagnostics);
    display_diagnostics(&diagnostics, 20);

    if criteria.records.is_empty() {
        println!(
            "{}",
            "No data found. Check if STRUCTURE outputs and .str files were correctly matched."
                .yellow()
        );
        return Ok(());
    }

    let mut writer = create_and_setup_csv_writer(&args.outfile)?;
    write_criterion_records(&mut writer, &criteria.records)?;
    writer.flush()?;

    let best = select_best_k(&criteria.records, &[], DEFAULT_ALPHA);
    display_best_k(&best);
    if let Some(path) = &args.best_k_output {
        let mut writer = create_and_setup_csv_writer(path)?;
        write_best_k_records(&mut writer, &best)?;
        writer.flush()?;
    }

    println!(
        "{}",
        format!("Done! Output saved to {}", args.outfile.display()).green()
    );
    Ok(())
}

fn run_lrt(args: &LrtArgs) -> Result<(), KSelectError> {
    // Reject the configuration before touching the input.
    if args.bootstraps <= 0 {
        return Err(KSelectError::Configuration(format!(
            "bootstraps must be at least 1, got {}",
            args.bootstraps
        )));
    }
    let config = LrtConfig {
        bootstraps: args.bootstraps as usize,
        seed: args.seed,
        alpha: args.alpha,
    };
    config.validate()?;

    let runs = read_run_table(&args.input)?;
    let spinner = create_spinner(&format!(
        "Running {} bootstrap replicates per K pair",
        config.bootstraps
    ));
    let lrt = bootstrap_lrt(&runs.records, &config)?;
    finish_spinner(&spinner, &format!("Tested {} K pairs", lrt.records.len()));

    let mut diagnostics = runs.diagnostics;
    diagnostics.extend(lrt.diagnostics);
    display_diagnostics(&diagnostics, 20);

    let mut writer = create_and_setup_csv_writer(&args.output)?;
    write_lrt_records(&mut writer, &lrt.records)?;
    writer.flush()?;
    println!(
        "{}",
        format!("Bootstrap LRT results written to: {}", args.output.display()).green()
    );
    Ok(())
}

fn run_summary(args: &SummaryArgs) -> Result<(), KSelectError> {
    if !(args.alpha > 0.0 && args.alpha < 1.0) {
        return Err(KSelectError::Configuration(format!(
            "alpha must lie in (0, 1), got {}",
            args.alpha
        )));
    }
    let criteria = read_criterion_table(&args.criteria)?;
    let lrt = match &args.lrt {
        Some(path) => read_lrt_table(path)?,
        None => Vec::new(),
    };

    display_model_summary(&summarize_by_model(&criteria));
    let best = select_best_k(&criteria, &lrt, args.alpha);
    display_best_k(&best);

    if let Some(path) = &args.output {
        let mut writer = create_and_setup_csv_writer(path)?;
        write_best_k_records(&mut writer, &best)?;
        writer.flush()?;
        println!(
            "{}",
            format!("Best K table written to {}", path.display()).green()
        );
    }
    Ok(())
}

fn create_and_setup_csv_writer(
    output_file: &Path,
) -> Result<csv::Writer<BufWriter<File>>, KSelectError> {
    let file = File::create(output_file)?;
    let buf_writer = BufWriter::new(file);
    let writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(buf_writer);
    Ok(writer)
}

/// CSV float columns keep full precision so derived columns can be recomputed.
fn format_optional_float(val_opt: Option<f64>) -> String {
    match val_opt {
        Some(val) => val.to_string(),
        None => "NA".to_string(),
    }
}

fn format_optional_k(val_opt: Option<u32>) -> String {
    match val_opt {
        Some(val) => val.to_string(),
        None => "NA".to_string(),
    }
}

pub fn write_run_records<W: Write>(
    writer: &mut csv::Writer<W>,
    records: &[RunRecord],
) -> Result<(), KSelectError> {
    writer.write_record(["model", "replicate", "K", "log_likelihood", "file"])?;
    for r in records {
        writer.write_record([
            &r.model,
            &r.replicate.to_string(),
            &r.k.to_string(),
            &r.log_likelihood.to_string(),
            &r.source,
        ])?;
    }
    Ok(())
}

pub fn write_criterion_records<W: Write>(
    writer: &mut csv::Writer<W>,
    records: &[CriterionRecord],
) -> Result<(), KSelectError> {
    writer.write_record(["model", "replicate", "K", "lnL", "I", "A", "p", "AIC", "BIC"])?;
    for r in records {
        writer.write_record([
            &r.model,
            &r.replicate.to_string(),
            &r.k.to_string(),
            &r.log_likelihood.to_string(),
            &r.individuals.to_string(),
            &r.alleles.to_string(),
            &r.free_parameters.to_string(),
            &r.aic.to_string(),
            &format_optional_float(r.bic),
        ])?;
    }
    Ok(())
}

pub fn write_lrt_records<W: Write>(
    writer: &mut csv::Writer<W>,
    records: &[LrtRecord],
) -> Result<(), KSelectError> {
    writer.write_record([
        "model",
        "replicate",
        "K0",
        "K1",
        "loglik_K0",
        "loglik_K1",
        "T_obs",
        "p_value",
    ])?;
    for r in records {
        writer.write_record([
            &r.model,
            &r.replicate.to_string(),
            &r.k0.to_string(),
            &r.k1.to_string(),
            &r.loglik_k0.to_string(),
            &r.loglik_k1.to_string(),
            &r.t_obs.to_string(),
            &r.p_value.to_string(),
        ])?;
    }
    Ok(())
}

pub fn write_best_k_records<W: Write>(
    writer: &mut csv::Writer<W>,
    records: &[BestK],
) -> Result<(), KSelectError> {
    writer.write_record(["model", "replicate", "best_K_AIC", "best_K_BIC", "best_K_LRT"])?;
    for r in records {
        writer.write_record([
            &r.model,
            &r.replicate.to_string(),
            &format_optional_k(r.best_k_aic),
            &format_optional_k(r.best_k_bic),
            &format_optional_k(r.best_k_lrt),
        ])?;
    }
    Ok(())
}

/// Prints up to `limit` diagnostics as a table, with a per-kind tally.
pub fn display_diagnostics(diagnostics: &[Diagnostic], limit: usize) {
    if diagnostics.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.add_row(row!["Kind", "Subject", "Message"]);
    for d in diagnostics.iter().take(limit) {
        table.add_row(row![d.kind.to_string(), d.subject, d.message]);
    }
    println!(
        "{}",
        format!("{} inputs were skipped or flagged:", diagnostics.len()).yellow()
    );
    table.printstd();
    if diagnostics.len() > limit {
        println!("... and {} more (see log for details)", diagnostics.len() - limit);
    }
}

pub fn display_best_k(best: &[BestK]) {
    if best.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.add_row(row!["Model", "Replicate", "Best K (AIC)", "Best K (BIC)", "Best K (LRT)"]);
    for b in best {
        table.add_row(row![
            b.model,
            b.replicate,
            format_optional_k(b.best_k_aic),
            format_optional_k(b.best_k_bic),
            format_optional_k(b.best_k_lrt),
        ]);
    }
    println!("\n{}", "Best K per replicate:".green().bold());
    table.printstd();
}

pub fn display_model_summary(summary: &[ModelKSummary]) {
    if summary.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.add_row(row!["Model", "K", "Replicates", "Mean lnL", "Mean AIC", "Mean BIC"]);
    for s in summary {
        table.add_row(row![
            s.model,
            s.k,
            s.replicates,
            format!("{:.4}", s.mean_log_likelihood),
            format!("{:.4}", s.mean_aic),
            s.mean_bic
                .map(|bic| format!("{:.4}", bic))
                .unwrap_or_else(|| "NA".to_string()),
        ]);
    }
    println!("\n{}", "Mean scores per model and K:".green().bold());
    table.printstd();
}
