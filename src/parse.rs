use crate::process::{
    record_diagnostic, CriterionRecord, Diagnostic, DiagnosticKind, GenotypeDimensions, GroupKey,
    KSelectError, LrtRecord, RunRecord, StageOutcome,
};

use flate2::read::MultiGzDecoder;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Text STRUCTURE prints in front of its final log-likelihood estimate.
pub const LOGLIK_MARKER: &str = "Estimated Ln Prob of Data";

pub const DEFAULT_RUN_PREFIX: &str = "structure_run_";

static GENOTYPE_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^model(\d+)_replicate(\d+)_cleaned\.str(\.gz)?$")
        .expect("genotype file pattern is valid")
});

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File name prefix preceding `K<k>_f`.
    pub prefix: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_RUN_PREFIX.to_string(),
        }
    }
}

/// Recognizes run output files and decodes (model, replicate, K) from their paths.
#[derive(Debug, Clone)]
pub struct RunPathPattern {
    name_re: Regex,
    path_re: Regex,
}

impl RunPathPattern {
    pub fn new(prefix: &str) -> Result<Self, KSelectError> {
        let escaped = regex::escape(prefix);
        let name_re = Regex::new(&format!(r"^{}K\d+_f$", escaped))
            .map_err(|e| KSelectError::Configuration(format!("bad run prefix '{}': {}", prefix, e)))?;
        let path_re = Regex::new(&format!(r"model(\d+)/replicate(\d+)/{}K(\d+)_f$", escaped))
            .map_err(|e| KSelectError::Configuration(format!("bad run prefix '{}': {}", prefix, e)))?;
        Ok(Self { name_re, path_re })
    }

    pub fn is_candidate(&self, file_name: &str) -> bool {
        self.name_re.is_match(file_name)
    }

    /// Returns `(model<N>, M, K)` for paths ending in `model<N>/replicate<M>/<prefix>K<K>_f`.
    pub fn extract_key(&self, path: &Path) -> Option<(String, u32, u32)> {
        let normalized = path.to_string_lossy().replace('\\', "/");
        let caps = self.path_re.captures(&normalized)?;
        let model = format!("model{}", &caps[1]);
        let replicate = caps[2].parse().ok()?;
        let k = caps[3].parse().ok()?;
        Some((model, replicate, k))
    }
}

/// Reads the value after the final `=` on the first line carrying [`LOGLIK_MARKER`].
pub fn extract_log_likelihood<R: BufRead>(reader: R) -> Result<f64, KSelectError> {
    for line in reader.lines() {
        let line = line?;
        if !line.contains(LOGLIK_MARKER) {
            continue;
        }
        let value = line.rsplit('=').next().unwrap_or("").trim();
        return match value.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(KSelectError::Parse(format!(
                "could not parse likelihood from '{}'",
                line.trim()
            ))),
        };
    }
    Err(KSelectError::Parse(format!("no '{}' line", LOGLIK_MARKER)))
}

/// Opens a plain or gzip-compressed text file.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead>, KSelectError> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

fn require_dir(path: &Path) -> Result<(), KSelectError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(KSelectError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("directory not found: {}", path.display()),
        )))
    }
}

/// Lists every file below `root` whose name matches the run pattern, sorted by path.
pub fn find_run_outputs(root: &Path, pattern: &RunPathPattern) -> Result<Vec<PathBuf>, KSelectError> {
    require_dir(root)?;
    let search = format!("{}/**/*_f", glob::Pattern::escape(&root.to_string_lossy()));
    let mut paths = Vec::new();
    for entry in glob::glob(&search)? {
        match entry {
            Ok(path) => {
                let is_candidate = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| pattern.is_candidate(n))
                    .unwrap_or(false);
                if is_candidate && path.is_file() {
                    paths.push(path);
                }
            }
            Err(e) => warn!("Unreadable entry while scanning {}: {}", root.display(), e),
        }
    }
    // Traversal order must not decide which duplicate wins.
    paths.sort();
    Ok(paths)
}

/// Collapses decoded runs into one record per (model, replicate, K).
///
/// When the same key shows up twice the later observation replaces the
/// earlier one and a `DuplicateRun` diagnostic names both sources. Output is
/// sorted by model, replicate and K. An empty input yields an empty table and
/// a `DegenerateInput` diagnostic.
pub fn aggregate_runs<I>(observations: I) -> StageOutcome<RunRecord>
where
    I: IntoIterator<Item = RunRecord>,
{
    let mut diagnostics = Vec::new();
    let mut by_key: BTreeMap<(String, u32, u32), RunRecord> = BTreeMap::new();

    for run in observations {
        let key = (run.model.clone(), run.replicate, run.k);
        let source = run.source.clone();
        if let Some(previous) = by_key.insert(key, run) {
            record_diagnostic(
                &mut diagnostics,
                DiagnosticKind::DuplicateRun,
                source,
                format!(
                    "replaces earlier run {} for {} replicate {} K={}",
                    previous.source, previous.model, previous.replicate, previous.k
                ),
            );
        }
    }

    if by_key.is_empty() {
        record_diagnostic(
            &mut diagnostics,
            DiagnosticKind::DegenerateInput,
            "aggregation",
            "empty result set: no run produced a log-likelihood",
        );
    }

    StageOutcome {
        records: by_key.into_values().collect(),
        diagnostics,
    }
}

/// Walks `root`, reads every recognized run output and aggregates the results.
pub fn scan_run_outputs(root: &Path, config: &ScanConfig) -> Result<StageOutcome<RunRecord>, KSelectError> {
    let pattern = RunPathPattern::new(&config.prefix)?;
    let candidates = find_run_outputs(root, &pattern)?;
    info!("Found {} candidate run outputs under {}", candidates.len(), root.display());

    let mut diagnostics = Vec::new();
    let mut observations = Vec::with_capacity(candidates.len());

    for path in &candidates {
        let source = path.display().to_string();
        let (model, replicate, k) = match pattern.extract_key(path) {
            Some(key) => key,
            None => {
                record_diagnostic(
                    &mut diagnostics,
                    DiagnosticKind::MalformedSource,
                    source,
                    "skipped (pattern mismatch)",
                );
                continue;
            }
        };
        if k == 0 {
            record_diagnostic(&mut diagnostics, DiagnosticKind::MalformedSource, source, "K must be at least 1");
            continue;
        }

        let parsed = File::open(path)
            .map_err(KSelectError::from)
            .and_then(|file| extract_log_likelihood(BufReader::new(file)));
        match parsed {
            Ok(log_likelihood) => {
                debug!("{} replicate {} K={}: lnL {}", model, replicate, k, log_likelihood);
                observations.push(RunRecord {
                    model,
                    replicate,
                    k,
                    log_likelihood,
                    source,
                });
            }
            Err(e) => record_diagnostic(&mut diagnostics, DiagnosticKind::MalformedSource, source, e.to_string()),
        }
    }

    let mut outcome = aggregate_runs(observations);
    diagnostics.append(&mut outcome.diagnostics);
    outcome.diagnostics = diagnostics;
    Ok(outcome)
}

/// Counts individuals (non-blank rows) and free allele-frequency columns.
///
/// The first column of each row is the individual label. Every row must have
/// the same number of columns. An empty matrix gives zero individuals.
pub fn parse_genotype_dimensions<R: BufRead>(
    reader: R,
    alleles_per_locus: u32,
) -> Result<GenotypeDimensions, KSelectError> {
    let mut individuals = 0u64;
    let mut columns: Option<usize> = None;

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let width = trimmed.split_whitespace().count();
        match columns {
            None => columns = Some(width),
            Some(expected) if expected != width => {
                return Err(KSelectError::Parse(format!(
                    "row on line {} has {} columns, expected {}",
                    line_num + 1,
                    width,
                    expected
                )));
            }
            Some(_) => {}
        }
        individuals += 1;
    }

    let loci = columns.map(|c| c.saturating_sub(1)).unwrap_or(0) as u64;
    Ok(GenotypeDimensions {
        individuals,
        alleles: loci * u64::from(alleles_per_locus.saturating_sub(1)),
    })
}

/// Maps `model<N>_replicate<M>_cleaned.str[.gz]` to its (model, replicate) key.
pub fn genotype_file_key(file_name: &str) -> Option<GroupKey> {
    let caps = GENOTYPE_FILE_RE.captures(file_name)?;
    let replicate = caps[2].parse().ok()?;
    Some((format!("model{}", &caps[1]), replicate))
}

#[derive(Debug, Clone, Default)]
pub struct GenotypeLookup {
    pub dimensions: HashMap<GroupKey, GenotypeDimensions>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Reads every genotype matrix in `dir`. Files that fail to parse are
/// reported and left out of the lookup.
pub fn scan_genotype_dir(dir: &Path, alleles_per_locus: u32) -> Result<GenotypeLookup, KSelectError> {
    require_dir(dir)?;
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut lookup = GenotypeLookup::default();
    for path in paths {
        let key = match path.file_name().and_then(|n| n.to_str()).and_then(genotype_file_key) {
            Some(key) => key,
            None => continue,
        };
        let parsed = open_reader(&path).and_then(|reader| parse_genotype_dimensions(reader, alleles_per_locus));
        match parsed {
            Ok(dims) => {
                debug!(
                    "{}: {} individuals, {} alleles",
                    path.display(),
                    dims.individuals,
                    dims.alleles
                );
                lookup.dimensions.insert(key, dims);
            }
            Err(e) => record_diagnostic(
                &mut lookup.diagnostics,
                DiagnosticKind::MalformedSource,
                path.display().to_string(),
                e.to_string(),
            ),
        }
    }
    Ok(lookup)
}

fn is_null_token(value: &str) -> bool {
    ["", "na", "nan", "null", "none"]
        .iter()
        .any(|token| value.eq_ignore_ascii_case(token))
}

/// Accepts `3`, `3.0` or `replicate3`.
fn parse_replicate(value: &str) -> Option<u32> {
    parse_whole_number(value.strip_prefix("replicate").unwrap_or(value))
}

fn parse_whole_number(value: &str) -> Option<u32> {
    if let Ok(v) = value.parse::<u32>() {
        return Some(v);
    }
    let v = value.parse::<f64>().ok()?;
    if v.fract() == 0.0 && v >= 0.0 && v <= f64::from(u32::MAX) {
        Some(v as u32)
    } else {
        None
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize, KSelectError> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| KSelectError::Parse(format!("{}: missing '{}' column", path.display(), name)))
}

/// Loads a run table (`model,replicate,K,log_likelihood[,file]`).
///
/// Rows with an empty or NA required field are dropped before anything else
/// sees them. Rows whose values do not parse are reported and skipped. Rows
/// are not deduplicated, so repeated K values form the resampling pool of the
/// bootstrap test.
pub fn read_run_table(path: &Path) -> Result<StageOutcome<RunRecord>, KSelectError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let model_idx = column_index(&headers, "model", path)?;
    let replicate_idx = column_index(&headers, "replicate", path)?;
    let k_idx = column_index(&headers, "K", path)?;
    let loglik_idx = column_index(&headers, "log_likelihood", path)?;
    let file_idx = headers.iter().position(|h| h.trim() == "file");

    let mut records = Vec::new();
    let mut diagnostics = Vec::new();
    let mut dropped = 0usize;

    for (line_num, result) in reader.records().enumerate() {
        let record = result?;
        let subject = format!("{}:{}", path.display(), line_num + 2);

        let fields: Option<Vec<&str>> = [model_idx, replicate_idx, k_idx, loglik_idx]
            .iter()
            .map(|&i| record.get(i).map(str::trim).filter(|v| !is_null_token(v)))
            .collect();
        let fields = match fields {
            Some(fields) => fields,
            None => {
                dropped += 1;
                continue;
            }
        };

        let replicate = parse_replicate(fields[1]);
        let k = parse_whole_number(fields[2]).filter(|&k| k >= 1);
        let log_likelihood = fields[3].parse::<f64>().ok().filter(|v| v.is_finite());
        match (replicate, k, log_likelihood) {
            (Some(replicate), Some(k), Some(log_likelihood)) => {
                let source = file_idx
                    .and_then(|i| record.get(i))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .unwrap_or(subject);
                records.push(RunRecord {
                    model: fields[0].to_string(),
                    replicate,
                    k,
                    log_likelihood,
                    source,
                });
            }
            _ => record_diagnostic(
                &mut diagnostics,
                DiagnosticKind::MalformedSource,
                subject,
                format!(
                    "unparseable row (replicate '{}', K '{}', log_likelihood '{}')",
                    fields[1], fields[2], fields[3]
                ),
            ),
        }
    }

    if dropped > 0 {
        info!("Dropped {} rows with missing fields from {}", dropped, path.display());
    }
    if records.is_empty() {
        record_diagnostic(
            &mut diagnostics,
            DiagnosticKind::DegenerateInput,
            path.display().to_string(),
            "empty result set: no usable rows",
        );
    }

    records.sort_by(|a, b| (&a.model, a.replicate, a.k).cmp(&(&b.model, b.replicate, b.k)));
    Ok(StageOutcome { records, diagnostics })
}

fn parse_field<T: FromStr>(
    record: &csv::StringRecord,
    idx: usize,
    name: &str,
    line: usize,
) -> Result<T, KSelectError> {
    let raw = record.get(idx).map(str::trim).unwrap_or("");
    raw.parse()
        .map_err(|_| KSelectError::Parse(format!("line {}: invalid {} '{}'", line, name, raw)))
}

/// Loads a criteria table written by the `criteria` command.
pub fn read_criterion_table(path: &Path) -> Result<Vec<CriterionRecord>, KSelectError> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let idx: Vec<usize> = ["model", "replicate", "K", "lnL", "I", "A", "p", "AIC", "BIC"]
        .iter()
        .map(|name| column_index(&headers, name, path))
        .collect::<Result<_, _>>()?;

    let mut records = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        let record = result?;
        let line = line_num + 2;
        let bic_raw = record.get(idx[8]).map(str::trim).unwrap_or("");
        let bic = if is_null_token(bic_raw) {
            None
        } else {
            Some(parse_field::<f64>(&record, idx[8], "BIC", line)?)
        };
        records.push(CriterionRecord {
            model: record.get(idx[0]).unwrap_or("").trim().to_string(),
            replicate: parse_field(&record, idx[1], "replicate", line)?,
            k: parse_field(&record, idx[2], "K", line)?,
            log_likelihood: parse_field(&record, idx[3], "lnL", line)?,
            individuals: parse_field(&record, idx[4], "I", line)?,
            alleles: parse_field(&record, idx[5], "A", line)?,
            free_parameters: parse_field(&record, idx[6], "p", line)?,
            aic: parse_field(&record, idx[7], "AIC", line)?,
            bic,
        });
    }
    records.sort_by(|a, b| (&a.model, a.replicate, a.k).cmp(&(&b.model, b.replicate, b.k)));
    Ok(records)
}

/// Loads an LRT table written by the `lrt` command.
pub fn read_lrt_table(path: &Path) -> Result<Vec<LrtRecord>, KSelectError> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let idx: Vec<usize> = ["model", "replicate", "K0", "K1", "loglik_K0", "loglik_K1", "T_obs", "p_value"]
        .iter()
        .map(|name| column_index(&headers, name, path))
        .collect::<Result<_, _>>()?;

    let mut records = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        let record = result?;
        let line = line_num + 2;
        records.push(LrtRecord {
            model: record.get(idx[0]).unwrap_or("").trim().to_string(),
            replicate: parse_field(&record, idx[1], "replicate", line)?,
            k0: parse_field(&record, idx[2], "K0", line)?,
            k1: parse_field(&record, idx[3], "K1", line)?,
            loglik_k0: parse_field(&record, idx[4], "loglik_K0", line)?,
            loglik_k1: parse_field(&record, idx[5], "loglik_K1", line)?,
            t_obs: parse_field(&record, idx[6], "T_obs", line)?,
            p_value: parse_field(&record, idx[7], "p_value", line)?,
        });
    }
    records.sort_by(|a, b| (&a.model, a.replicate, a.k0).cmp(&(&b.model, b.replicate, b.k0)));
    Ok(records)
}
