use crate::process::{
    record_diagnostic, CriterionRecord, Diagnostic, DiagnosticKind, GenotypeDimensions, GroupKey,
    KSelectError, LrtRecord, RunRecord, StageOutcome,
};

use log::{debug, info};
use rand::{thread_rng, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DEFAULT_BOOTSTRAPS: usize = 100;
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Free parameters of a K-cluster admixture model: `I*(K-1)` membership
/// proportions plus `K*A` cluster allele frequencies.
pub fn free_parameters(individuals: u64, alleles: u64, k: u32) -> u64 {
    let k = u64::from(k);
    individuals * k.saturating_sub(1) + k * alleles
}

pub fn aic(log_likelihood: f64, free_parameters: u64) -> f64 {
    -2.0 * log_likelihood + 2.0 * free_parameters as f64
}

/// Returns `None` when there are no individuals, since ln(0) is undefined.
pub fn bic(log_likelihood: f64, free_parameters: u64, individuals: u64) -> Option<f64> {
    if individuals == 0 {
        return None;
    }
    Some(-2.0 * log_likelihood + free_parameters as f64 * (individuals as f64).ln())
}

/// Scores every run whose replicate has known genotype dimensions.
///
/// Groups without dimensions are reported once as `MissingJoinKey`. A group
/// whose matrix has no individuals still gets AIC, but BIC is left empty and
/// a `DegenerateInput` diagnostic is recorded.
pub fn compute_criteria(
    runs: &[RunRecord],
    dimensions: &HashMap<GroupKey, GenotypeDimensions>,
) -> StageOutcome<CriterionRecord> {
    let mut records = Vec::with_capacity(runs.len());
    let mut diagnostics = Vec::new();
    let mut missing: BTreeSet<GroupKey> = BTreeSet::new();
    let mut degenerate: BTreeSet<GroupKey> = BTreeSet::new();

    for run in runs {
        let key = run.group_key();
        let dims = match dimensions.get(&key) {
            Some(dims) => *dims,
            None => {
                if missing.insert(key.clone()) {
                    record_diagnostic(
                        &mut diagnostics,
                        DiagnosticKind::MissingJoinKey,
                        format!("{} replicate {}", key.0, key.1),
                        "no genotype matrix found for this replicate",
                    );
                }
                continue;
            }
        };

        let p = free_parameters(dims.individuals, dims.alleles, run.k);
        let bic_value = bic(run.log_likelihood, p, dims.individuals);
        if bic_value.is_none() && degenerate.insert(key.clone()) {
            record_diagnostic(
                &mut diagnostics,
                DiagnosticKind::DegenerateInput,
                format!("{} replicate {}", key.0, key.1),
                "genotype matrix has no individuals; BIC is undefined",
            );
        }

        records.push(CriterionRecord {
            model: run.model.clone(),
            replicate: run.replicate,
            k: run.k,
            log_likelihood: run.log_likelihood,
            individuals: dims.individuals,
            alleles: dims.alleles,
            free_parameters: p,
            aic: aic(run.log_likelihood, p),
            bic: bic_value,
        });
    }

    records.sort_by(|a, b| (&a.model, a.replicate, a.k).cmp(&(&b.model, b.replicate, b.k)));
    StageOutcome { records, diagnostics }
}

#[derive(Debug, Clone)]
pub struct LrtConfig {
    /// Bootstrap replicates per K pair.
    pub bootstraps: usize,
    /// Base seed; `None` draws one from the thread RNG.
    pub seed: Option<u64>,
    /// Significance level for the K chosen from the test chain.
    pub alpha: f64,
}

impl Default for LrtConfig {
    fn default() -> Self {
        Self {
            bootstraps: DEFAULT_BOOTSTRAPS,
            seed: None,
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl LrtConfig {
    pub fn validate(&self) -> Result<(), KSelectError> {
        if self.bootstraps == 0 {
            return Err(KSelectError::Configuration(
                "bootstraps must be at least 1".to_string(),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(KSelectError::Configuration(format!(
                "alpha must lie in (0, 1), got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Null distribution of the LRT statistic: each draw takes two values with
/// replacement from `pool` and returns `-2 * (a - b)`.
pub fn bootstrap_null_distribution<R: Rng + ?Sized>(
    pool: &[f64],
    bootstraps: usize,
    rng: &mut R,
) -> Vec<f64> {
    if pool.is_empty() {
        return Vec::new();
    }
    (0..bootstraps)
        .map(|_| {
            let a = pool[rng.gen_range(0..pool.len())];
            let b = pool[rng.gen_range(0..pool.len())];
            -2.0 * (a - b)
        })
        .collect()
}

/// Upper-tail Monte-Carlo p-value. Ties with `t_obs` do not count.
pub fn monte_carlo_p_value(null: &[f64], t_obs: f64) -> Option<f64> {
    if null.is_empty() {
        return None;
    }
    let exceeding = null.iter().filter(|&&t| t > t_obs).count();
    Some(exceeding as f64 / null.len() as f64)
}

struct PairTask {
    model: String,
    replicate: u32,
    k0: u32,
    k1: u32,
    loglik_k0: f64,
    loglik_k1: f64,
    pool: Vec<f64>,
    stream: u64,
}

/// Log-likelihoods per K for one (model, replicate), in input order.
fn group_by_replicate(runs: &[RunRecord]) -> BTreeMap<GroupKey, BTreeMap<u32, Vec<f64>>> {
    let mut groups: BTreeMap<GroupKey, BTreeMap<u32, Vec<f64>>> = BTreeMap::new();
    for run in runs {
        let values = groups
            .entry(run.group_key())
            .or_default()
            .entry(run.k)
            .or_default();
        if run.log_likelihood.is_finite() {
            values.push(run.log_likelihood);
        }
    }
    groups
}

fn plan_pairs(runs: &[RunRecord], diagnostics: &mut Vec<Diagnostic>) -> Vec<PairTask> {
    let mut tasks = Vec::new();
    for ((model, replicate), by_k) in group_by_replicate(runs) {
        let subject = |k0: u32| format!("{} replicate {} K={}", model, replicate, k0);
        let max_k = by_k.keys().next_back().copied().unwrap_or(0);

        for (&k0, pool) in &by_k {
            // u32::MAX has no successor and is always the terminal K.
            let k1 = match k0.checked_add(1) {
                Some(k1) => k1,
                None => continue,
            };
            let next = match by_k.get(&k1) {
                Some(next) => next,
                None => {
                    if k0 < max_k {
                        record_diagnostic(
                            diagnostics,
                            DiagnosticKind::MissingJoinKey,
                            subject(k0),
                            format!("no run at K={}; pair skipped", k1),
                        );
                    }
                    continue;
                }
            };
            let (loglik_k0, loglik_k1) = match (pool.first(), next.first()) {
                (Some(&a), Some(&b)) => (a, b),
                _ => {
                    record_diagnostic(
                        diagnostics,
                        DiagnosticKind::MissingJoinKey,
                        subject(k0),
                        format!("no log-likelihood values for K={} or K={}; pair skipped", k0, k1),
                    );
                    continue;
                }
            };
            tasks.push(PairTask {
                model: model.clone(),
                replicate,
                k0,
                k1,
                loglik_k0,
                loglik_k1,
                pool: pool.clone(),
                stream: tasks.len() as u64,
            });
        }
    }
    tasks
}

/// Bootstrap likelihood-ratio test for every adjacent (K, K+1) pair.
///
/// `T_obs = -2 * (lnL_K - lnL_K+1)` uses the first value observed at each K.
/// The null distribution resamples both terms from the values observed at K,
/// so a single replicate gives `T_b = 0` for every draw. Each pair draws from
/// its own ChaCha stream keyed by its position in the sorted pair list, which
/// keeps output identical for a fixed seed whatever the thread count.
pub fn bootstrap_lrt(runs: &[RunRecord], config: &LrtConfig) -> Result<StageOutcome<LrtRecord>, KSelectError> {
    config.validate()?;

    let mut diagnostics = Vec::new();
    let tasks = plan_pairs(runs, &mut diagnostics);

    let base_seed = config.seed.unwrap_or_else(|| thread_rng().gen());
    info!(
        "Testing {} K pairs with {} bootstraps each (seed {})",
        tasks.len(),
        config.bootstraps,
        base_seed
    );

    let records: Vec<LrtRecord> = tasks
        .into_par_iter()
        .map(|task| {
            let mut rng = ChaCha8Rng::seed_from_u64(base_seed);
            rng.set_stream(task.stream);

            let t_obs = -2.0 * (task.loglik_k0 - task.loglik_k1);
            let null = bootstrap_null_distribution(&task.pool, config.bootstraps, &mut rng);
            // The pool is never empty here, so the p-value always exists.
            let p_value = monte_carlo_p_value(&null, t_obs).unwrap_or(1.0);
            debug!(
                "{} replicate {} K{} vs K{}: T_obs {:.4}, p {:.4}",
                task.model, task.replicate, task.k0, task.k1, t_obs, p_value
            );

            LrtRecord {
                model: task.model,
                replicate: task.replicate,
                k0: task.k0,
                k1: task.k1,
                loglik_k0: task.loglik_k0,
                loglik_k1: task.loglik_k1,
                t_obs,
                p_value,
            }
        })
        .collect();

    Ok(StageOutcome { records, diagnostics })
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestK {
    pub model: String,
    pub replicate: u32,
    pub best_k_aic: Option<u32>,
    pub best_k_bic: Option<u32>,
    /// Last K reached by accepting K+1 while the pair's p-value stays below alpha.
    pub best_k_lrt: Option<u32>,
}

/// Lowest-scoring K; ties go to the smaller K.
fn argmin_k(scores: impl Iterator<Item = (u32, f64)>) -> Option<u32> {
    let mut best: Option<(u32, f64)> = None;
    for (k, score) in scores {
        match best {
            Some((_, current)) if score >= current => {}
            _ => best = Some((k, score)),
        }
    }
    best.map(|(k, _)| k)
}

/// Walks the test chain from the smallest tested K. The chain stops at the
/// first non-significant pair or at a missing pair.
fn lrt_chain_k(tests: &[&LrtRecord], alpha: f64) -> Option<u32> {
    let first = tests.first()?;
    let mut current = first.k0;
    for test in tests {
        if test.k0 != current {
            break;
        }
        if test.p_value < alpha {
            current = test.k1;
        } else {
            break;
        }
    }
    Some(current)
}

/// Best K per (model, replicate) by AIC, BIC and the bootstrap LRT chain.
pub fn select_best_k(criteria: &[CriterionRecord], lrt: &[LrtRecord], alpha: f64) -> Vec<BestK> {
    let mut by_group: BTreeMap<GroupKey, (Vec<&CriterionRecord>, Vec<&LrtRecord>)> = BTreeMap::new();
    for c in criteria {
        by_group
            .entry((c.model.clone(), c.replicate))
            .or_default()
            .0
            .push(c);
    }
    for t in lrt {
        by_group
            .entry((t.model.clone(), t.replicate))
            .or_default()
            .1
            .push(t);
    }

    by_group
        .into_iter()
        .map(|((model, replicate), (mut scores, mut tests))| {
            scores.sort_by_key(|c| c.k);
            tests.sort_by_key(|t| t.k0);
            BestK {
                model,
                replicate,
                best_k_aic: argmin_k(scores.iter().map(|c| (c.k, c.aic))),
                best_k_bic: argmin_k(scores.iter().filter_map(|c| c.bic.map(|b| (c.k, b)))),
                best_k_lrt: lrt_chain_k(&tests, alpha),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelKSummary {
    pub model: String,
    pub k: u32,
    pub replicates: usize,
    pub mean_log_likelihood: f64,
    pub mean_aic: f64,
    /// Mean over the replicates with a defined BIC.
    pub mean_bic: Option<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Mean lnL, AIC and BIC per (model, K) across replicates.
pub fn summarize_by_model(criteria: &[CriterionRecord]) -> Vec<ModelKSummary> {
    let mut groups: BTreeMap<(String, u32), Vec<&CriterionRecord>> = BTreeMap::new();
    for c in criteria {
        groups.entry((c.model.clone(), c.k)).or_default().push(c);
    }

    groups
        .into_iter()
        .map(|((model, k), rows)| {
            let lnl: Vec<f64> = rows.iter().map(|c| c.log_likelihood).collect();
            let aic: Vec<f64> = rows.iter().map(|c| c.aic).collect();
            let bic: Vec<f64> = rows.iter().filter_map(|c| c.bic).collect();
            ModelKSummary {
                model,
                k,
                replicates: rows.len(),
                mean_log_likelihood: mean(&lnl).unwrap_or(f64::NAN),
                mean_aic: mean(&aic).unwrap_or(f64::NAN),
                mean_bic: mean(&bic),
            }
        })
        .collect()
}
