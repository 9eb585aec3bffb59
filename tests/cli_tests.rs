// tests/cli_tests.rs

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn write_run(root: &Path, model: u32, replicate: u32, k: u32, log_likelihood: f64) {
    let dir = root
        .join(format!("model{}", model))
        .join(format!("replicate{}", replicate));
    fs::create_dir_all(&dir).unwrap();
    let body = format!(
        "Run parameters:\n   6 individuals\n   4 loci\n   {} populations assumed\n\n\
         Estimated Ln Prob of Data   = {:.1}\n\
         Mean value of ln likelihood = {:.1}\n",
        k,
        log_likelihood,
        log_likelihood + 15.0
    );
    fs::write(dir.join(format!("structure_run_K{}_f", k)), body).unwrap();
}

/// Two replicates of one model plus one run that never finished.
fn build_fixture(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let runs = root.join("structure");
    for (k, ll) in [(1, -2400.0), (2, -2210.5), (3, -2190.0), (4, -2188.7)] {
        write_run(&runs, 1, 1, k, ll);
    }
    for (k, ll) in [(1, -2450.0), (2, -2230.0), (3, -2225.5)] {
        write_run(&runs, 1, 2, k, ll);
    }
    let unfinished = runs.join("model1/replicate2/structure_run_K4_f");
    fs::write(unfinished, "Burnin period: 100000\n")?;

    let strdir = root.join("str");
    fs::create_dir_all(&strdir)?;
    let matrix = "\
ind1 0 1 1 0
ind2 1 1 0 0
ind3 0 0 1 1
ind4 1 0 1 0
ind5 0 1 0 1
ind6 1 1 1 0
";
    fs::write(strdir.join("model1_replicate1_cleaned.str"), matrix)?;
    fs::write(strdir.join("model1_replicate2_cleaned.str"), matrix)?;
    Ok(())
}

#[test]
fn test_full_pipeline() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let root = dir.path();
    build_fixture(root)?;

    let logliks = root.join("structure_loglik_summary.csv");
    let criteria = root.join("structure_aic_bic_summary.csv");
    let best_k = root.join("best_k.csv");
    let lrt = root.join("bootstrap_lrt_results.csv");

    Command::cargo_bin("kselect")?
        .arg("parse")
        .arg("--indir")
        .arg(root.join("structure"))
        .arg("--outfile")
        .arg(&logliks)
        .assert()
        .success()
        .stdout(predicate::str::contains("with 7 rows"))
        .stderr(predicate::str::contains("structure_run_K4_f"));

    let table = fs::read_to_string(&logliks)?;
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "model,replicate,K,log_likelihood,file");
    assert_eq!(lines.len(), 8);
    assert!(lines[1].starts_with("model1,1,1,-2400,"));
    assert!(lines[7].starts_with("model1,2,3,-2225.5,"));

    Command::cargo_bin("kselect")?
        .arg("criteria")
        .arg("--input")
        .arg(&logliks)
        .arg("--strdir")
        .arg(root.join("str"))
        .arg("--outfile")
        .arg(&criteria)
        .arg("--best_k_output")
        .arg(&best_k)
        .assert()
        .success()
        .stdout(predicate::str::contains("Output saved"));

    let table = fs::read_to_string(&criteria)?;
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "model,replicate,K,lnL,I,A,p,AIC,BIC");
    assert_eq!(lines.len(), 8);
    // I = 6, A = 4, K = 2 -> p = 6 + 8 = 14, AIC = 4421 + 28
    assert!(lines[2].starts_with("model1,1,2,-2210.5,6,4,14,4449,"));

    let best = fs::read_to_string(&best_k)?;
    assert!(best.starts_with("model,replicate,best_K_AIC,best_K_BIC,best_K_LRT\n"));
    assert_eq!(best.lines().count(), 3);

    for _ in 0..2 {
        Command::cargo_bin("kselect")?
            .arg("lrt")
            .arg("--input")
            .arg(&logliks)
            .arg("--output")
            .arg(&lrt)
            .arg("--bootstraps")
            .arg("50")
            .arg("--seed")
            .arg("7")
            .assert()
            .success();
    }
    let first = fs::read(&lrt)?;
    Command::cargo_bin("kselect")?
        .args(["--threads", "1", "lrt", "--bootstraps", "50", "--seed", "7", "--input"])
        .arg(&logliks)
        .arg("--output")
        .arg(&lrt)
        .assert()
        .success();
    assert_eq!(first, fs::read(&lrt)?);

    let table = String::from_utf8(first)?;
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "model,replicate,K0,K1,loglik_K0,loglik_K1,T_obs,p_value");
    // Three pairs for replicate 1, two for replicate 2
    assert_eq!(lines.len(), 6);
    // Single run per K: T_b is always 0 and T_obs > 0
    assert_eq!(lines[1], "model1,1,1,2,-2400,-2210.5,379,0");

    Command::cargo_bin("kselect")?
        .arg("summary")
        .arg("--criteria")
        .arg(&criteria)
        .arg("--lrt")
        .arg(&lrt)
        .assert()
        .success()
        .stdout(predicate::str::contains("Best K per replicate"))
        .stdout(predicate::str::contains("Mean scores per model and K"));

    Ok(())
}

#[test]
fn test_lrt_rejects_zero_bootstraps() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("logliks.csv");
    fs::write(&input, "model,replicate,K,log_likelihood\nmodel1,1,1,-10.0\nmodel1,1,2,-9.0\n")?;
    let output = dir.path().join("lrt.csv");

    for bootstraps in ["0", "-5"] {
        Command::cargo_bin("kselect")?
            .arg("lrt")
            .arg("--input")
            .arg(&input)
            .arg("--output")
            .arg(&output)
            .arg("--bootstraps")
            .arg(bootstraps)
            .assert()
            .failure()
            .stderr(predicate::str::contains("bootstraps must be at least 1"));
    }
    assert!(!output.exists());
    Ok(())
}

#[test]
fn test_parse_empty_directory_warns() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let outfile = dir.path().join("out.csv");

    Command::cargo_bin("kselect")?
        .arg("parse")
        .arg("--indir")
        .arg(dir.path())
        .arg("--outfile")
        .arg(&outfile)
        .assert()
        .success()
        .stdout(predicate::str::contains("No valid STRUCTURE output files parsed."));

    assert!(!outfile.exists());
    Ok(())
}

#[test]
fn test_criteria_reports_missing_genotypes() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let root = dir.path();
    build_fixture(root)?;
    fs::remove_file(root.join("str/model1_replicate2_cleaned.str"))?;
    let outfile = root.join("criteria.csv");

    Command::cargo_bin("kselect")?
        .arg("criteria")
        .arg("--indir")
        .arg(root.join("structure"))
        .arg("--strdir")
        .arg(root.join("str"))
        .arg("--outfile")
        .arg(&outfile)
        .assert()
        .success()
        .stderr(predicate::str::contains("model1 replicate 2"));

    // Only replicate 1 is scored
    let table = fs::read_to_string(&outfile)?;
    assert_eq!(table.lines().count(), 5);
    assert!(table.lines().skip(1).all(|l| l.starts_with("model1,1,")));
    Ok(())
}
