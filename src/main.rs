mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Command, RuleArgs, ScanArgs};
use colored::Colorize;
use dredge::modules::{builtin_registry, ScanYara};
use dredge::{
    DispatchTable, Dispositioner, ExternalVars, HashMethod, QueueOrder, RuleSet, ScanConfig,
    ScanEngine, Verbosity,
};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Scan(scan_args) => run_scan(scan_args),
        Command::Check(rule_args) => run_check(rule_args),
    }
}

/// Assemble an engine from the rule files on the command line. Absent files
/// fall back to the built-in defaults (no dispatch rules, accept-all
/// disposition).
fn build_engine(rules: &RuleArgs, config: ScanConfig) -> Result<ScanEngine> {
    let mut registry = builtin_registry();
    if let Some(path) = &rules.signatures {
        let scan_yara = ScanYara::from_file(path)
            .with_context(|| format!("loading signatures from {}", path.display()))?;
        registry.register(scan_yara);
    }

    let dispatch_rules = match &rules.dispatch_rules {
        Some(path) => RuleSet::compile_file(path)?,
        None => RuleSet::empty(),
    };
    let dispatch_table = match &rules.dispatch_actions {
        Some(path) => DispatchTable::from_file(path)?,
        None => DispatchTable::builtin_default(),
    };

    let dispositioner = match (&rules.disposition_rules, &rules.disposition_actions) {
        (Some(rules_path), Some(actions_path)) => {
            Dispositioner::from_files(rules_path, actions_path)?
        }
        (None, None) => Dispositioner::accept_all(),
        _ => anyhow::bail!(
            "disposition rules and disposition actions must be provided together"
        ),
    };

    Ok(ScanEngine::new(
        config,
        registry,
        dispatch_rules,
        dispatch_table,
        dispositioner,
    )?)
}

fn run_check(rules: RuleArgs) -> Result<()> {
    build_engine(&rules, ScanConfig::default())?;
    println!("configuration ok");
    Ok(())
}

fn run_scan(args: ScanArgs) -> Result<()> {
    let verbosity = Verbosity::parse(&args.verbosity)
        .with_context(|| format!("unknown verbosity '{}'", args.verbosity))?;

    let mut config = ScanConfig::default();
    config.queue_order = QueueOrder::parse(&args.queue_order)
        .with_context(|| format!("unknown queue order '{}'", args.queue_order))?;
    config.object_hash_method = HashMethod::parse(&args.hash)
        .with_context(|| format!("unknown hash algorithm '{}'", args.hash))?;

    let engine = build_engine(&args.rules, config)?;

    for path in &args.paths {
        if !path.exists() {
            anyhow::bail!("Path does not exist: {}", path.display());
        }
    }

    // One scan per file; parallelism across scans is ours, not the engine's.
    let error_hit = Mutex::new(false);
    let outputs: Vec<Result<String>> = args
        .paths
        .par_iter()
        .map(|path| {
            let output = scan_one(&engine, path, &args, verbosity)?;
            if let (Some(bad), Some(disposition)) = (&args.error_on, output.1.as_deref()) {
                if bad.as_str() == disposition {
                    *error_hit.lock().unwrap() = true;
                }
            }
            Ok(output.0)
        })
        .collect();

    for output in outputs {
        println!("{}", output?);
    }

    if *error_hit.lock().unwrap() {
        std::process::exit(2);
    }
    Ok(())
}

/// Scan a single file; returns the rendered output line plus the verdict.
fn scan_one(
    engine: &ScanEngine,
    path: &Path,
    args: &ScanArgs,
    verbosity: Verbosity,
) -> Result<(String, Option<String>)> {
    let buffer =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let external = ExternalVars::new(args.source.clone()).with_filename(filename.clone());
    let mut result = engine.scan(buffer, &external, verbosity)?;
    let disposition = result.disposition.clone();

    let rendered = if args.json {
        result.to_json(args.pretty)?
    } else {
        let verdict = match disposition.as_str() {
            "Accept" => disposition.green(),
            "Reject" => disposition.red(),
            _ => disposition.yellow(),
        };
        format!(
            "{}: {} ({} objects, {} flags)",
            filename,
            verdict,
            result.len(),
            result.all_flags().len()
        )
    };
    Ok((rendered, Some(disposition)))
}
