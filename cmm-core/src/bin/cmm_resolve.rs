//! CMM Resolve CLI - rank providers for a capability request
//!
//! Loads a provider manifest and prints every provider matching a pattern,
//! best first, with the contributions of its rank table.
//!
//! Usage:
//!     cmm-resolve "//openicc/icc"
//!     cmm-resolve --manifest modules.json --kind context_builder "//openicc/icc._lcm2"
//!     cmm-resolve --property manufacturer=EPSON --json "//config/device"

use std::path::PathBuf;

use clap::Parser;
use cmm_core::rank::RankContribution;
use cmm_core::{
    CapabilityKind, EngineConfig, ModuleRegistry, PropertySnapshot, ProviderManifest, RankedCandidate,
    ResolveRequest,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cmm-resolve")]
#[command(about = "Rank CMM providers for a registration pattern")]
#[command(version)]
struct Args {
    /// Registration pattern, e.g. "//openicc/icc._lcm2"
    pattern: String,

    /// Path to a provider manifest (default: manifests/providers.json)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Engine configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider stage: loader, context_builder, context_converter, processor
    #[arg(short, long, default_value = "processor", value_parser = parse_kind)]
    kind: CapabilityKind,

    /// Only consider this provider id or implementation attribute
    #[arg(short, long)]
    provider: Option<String>,

    /// Property to rank against, as key=value (repeatable)
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output (debug logging)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct CandidateOutput {
    id: String,
    registration: String,
    rank: i64,
    match_score: u32,
    contributions: Vec<RankContribution>,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "cmm_core=debug" } else { "cmm_core=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => match EngineConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    let manifest_path = args
        .manifest
        .clone()
        .unwrap_or_else(|| PathBuf::from("manifests/providers.json"));
    let manifest = match ProviderManifest::from_file(&manifest_path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error loading manifest: {}", e);
            std::process::exit(1);
        }
    };

    let registry = ModuleRegistry::with_config(&config);
    let report = registry.load(&manifest);
    if args.verbose {
        eprintln!("Manifest: {}", manifest.name);
        eprintln!("Loaded {} provider(s), skipped {}", report.loaded.len(), report.skipped.len());
        for reason in &report.skipped {
            eprintln!("  skipped: {}", reason);
        }
        eprintln!();
    }

    let mut request = match ResolveRequest::new(args.kind, &args.pattern) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error parsing pattern: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(provider) = &args.provider {
        request = request.with_required_provider(provider.clone());
    }
    request = request.with_properties(
        args.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<PropertySnapshot>(),
    );

    let candidates = match registry.resolve_all(&request) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error resolving request: {}", e);
            std::process::exit(1);
        }
    };
    if candidates.is_empty() {
        eprintln!("No {} provider matches '{}'", args.kind, args.pattern);
        std::process::exit(1);
    }

    let outputs: Vec<CandidateOutput> = candidates
        .iter()
        .map(|c| describe(c, &config, &request))
        .collect();

    if args.json {
        match serde_json::to_string_pretty(&outputs) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        output_rendered(&outputs);
    }
}

fn describe(candidate: &RankedCandidate, config: &EngineConfig, request: &ResolveRequest) -> CandidateOutput {
    let descriptor = &candidate.provider.descriptor;
    CandidateOutput {
        id: descriptor.id.clone(),
        registration: descriptor.registration.to_string(),
        rank: candidate.rank,
        match_score: candidate.match_score,
        contributions: config.rank_evaluator().score_breakdown(
            &descriptor.rank_table,
            Some(&descriptor.properties),
            &request.properties,
        ),
    }
}

fn output_rendered(outputs: &[CandidateOutput]) {
    for (position, output) in outputs.iter().enumerate() {
        let marker = if position == 0 { "*" } else { " " };
        println!(
            "{} {:>4}  {}  ({}, match {})",
            marker, output.rank, output.id, output.registration, output.match_score
        );
        for contribution in &output.contributions {
            println!(
                "         {:<20} {:?} {:+}",
                contribution.key, contribution.outcome, contribution.value
            );
        }
    }
}

fn parse_kind(text: &str) -> Result<CapabilityKind, String> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|_| format!("unknown kind '{}'", text))
}

fn parse_property(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", text))
}
