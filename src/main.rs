//! matscreen CLI - Run an exploration from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use matscreen::{
    compute::{
        StructureSimulator,
        exploration::{CheckpointSource, ExplorationEngine, RunStart},
    },
    schema::RunConfig,
    store::MemoryStore,
};

struct Args {
    config_path: PathBuf,
    start: RunStart,
    override_restart_errors: bool,
    store_path: Option<PathBuf>,
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {program} <config.json> [--restart-generation N | --restart-file PATH|auto] \
         [--override-restart-errors] [--store PATH]"
    );
    eprintln!();
    eprintln!("Explore structure-property space from a JSON run configuration.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --restart-generation N     Resume from stored candidates up to generation N");
    eprintln!("  --restart-file PATH|auto   Resume from a checkpoint (auto: newest in output dir)");
    eprintln!("  --override-restart-errors  Delete candidates stored past the restart point");
    eprintln!("  --store PATH               Store file (default: <output_dir>/store.json)");
    eprintln!();
    eprintln!("Example configuration is generated with --example flag.");
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let config_path = PathBuf::from(&args[1]);
    let mut start = RunStart::Fresh;
    let mut override_restart_errors = false;
    let mut store_path = None;

    let mut rest = args[2..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--restart-generation" => {
                let value = rest.next().ok_or("--restart-generation needs a value")?;
                let generation = value
                    .parse()
                    .map_err(|e| format!("Invalid generation '{value}': {e}"))?;
                start = RunStart::FromStore { generation };
            }
            "--restart-file" => {
                let value = rest.next().ok_or("--restart-file needs a value")?;
                let source = if value == "auto" {
                    CheckpointSource::Latest
                } else {
                    CheckpointSource::Path(PathBuf::from(value))
                };
                start = RunStart::FromCheckpoint(source);
            }
            "--override-restart-errors" => override_restart_errors = true,
            "--store" => {
                let value = rest.next().ok_or("--store needs a value")?;
                store_path = Some(PathBuf::from(value));
            }
            other => return Err(format!("Unknown argument '{other}'")),
        }
    }

    Ok(Args {
        config_path,
        start,
        override_restart_errors,
        store_path,
    })
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        usage(&args[0]);
        process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let args = parse_args(&args).unwrap_or_else(|e| {
        usage("matscreen");
        fail(e)
    });

    // Load configuration
    let config_str = fs::read_to_string(&args.config_path)
        .unwrap_or_else(|e| fail(format!("reading config file: {e}")));
    let config: RunConfig = serde_json::from_str(&config_str)
        .unwrap_or_else(|e| fail(format!("parsing config: {e}")));

    let store_path = args
        .store_path
        .unwrap_or_else(|| config.output_dir.join("store.json"));
    let store = MemoryStore::open(&store_path).unwrap_or_else(|e| fail(e));
    let simulator = StructureSimulator::from_config(&config).unwrap_or_else(|e| fail(e));

    println!("matscreen exploration");
    println!("=====================");
    println!("Run: {}", config.run_id);
    println!(
        "Properties: {} x {} bins",
        config.properties.len(),
        config.bins_per_dimension
    );
    println!("Children per generation: {}", config.children_per_generation);
    println!("Store: {}", store_path.display());
    println!();

    let mut engine = ExplorationEngine::new(config, store, Arc::new(simulator))
        .unwrap_or_else(|e| fail(e))
        .with_override_restart_errors(args.override_restart_errors);

    let result = engine
        .run_with_callback(args.start, |progress| {
            println!(
                "  Generation {}: {} candidates, {}/{} bins ({:.2}%), {} new",
                progress.generation,
                progress.candidates,
                progress.bins_explored,
                progress.total_bins,
                progress.coverage * 100.0,
                progress.new_bins
            );
            for benchmark in &progress.benchmarks_reached {
                println!("    Benchmark {:.1}% reached", benchmark * 100.0);
            }
        })
        .unwrap_or_else(|e| fail(e));

    println!();
    println!("Stopped: {:?}", result.stop_reason);
    println!("Last generation: {}", result.last_generation);
    println!("Candidates: {}", result.total_candidates);
    println!(
        "Coverage: {} bins ({:.2}%)",
        result.bins_explored,
        result.coverage * 100.0
    );
    for milestone in &result.milestones {
        println!(
            "  Benchmark {:.1}% at generation {}",
            milestone.benchmark * 100.0,
            milestone.generation
        );
    }
    println!("Time: {:.2}s", result.elapsed_seconds);
}

fn print_example_config() {
    let config = RunConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("Example configuration (config.json):");
            println!("{json}");
        }
        Err(e) => fail(e),
    }
}
