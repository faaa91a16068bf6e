use std::path::Path;

use ptq_client::Engine;
use ptq_common::EngineConfig;
use ptq_planner::{explain_advice, Tracepoint};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match args.first().map(|a| a.as_str()) {
        None | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("compile") => run_compile(parse_compile_opts(&args)?),
        Some(other) => Err(format!("unknown command: {other}").into()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Clone, Default)]
struct CompileOpts {
    tracepoints: Vec<String>,
    queries: Vec<String>,
    name: Option<String>,
    no_optimize: bool,
    json: bool,
    config: Option<String>,
}

fn parse_compile_opts(args: &[String]) -> Result<CompileOpts, Box<dyn std::error::Error>> {
    let mut opts = CompileOpts::default();
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--tracepoints" => {
                i += 1;
                opts.tracepoints.push(
                    args.get(i)
                        .cloned()
                        .ok_or("missing value for --tracepoints")?,
                );
            }
            "--query" => {
                i += 1;
                opts.queries
                    .push(args.get(i).cloned().ok_or("missing value for --query")?);
            }
            "--name" => {
                i += 1;
                opts.name = Some(args.get(i).cloned().ok_or("missing value for --name")?);
            }
            "--config" => {
                i += 1;
                opts.config = Some(args.get(i).cloned().ok_or("missing value for --config")?);
            }
            "--no-optimize" => opts.no_optimize = true,
            "--json" => opts.json = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument for compile: {other}").into()),
        }
        i += 1;
    }
    if opts.queries.is_empty() {
        return Err("compile needs at least one --query".into());
    }
    Ok(opts)
}

fn run_compile(opts: CompileOpts) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &opts.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if opts.no_optimize {
        config.optimize_queries = false;
    }
    let engine = Engine::new(config);

    for path in &opts.tracepoints {
        let tracepoints: Vec<Tracepoint> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for tp in tracepoints {
            engine.register_tracepoint(tp);
        }
    }

    // Every query file is registered under its stem so later files can join it;
    // the last one is compiled.
    let mut last = None;
    for (i, path) in opts.queries.iter().enumerate() {
        let name = match &opts.name {
            Some(name) if i + 1 == opts.queries.len() => name.clone(),
            _ => file_stem(path)?,
        };
        let text = std::fs::read_to_string(path)?;
        last = Some(engine.parse_query(&name, &text)?);
    }
    let query = last.ok_or("no query to compile")?;

    let compiled = engine.compile(&query)?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&compiled.weaves)?);
        return Ok(());
    }
    println!("Query:\n{}", engine.explain(&query));
    if engine.config().optimize_queries {
        println!("Optimized:\n{}", engine.explain(&engine.optimize(&query)));
    }
    print!("{}", explain_advice(&compiled));
    Ok(())
}

fn file_stem(path: &str) -> Result<String, Box<dyn std::error::Error>> {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| format!("cannot name query from path {path}").into())
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  ptq compile --tracepoints FILE.json --query FILE [--query FILE ...]");
    eprintln!("              [--name NAME] [--no-optimize] [--json] [--config FILE.json]");
    eprintln!();
    eprintln!("Each query file is registered under its file stem (or --name for the last");
    eprintln!("one) and may join queries from earlier files. The last query is compiled.");
}
