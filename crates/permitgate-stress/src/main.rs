//! permitgate-stress: drive a permit manager with concurrent readers, writers
//! and activation cycles, then print a JSON report.

mod workload;

use std::process;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use workload::Options;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: permitgate-stress [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --readers <n>       Tasks taking shared permits [default: 8]");
            eprintln!("  --writers <n>       Tasks taking exclusive permits [default: 2]");
            eprintln!("  --cycles <n>        Deactivate/activate cycles [default: 50]");
            eprintln!("  --max-permits <n>   Shared permit limit, 0 = unbounded [default: 4]");
            eprintln!("  --timeout-ms <ms>   Bound on every wait [default: 250]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(workload::run(options)) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: failed to serialize report: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// Initialize tracing on stderr with PERMITGATE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PERMITGATE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!(
            "permitgate={level},permitgate_stress={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => return Err(String::new()),
            "--readers" | "--writers" | "--cycles" | "--max-permits" | "--timeout-ms" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                let value: u64 = raw
                    .parse()
                    .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))?;
                match flag {
                    "--readers" => options.readers = value as usize,
                    "--writers" => options.writers = value as usize,
                    "--cycles" => options.cycles = value as usize,
                    "--max-permits" => options.max_permits = value as usize,
                    _ => options.timeout = Duration::from_millis(value),
                }
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if options.readers == 0 && options.writers == 0 {
        return Err("at least one reader or writer is required".to_string());
    }
    if options.timeout.is_zero() {
        return Err("--timeout-ms must be positive".to_string());
    }
    Ok(options)
}
