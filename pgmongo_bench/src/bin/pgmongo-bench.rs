//! Run a workload against PostgreSQL, MongoDB, or the in-memory provider.

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use biometrics::Collector;
use indicio::stdio::StdioEmitter;
use indicio::{clue, ALWAYS, ERROR, INFO};

use pgmongo_bench::metrics::PlainTextEmitter;
use pgmongo_bench::{connect, workload, ConnectOptions, Driver, COLLECTOR};

const USAGE: &str = concat!(
    "USAGE: pgmongo-bench --endpoint URL [--metrics PATH] [--provider-options] ",
    "<mix|load> [--workload-options]"
);

////////////////////////////////////////// ProviderOptions /////////////////////////////////////////

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct ProviderOptions {
    #[arrrg(
        required,
        "Endpoint: postgres://..., mongodb://..., or memory://.",
        "URL"
    )]
    endpoint: String,
    #[arrrg(optional, "Table or collection to run against.", "NAME")]
    table: String,
    #[arrrg(optional, "Per-operation timeout in seconds.")]
    timeout_secs: u64,
    #[arrrg(optional, "Connections to open (default: one per worker).")]
    pool_size: u32,
    #[arrrg(flag, "Create the table or collection if it is missing.")]
    create_table: bool,
    #[arrrg(flag, "Log only errors.")]
    quiet: bool,
    #[arrrg(
        optional,
        "Write biometrics in plain text to this path every second.",
        "PATH"
    )]
    metrics: String,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            table: "people".to_string(),
            timeout_secs: 10,
            pool_size: 0,
            create_table: false,
            quiet: false,
            metrics: String::new(),
        }
    }
}

/////////////////////////////////////////////// main ///////////////////////////////////////////////

fn main() {
    let (options, free) = ProviderOptions::from_command_line_relaxed(USAGE);
    if free.is_empty() {
        eprintln!("missing workload");
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }
    let workload = workload::from_command_line(USAGE, &free);

    COLLECTOR.register(Arc::new(StdioEmitter));
    COLLECTOR.set_verbosity(if options.quiet { ERROR } else { INFO });
    clue!(COLLECTOR, ALWAYS, {
        args: std::env::args().map(String::from).collect::<Vec<_>>(),
    });

    let pool_size = if options.pool_size > 0 {
        options.pool_size
    } else {
        u32::try_from(workload.workers).unwrap_or(u32::MAX)
    };
    let connect_options = ConnectOptions {
        timeout: Duration::from_secs(options.timeout_secs),
        pool_size,
        create_table: options.create_table,
    };
    let provider = match connect(&options.endpoint, &options.table, &connect_options) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("setup failed: {err}");
            std::process::exit(1);
        }
    };

    let collector = Collector::new();
    pgmongo_bench::register_biometrics(&collector);
    provider.register_biometrics(&collector);

    let driver = match Driver::new(workload, provider) {
        Ok(driver) => driver,
        Err(err) => {
            eprintln!("invalid workload: {err}");
            std::process::exit(1);
        }
    };
    let result = if options.metrics.is_empty() {
        driver.run()
    } else {
        let output = match File::create(&options.metrics) {
            Ok(output) => output,
            Err(err) => {
                eprintln!("could not open {}: {err}", options.metrics);
                std::process::exit(1);
            }
        };
        let mut emitter = PlainTextEmitter::new(output);
        driver.run_with_metrics(&collector, &mut emitter)
    };
    match result {
        Ok(summary) => println!("{summary}"),
        Err(err) => {
            eprintln!("run failed: {err}");
            std::process::exit(1);
        }
    }
}
