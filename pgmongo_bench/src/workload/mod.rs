#[cfg(feature = "command_line")]
use arrrg::CommandLine;

pub mod mix;

#[cfg(feature = "command_line")]
use mix::WorkloadOptions;

//////////////////////////////////////////////// get ///////////////////////////////////////////////

/// Parse `workload [--workload-options]` into the options for that workload.
///
/// `mix` runs the weighted mix.  `load` inserts only and may start from an empty backend.
#[cfg(feature = "command_line")]
pub fn from_command_line(usage: &str, args: &[String]) -> WorkloadOptions {
    if args.is_empty() {
        eprintln!("no workload specified on the command line");
        std::process::exit(1);
    }
    let workload = &args[0];
    let args = args[1..].iter().map(String::as_str).collect::<Vec<&str>>();
    let (options, free) = WorkloadOptions::from_arguments_relaxed(usage, &args);
    if !free.is_empty() {
        eprintln!("{workload} workload takes no positional arguments");
        std::process::exit(1);
    }
    match workload.as_str() {
        "mix" => options,
        "load" => options.into_load(),
        _ => {
            eprintln!("unknown workload: {}", workload);
            eprintln!("{}", usage);
            std::process::exit(1);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
