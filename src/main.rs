use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use itertools::Itertools;
use tracecount::{
    analyzer::{
        batch::{self, AnalysisConfig},
        Attribution, Termination,
    },
    arch::Arch,
    binary::Binary,
    host::native::Native,
    report::{self, Report},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(argh::FromArgs)]
/// Counts executed instructions of one function per source line
struct Arguments {
    #[argh(switch, short = 'v')]
    /// log call/return bookkeeping
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Batch(BatchArgs),
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "analyze")]
/// attribute a single trace
struct AnalyzeArgs {
    #[argh(positional)]
    /// the traced binary, with debug info
    binary: PathBuf,

    #[argh(positional)]
    /// function to attribute
    function: String,

    #[argh(positional)]
    /// trace file written by the gdb tracer
    trace: PathBuf,

    #[argh(option, short = 'o')]
    /// where to write the json report
    output: Option<PathBuf>,

    #[argh(option, short = 'a')]
    /// architecture: x86_64, arm, aarch64, riscv (default: from the binary)
    arch: Option<Arch>,

    #[argh(option)]
    /// addr2line to use (default: depends on arch)
    addr2line: Option<String>,

    #[argh(option)]
    /// source file to name in the report
    source_file: Option<String>,
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "batch")]
/// attribute every trace_<function>_<params>.log in a folder
struct BatchArgs {
    #[argh(positional)]
    /// the traced binary, with debug info
    binary: PathBuf,

    #[argh(positional)]
    /// function to attribute
    function: String,

    #[argh(positional)]
    /// folder with the traces
    traces: PathBuf,

    #[argh(positional)]
    /// folder for the json reports
    output: PathBuf,

    #[argh(option, short = 'a')]
    /// architecture: x86_64, arm, aarch64, riscv (default: from the binary)
    arch: Option<Arch>,

    #[argh(option)]
    /// addr2line to use (default: depends on arch)
    addr2line: Option<String>,

    #[argh(option)]
    /// source file to name in the reports
    source_file: Option<String>,

    #[argh(option, short = 'j')]
    /// parallel analyses (default: available cores)
    jobs: Option<usize>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the binary and fills in what wasn't given on the command line
fn configure(
    host: &Native,
    binary_path: &Path,
    function: String,
    arch: Option<Arch>,
    addr2line: Option<String>,
    source_file: Option<String>,
) -> anyhow::Result<(AnalysisConfig, Binary)> {
    let binary = Binary::from_path(host, binary_path)
        .map_err(|e| anyhow!("{:?}", e))
        .with_context(|| format!("loading {}", binary_path.display()))?;

    let arch = arch
        .or(binary.arch)
        .ok_or_else(|| anyhow!("unknown architecture, pass it with -a"))?;

    let addr2line = addr2line.unwrap_or_else(|| arch.addr2line_tool().to_string());

    info!("{} is {}, lines from {}", binary_path.display(), arch, addr2line);

    let config = AnalysisConfig {
        binary: binary_path.to_path_buf(),
        function,
        arch,
        addr2line,
        source_file,
    };

    Ok((config, binary))
}

fn print_summary(function: &str, attribution: &Attribution) {
    println!(
        "{}: {} instructions",
        function,
        attribution.total_instructions()
    );

    for (line, count) in attribution
        .line_counts
        .iter()
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
    {
        println!("{:>10}  {}", count, line);
    }

    if attribution.unattributed > 0 {
        println!("{:>10}  (no line)", attribution.unattributed);
    }

    match &attribution.termination {
        Termination::Completed => {}
        Termination::AbnormalTermination { last_line } => match last_line {
            Some(line) => println!("crashed, last executed line {}", line),
            None => println!("crashed"),
        },
        Termination::NotEntered => println!("{} was never called", function),
    }
}

fn analyze(host: &Native, args: AnalyzeArgs) -> anyhow::Result<()> {
    let (config, binary) = configure(
        host,
        &args.binary,
        args.function,
        args.arch,
        args.addr2line,
        args.source_file,
    )?;

    let file_name = args
        .trace
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let params = report::params_from_trace_name(&config.function, file_name)
        .map(report::params_slug)
        .unwrap_or_else(|| String::from("unknown"));

    let attribution = batch::analyze_trace(host, &config, &binary, &args.trace)?;
    print_summary(&config.function, &attribution);

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(report::report_name(&config.function, &params)));

    Report::new(
        &config.function,
        &params,
        config.source_file.as_deref(),
        &attribution,
    )
    .write(&output)
    .with_context(|| format!("writing {}", output.display()))?;

    info!("results saved to {}", output.display());

    Ok(())
}

fn batch(host: &Native, args: BatchArgs) -> anyhow::Result<()> {
    let (config, binary) = configure(
        host,
        &args.binary,
        args.function,
        args.arch,
        args.addr2line,
        args.source_file,
    )?;

    let jobs = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
    });

    let reports =
        batch::analyze_folder(host, &config, &binary, &args.traces, &args.output, jobs)?;

    for (path, report) in &reports {
        let crashed = if report.crash_detected { ", crashed" } else { "" };
        println!(
            "{}: {} instructions{}",
            path.display(),
            report.total_instructions,
            crashed
        );
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let Arguments { verbose, command } = argh::from_env();

    init_tracing(verbose);

    let host = Native {};

    match command {
        Command::Analyze(args) => analyze(&host, args),
        Command::Batch(args) => batch(&host, args),
    }
}
