//! From files on disk to reports: finding both entry addresses, running the
//! engine, and doing it for a whole folder of traces.

use super::{Attribution, AttributionError, Engine, EntryKind};
use crate::{
    arch::Arch,
    binary::Binary,
    host::Host,
    report::{self, Report},
    resolve::{Addr2Line, AddressResolver},
    tracer::{self, TraceCursor},
};
use anyhow::Context;
use std::{
    fmt::Debug,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    thread,
};
use tracing::{debug, info, warn};

/// Everything a run needs besides the trace itself
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub binary: PathBuf,
    pub function: String,
    pub arch: Arch,
    /// the addr2line binary, cross toolchains name it differently
    pub addr2line: String,
    /// written into reports instead of the guessed one
    pub source_file: Option<String>,
}

fn open(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Attributes the target's instructions in one trace file.
pub fn analyze_trace<H>(
    host: &H,
    config: &AnalysisConfig,
    binary: &Binary,
    trace: &Path,
) -> anyhow::Result<Attribution>
where
    H: Host,
    H::Error: Debug,
{
    let function = config.function.as_str();

    let static_entry =
        binary
            .entry(function, config.arch)
            .ok_or(AttributionError::MissingTargetAddress {
                function: function.to_string(),
                kind: EntryKind::Static,
            })?;

    let runtime_entry = tracer::find_runtime_entry(open(trace)?, function, &config.arch).ok_or(
        AttributionError::MissingTargetAddress {
            function: function.to_string(),
            kind: EntryKind::Runtime,
        },
    )?;

    if let Some(base) = tracer::find_text_base(open(trace)?) {
        debug!("{}: text mapped at {:#x}", trace.display(), base);
    }

    info!(
        "`{}`: static {:#x}, runtime {:#x}",
        function, static_entry, runtime_entry
    );

    let oracle = Addr2Line::new(host, config.addr2line.clone(), config.binary.clone());
    let mut resolver = AddressResolver::new(oracle, runtime_entry, static_entry);
    let mut cursor = TraceCursor::new(open(trace)?);

    let attribution = Engine::new(function, &mut resolver, &config.arch).run(&mut cursor);

    if attribution.crash_detected() {
        let location = attribution
            .last_address
            .map(|address| resolver.rebase(address))
            .and_then(|address| binary.table.lookup(address));
        if let Some(location) = location {
            warn!("{}: crashed in {}", trace.display(), location);
        }
    }

    Ok(attribution)
}

/// Analyzes one trace and writes its report to `output`.
pub fn analyze_to_file<H>(
    host: &H,
    config: &AnalysisConfig,
    binary: &Binary,
    trace: &Path,
    params: &str,
    output: &Path,
) -> anyhow::Result<Report>
where
    H: Host,
    H::Error: Debug,
{
    let attribution = analyze_trace(host, config, binary, trace)?;
    let report = Report::new(
        &config.function,
        params,
        config.source_file.as_deref(),
        &attribution,
    );

    report
        .write(output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!("results saved to {}", output.display());

    Ok(report)
}

/// The `trace_<function>_<params>.log` files in `dir` along with their
/// `<params>`, sorted by name.
pub fn collect_traces(dir: &Path, function: &str) -> anyhow::Result<Vec<(PathBuf, String)>> {
    let mut traces = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".log") {
            continue;
        }

        match report::params_from_trace_name(function, name) {
            Some(params) => {
                let params = params.to_string();
                traces.push((path, params));
            }
            None => warn!(
                "skipping {}, not named trace_{}_<params>.log",
                name, function
            ),
        }
    }

    traces.sort();
    Ok(traces)
}

/// Analyzes every trace of `config.function` in `trace_dir` on up to `jobs`
/// threads. Traces that fail are logged and left out.
pub fn analyze_folder<H>(
    host: &H,
    config: &AnalysisConfig,
    binary: &Binary,
    trace_dir: &Path,
    output_dir: &Path,
    jobs: usize,
) -> anyhow::Result<Vec<(PathBuf, Report)>>
where
    H: Host + Sync,
    H::Error: Debug,
{
    let traces = collect_traces(trace_dir, &config.function)?;
    if traces.is_empty() {
        warn!("no traces found in {}", trace_dir.display());
        return Ok(Vec::new());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    info!("{} traces to analyze in {}", traces.len(), trace_dir.display());

    let per_thread = traces.len().div_ceil(jobs.max(1));

    let mut reports: Vec<(PathBuf, Report)> = thread::scope(|s| {
        let workers: Vec<_> = traces
            .chunks(per_thread)
            .map(|chunk| {
                s.spawn(move || {
                    let mut done = Vec::new();

                    for (trace, params) in chunk {
                        let output =
                            output_dir.join(report::report_name(&config.function, params));

                        match analyze_to_file(host, config, binary, trace, params, &output) {
                            Ok(report) => done.push((output, report)),
                            Err(e) => warn!("{}: {:#}", trace.display(), e),
                        }
                    }

                    done
                })
            })
            .collect();

        workers
            .into_iter()
            .flat_map(|worker| match worker.join() {
                Ok(done) => done,
                Err(_) => {
                    warn!("analysis thread panicked");
                    Vec::new()
                }
            })
            .collect()
    });

    reports.sort_by(|a, b| a.0.cmp(&b.0));
    info!("analyzed {} of {} traces", reports.len(), traces.len());

    Ok(reports)
}
