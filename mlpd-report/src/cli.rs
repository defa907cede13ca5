//! Argument parsing for the `mlpd-report` CLI (§6 "CLI surface"). The
//! writer side has no CLI; this is the only argv surface this pack
//! defines. `clap`'s derive API, matching `profilerd-demo`'s `Args`.

use clap::Parser;

/// Offline decoder and report generator for MLPD traces.
#[derive(Parser, Debug)]
#[command(name = "mlpd-report", about = "Decodes an MLPD trace and renders aggregate reports")]
pub struct Args {
    /// Input trace file, or `-` to read from stdin. Gzip-wrapped traces
    /// are detected from their magic bytes and decompressed transparently.
    pub input: Option<String>,

    /// Dumps the raw decoded event list instead of (or alongside) the
    /// aggregate reports.
    #[arg(long)]
    pub traces: bool,

    /// Maximum backtrace frames to print per event.
    #[arg(long, default_value_t = 32)]
    pub maxframes: usize,

    /// Comma-separated subset of report sections to render. Defaults to
    /// all of them: header,jit,gc,sample,alloc,call,metadata,exception,
    /// monitor,thread,heapshot.
    #[arg(long)]
    pub reports: Option<String>,

    /// Sort key for the call-graph report.
    #[arg(long, default_value = "total")]
    pub method_sort: String,

    /// Sort key for the allocation report.
    #[arg(long, default_value = "bytes")]
    pub alloc_sort: String,

    /// Restrict output to events referencing one or more addresses
    /// (object, method, or class pointers), comma-separated hex or
    /// decimal.
    #[arg(long)]
    pub track: Option<String>,

    /// Search the decoded trace: `S:<size>` finds allocations of exactly
    /// that size, `T:<name>` finds methods/classes whose resolved name
    /// contains the substring.
    #[arg(long)]
    pub find: Option<String>,

    /// Restrict output to events from a single thread id.
    #[arg(long)]
    pub thread: Option<u64>,

    /// Restrict output to the time window `FROM-TO`, in seconds relative
    /// to the first event in the trace.
    #[arg(long)]
    pub time: Option<String>,

    /// Write rendered output to a file instead of stdout.
    #[arg(long)]
    pub out: Option<String>,

    /// Emit reports as JSON instead of colored text.
    #[arg(long)]
    pub json: bool,

    /// Verbose logging (info level).
    #[arg(long)]
    pub verbose: bool,

    /// Debug logging (debug level), overrides `--verbose`.
    #[arg(long)]
    pub debug: bool,
}

/// A parsed `--time=FROM-TO` window, in nanoseconds relative to the first
/// event's timestamp.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub from_ns: u64,
    pub to_ns: u64,
}

/// Errors from validating/parsing CLI arguments, distinct from trace
/// decode errors: these map to exit code 1 (argument error) rather than
/// a decode failure, except `MissingInput` which is exit code 2 (§6).
#[derive(Debug)]
pub enum ArgError {
    MissingInput,
    UnknownReport(String),
    BadMethodSort(String),
    BadAllocSort(String),
    BadTrack(String),
    BadFind(String),
    BadTime(String),
}

impl std::fmt::Display for ArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgError::MissingInput => write!(f, "no input file given (use a path or '-' for stdin)"),
            ArgError::UnknownReport(r) => write!(f, "unknown report name '{r}'"),
            ArgError::BadMethodSort(s) => write!(f, "unknown --method-sort '{s}' (expected total, self, or calls)"),
            ArgError::BadAllocSort(s) => write!(f, "unknown --alloc-sort '{s}' (expected bytes or count)"),
            ArgError::BadTrack(s) => write!(f, "bad --track address '{s}'"),
            ArgError::BadFind(s) => write!(f, "bad --find expression '{s}' (expected S:<size> or T:<name>)"),
            ArgError::BadTime(s) => write!(f, "bad --time window '{s}' (expected FROM-TO in seconds)"),
        }
    }
}

impl std::error::Error for ArgError {}

/// What `--find` asks the decoder to locate (§6).
#[derive(Debug, Clone)]
pub enum FindQuery {
    Size(u64),
    Name(String),
}

fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

impl Args {
    pub fn report_kinds(&self) -> Result<Vec<crate::report::ReportKind>, ArgError> {
        match &self.reports {
            None => Ok(crate::report::ReportKind::all().to_vec()),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|name| crate::report::ReportKind::parse(name).ok_or_else(|| ArgError::UnknownReport(name.to_string())))
                .collect(),
        }
    }

    pub fn method_sort(&self) -> Result<crate::model::MethodSort, ArgError> {
        match self.method_sort.as_str() {
            "total" => Ok(crate::model::MethodSort::Total),
            "self" => Ok(crate::model::MethodSort::SelfTime),
            "calls" => Ok(crate::model::MethodSort::Calls),
            other => Err(ArgError::BadMethodSort(other.to_string())),
        }
    }

    pub fn alloc_sort(&self) -> Result<crate::model::AllocSort, ArgError> {
        match self.alloc_sort.as_str() {
            "bytes" => Ok(crate::model::AllocSort::Bytes),
            "count" => Ok(crate::model::AllocSort::Count),
            other => Err(ArgError::BadAllocSort(other.to_string())),
        }
    }

    pub fn track_addrs(&self) -> Result<Vec<u64>, ArgError> {
        match &self.track {
            None => Ok(Vec::new()),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_addr(s).ok_or_else(|| ArgError::BadTrack(s.to_string())))
                .collect(),
        }
    }

    pub fn find_query(&self) -> Result<Option<FindQuery>, ArgError> {
        let Some(raw) = &self.find else { return Ok(None) };
        let (tag, rest) = raw.split_once(':').ok_or_else(|| ArgError::BadFind(raw.clone()))?;
        match tag {
            "S" => rest.parse::<u64>().map(FindQuery::Size).map(Some).map_err(|_| ArgError::BadFind(raw.clone())),
            "T" => Ok(Some(FindQuery::Name(rest.to_string()))),
            _ => Err(ArgError::BadFind(raw.clone())),
        }
    }

    pub fn time_window(&self) -> Result<Option<TimeWindow>, ArgError> {
        let Some(raw) = &self.time else { return Ok(None) };
        let (from, to) = raw.split_once('-').ok_or_else(|| ArgError::BadTime(raw.clone()))?;
        let from: f64 = from.trim().parse().map_err(|_| ArgError::BadTime(raw.clone()))?;
        let to: f64 = to.trim().parse().map_err(|_| ArgError::BadTime(raw.clone()))?;
        if from < 0.0 || to < from {
            return Err(ArgError::BadTime(raw.clone()));
        }
        Ok(Some(TimeWindow {
            from_ns: (from * 1e9) as u64,
            to_ns: (to * 1e9) as u64,
        }))
    }

    pub fn require_input(&self) -> Result<&str, ArgError> {
        self.input.as_deref().ok_or(ArgError::MissingInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["mlpd-report"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn missing_input_is_a_distinct_error() {
        let a = args(&[]);
        assert!(matches!(a.require_input(), Err(ArgError::MissingInput)));
    }

    #[test]
    fn dash_is_accepted_as_stdin_marker() {
        let a = args(&["-"]);
        assert_eq!(a.require_input().unwrap(), "-");
    }

    #[test]
    fn reports_list_parses_known_names_and_rejects_unknown() {
        let a = args(&["trace.mlpd", "--reports=alloc,gc"]);
        let kinds = a.report_kinds().unwrap();
        assert_eq!(kinds.len(), 2);

        let bad = args(&["trace.mlpd", "--reports=alloc,bogus"]);
        assert!(matches!(bad.report_kinds(), Err(ArgError::UnknownReport(_))));
    }

    #[test]
    fn track_accepts_hex_and_decimal_addresses() {
        let a = args(&["trace.mlpd", "--track=0x1000,4096"]);
        assert_eq!(a.track_addrs().unwrap(), vec![0x1000, 4096]);
    }

    #[test]
    fn find_query_distinguishes_size_and_name() {
        let a = args(&["trace.mlpd", "--find=S:64"]);
        assert!(matches!(a.find_query().unwrap(), Some(FindQuery::Size(64))));

        let a = args(&["trace.mlpd", "--find=T:Worker"]);
        assert!(matches!(a.find_query().unwrap(), Some(FindQuery::Name(ref n)) if n == "Worker"));

        let a = args(&["trace.mlpd", "--find=bogus"]);
        assert!(a.find_query().is_err());
    }

    #[test]
    fn time_window_parses_seconds_into_nanoseconds() {
        let a = args(&["trace.mlpd", "--time=1.5-3"]);
        let w = a.time_window().unwrap().unwrap();
        assert_eq!(w.from_ns, 1_500_000_000);
        assert_eq!(w.to_ns, 3_000_000_000);

        let bad = args(&["trace.mlpd", "--time=5-1"]);
        assert!(bad.time_window().is_err());
    }
}
