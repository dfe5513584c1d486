//! JSON records of finished attributions, one file per trace.

use crate::analyzer::Attribution;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::BTreeMap, fs, io, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("json")]
    Json(#[from] serde_json::Error),
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Keeps an explicit `null` apart from a missing key
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<String>>, D::Error> {
    Option::deserialize(d).map(Some)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub source_file: String,
    pub function: String,
    pub params: String,
    pub total_instructions: u64,
    pub instructions: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unattributed_instructions: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub crash_detected: bool,
    /// Only there after a crash, `null` if no line was known by then
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub crash_last_executed_line: Option<Option<String>>,
}

impl Report {
    /// `source_file` defaults to the file of the first line counted.
    pub fn new(
        function: &str,
        params: &str,
        source_file: Option<&str>,
        attribution: &Attribution,
    ) -> Self {
        let instructions: BTreeMap<String, u64> = attribution
            .line_counts
            .iter()
            .map(|(line, count)| (line.as_str().to_string(), *count))
            .collect();

        let source_file = match source_file {
            Some(file) => file.to_string(),
            None => attribution
                .line_counts
                .keys()
                .min()
                .map_or_else(|| String::from("unknown"), |line| line.file().to_string()),
        };

        Self {
            source_file,
            function: function.to_string(),
            params: params.replace('_', " "),
            total_instructions: attribution.total_instructions(),
            instructions,
            unattributed_instructions: attribution.unattributed,
            crash_detected: attribution.crash_detected(),
            crash_last_executed_line: attribution
                .crash_detected()
                .then(|| attribution.crash_line().map(|l| l.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// `<params>` of a `trace_<function>_<params>.log` file name
pub fn params_from_trace_name<'n>(function: &str, file_name: &'n str) -> Option<&'n str> {
    let rest = file_name
        .strip_prefix("trace_")?
        .strip_prefix(function)?
        .strip_prefix('_')?;

    rest.strip_suffix(".log")
}

pub fn report_name(function: &str, params: &str) -> String {
    format!("instructions_{}_{}.json", function, params)
}

/// Turns whatever was passed on the command line into something usable in a
/// file name.
pub fn params_slug(params: &str) -> String {
    lazy_static! {
        static ref UNSAFE: Regex = Regex::new(r"[^\w.\-]+").unwrap();
    }

    UNSAFE.replace_all(params.trim(), "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::{params_from_trace_name, params_slug, report_name, Report};
    use crate::{
        analyzer::{Attribution, Termination},
        resolve::SourceLine,
    };
    use std::collections::HashMap;

    fn attribution(termination: Termination) -> Attribution {
        Attribution {
            line_counts: HashMap::from([
                (SourceLine::new("src/a.c:6"), 2),
                (SourceLine::new("src/a.c:5"), 1),
                (SourceLine::new("src/a.c:7"), 1),
            ]),
            unattributed: 0,
            termination,
            last_address: None,
        }
    }

    #[test]
    fn completed_run() {
        let report = Report::new("f", "3_4", None, &attribution(Termination::Completed));
        assert_eq!(report.source_file, "src/a.c");
        assert_eq!(report.params, "3 4");
        assert_eq!(report.total_instructions, 4);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["instructions"]["src/a.c:6"], 2);
        assert!(json.get("crash_detected").is_none());
        assert!(json.get("crash_last_executed_line").is_none());
        assert!(json.get("unattributed_instructions").is_none());

        // keys come out sorted
        let text = report.to_json().unwrap();
        let five = text.find("src/a.c:5").unwrap();
        let seven = text.find("src/a.c:7").unwrap();
        assert!(five < seven);
    }

    #[test]
    fn crashed_run() {
        let mut a = attribution(Termination::AbnormalTermination {
            last_line: Some(SourceLine::new("src/a.c:6")),
        });
        a.unattributed = 3;

        let report = Report::new("f", "0", Some("a.c"), &a);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["source_file"], "a.c");
        assert_eq!(json["crash_detected"], true);
        assert_eq!(json["crash_last_executed_line"], "src/a.c:6");
        assert_eq!(json["unattributed_instructions"], 3);

        let back: Report = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn crash_before_any_line() {
        let a = Attribution {
            line_counts: HashMap::new(),
            unattributed: 2,
            termination: Termination::AbnormalTermination { last_line: None },
            last_address: Some(0x10),
        };

        let report = Report::new("f", "1", None, &a);
        assert_eq!(report.crash_last_executed_line, Some(None));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["crash_detected"], true);
        assert!(json["crash_last_executed_line"].is_null());
        assert!(json.get("crash_last_executed_line").is_some());

        let back: Report = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn empty_run() {
        let report = Report::new("f", "", None, &Attribution::not_entered());
        assert_eq!(report.source_file, "unknown");
        assert!(report.instructions.is_empty());
    }

    #[test]
    fn trace_names() {
        assert_eq!(params_from_trace_name("sort", "trace_sort_5_1_3.log"), Some("5_1_3"));
        assert_eq!(params_from_trace_name("sort", "trace_sort_.log"), Some(""));
        assert_eq!(params_from_trace_name("sort", "trace_sorted_1.log"), None);
        assert_eq!(params_from_trace_name("sort", "sort_1.log"), None);
        assert_eq!(params_from_trace_name("sort", "trace_sort_1.txt"), None);
        assert_eq!(report_name("sort", "5_1_3"), "instructions_sort_5_1_3.json");
    }

    #[test]
    fn slugs() {
        assert_eq!(params_slug(" 3 -4  abc "), "3_-4_abc");
        assert_eq!(params_slug("a/b"), "a_b");
    }
}
