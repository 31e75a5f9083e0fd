// `junit` builtin: summarises JUnit XML reports and fails the step on any
// failed or errored test.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;

use worker_common::{StepResult, WorkerSettings};

use super::{BuiltinAction, BuiltinContext};

static SUITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<testsuite\b([^>]*)>").expect("Invalid testsuite regex"));

static CASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<testcase\b([^>]*?)(?:/>|>(.*?)</testcase>)").expect("Invalid testcase regex")
});

static ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).expect("Invalid attribute regex"));

pub fn factory(_settings: &WorkerSettings) -> Box<dyn BuiltinAction> {
    Box::new(JunitAction)
}

pub struct JunitAction;

/// Totals across one or more reports.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
    /// `classname.name` of every failed or errored case.
    pub failed_cases: Vec<String>,
}

impl ReportSummary {
    pub fn passed(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }

    fn merge(&mut self, other: ReportSummary) {
        self.tests += other.tests;
        self.failures += other.failures;
        self.errors += other.errors;
        self.skipped += other.skipped;
        self.failed_cases.extend(other.failed_cases);
    }
}

#[async_trait]
impl BuiltinAction for JunitAction {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult {
        let Some(pattern) = ctx.non_empty_param("path") else {
            let reason = "junit requires a 'path' parameter".to_string();
            ctx.log.log(&reason);
            return StepResult::fail(reason);
        };

        let summary = match read_reports(pattern).await {
            Ok(summary) => summary,
            Err(e) => {
                let reason = format!("Unable to read JUnit reports: {e:#}");
                ctx.log.log(&reason);
                return StepResult::fail(reason);
            }
        };

        for case in &summary.failed_cases {
            ctx.log.log(format!("FAILED {case}"));
        }
        let totals = format!(
            "{} tests, {} failures, {} errors, {} skipped",
            summary.tests, summary.failures, summary.errors, summary.skipped
        );
        ctx.log.log(format!("JUnit: {totals}"));

        if summary.passed() {
            StepResult::success()
        } else {
            StepResult::fail(format!("Tests failed: {totals}"))
        }
    }
}

async fn read_reports(pattern: &str) -> Result<ReportSummary> {
    let files: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("Invalid path pattern {pattern:?}"))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    anyhow::ensure!(!files.is_empty(), "no report matches {pattern:?}");

    let mut summary = ReportSummary::default();
    for file in files {
        let xml = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        summary.merge(parse_report(&xml));
    }
    Ok(summary)
}

fn attributes(raw: &str) -> HashMap<&str, &str> {
    ATTR.captures_iter(raw)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect()
}

fn count(attrs: &HashMap<&str, &str>, name: &str) -> u64 {
    attrs.get(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Parse one JUnit document.
///
/// Totals come from `<testsuite>` attributes when present; a report without
/// suites is counted case by case.
pub fn parse_report(xml: &str) -> ReportSummary {
    let mut summary = ReportSummary::default();
    let mut counted_cases = ReportSummary::default();

    for suite in SUITE.captures_iter(xml) {
        let attrs = attributes(suite.get(1).map_or("", |m| m.as_str()));
        summary.tests += count(&attrs, "tests");
        summary.failures += count(&attrs, "failures");
        summary.errors += count(&attrs, "errors");
        summary.skipped += count(&attrs, "skipped") + count(&attrs, "disabled");
    }

    for case in CASE.captures_iter(xml) {
        let attrs = attributes(case.get(1).map_or("", |m| m.as_str()));
        let body = case.get(2).map_or("", |m| m.as_str());
        counted_cases.tests += 1;

        let failed = body.contains("<failure");
        let errored = body.contains("<error");
        if failed {
            counted_cases.failures += 1;
        }
        if errored {
            counted_cases.errors += 1;
        }
        if body.contains("<skipped") {
            counted_cases.skipped += 1;
        }
        if failed || errored {
            let name = attrs.get("name").copied().unwrap_or("<unnamed>");
            let case_name = match attrs.get("classname") {
                Some(class) if !class.is_empty() => format!("{class}.{name}"),
                _ => name.to_string(),
            };
            summary.failed_cases.push(case_name);
        }
    }

    if !SUITE.is_match(xml) {
        summary.tests = counted_cases.tests;
        summary.failures = counted_cases.failures;
        summary.errors = counted_cases.errors;
        summary.skipped = counted_cases.skipped;
    }
    summary
}
