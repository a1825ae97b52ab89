// Copyright 2024-2026 extract-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `extract-core simulate`: run a synthetic batch through a scripted
//! extractor and report the resulting summary.

use std::sync::Arc;
use std::time::Duration;

use crate::batch::{BatchResults, ItemSpec};
use crate::config::EngineConfig;
use crate::extractor::{ExtractRequest, ExtractionMode, ScriptedExtractor};
use crate::scheduler::Priority;
use crate::shutdown::ShutdownResult;
use crate::{EngineError, ExtractionEngine};

/// Options for a simulated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulateArgs {
    pub items: usize,
    /// Distinct subjects; fewer than `items` produces duplicate requests.
    pub distinct: usize,
    pub concurrency: usize,
    pub rate_limit: Option<f64>,
    pub priority: Priority,
    pub delay: Duration,
    /// Every n-th subject fails permanently.
    pub fail_every: Option<usize>,
    /// First n calls per subject fail transiently.
    pub flaky: u32,
    pub include_items: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            items: 20,
            distinct: 20,
            concurrency: 4,
            rate_limit: None,
            priority: Priority::Normal,
            delay: Duration::from_millis(25),
            fail_every: None,
            flaky: 0,
            include_items: false,
        }
    }
}

impl SimulateArgs {
    /// Parse `--flag value` pairs following the subcommand.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut out = Self::default();
        let mut distinct = None;
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            if flag == "--items-detail" {
                out.include_items = true;
                i += 1;
                continue;
            }
            let value = args.get(i + 1).ok_or_else(|| format!("Missing value for {flag}"))?;
            match flag {
                "--items" => out.items = parse_num(flag, value)?,
                "--distinct" => distinct = Some(parse_num(flag, value)?),
                "--concurrency" => out.concurrency = parse_num(flag, value)?,
                "--rate" => out.rate_limit = Some(parse_num(flag, value)?),
                "--priority" => out.priority = value.parse().map_err(|_| format!("Invalid priority: {value}"))?,
                "--delay-ms" => out.delay = Duration::from_millis(parse_num(flag, value)?),
                "--fail-every" => out.fail_every = Some(parse_num(flag, value)?).filter(|n| *n > 0),
                "--flaky" => out.flaky = parse_num(flag, value)?,
                _ => return Err(format!("Unknown argument: {flag}")),
            }
            i += 2;
        }
        out.distinct = distinct.unwrap_or(out.items).clamp(1, out.items.max(1));
        Ok(out)
    }

    fn subject(&self, index: usize) -> String {
        format!("company-{}", index % self.distinct)
    }

    fn extractor(&self) -> ScriptedExtractor {
        let mut extractor = ScriptedExtractor::new().with_delay(self.delay);
        for n in 0..self.distinct {
            let subject = self.subject(n);
            if self.fail_every.is_some_and(|every| (n + 1) % every == 0) {
                extractor = extractor.fail_permanently(&subject);
            } else if self.flaky > 0 {
                extractor = extractor.fail_transiently(&subject, self.flaky);
            }
        }
        extractor
    }
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("Invalid value for {flag}: {value}"))
}

/// Run the batch to completion. Ctrl+C shuts the engine down early.
pub async fn run_simulate(config: EngineConfig, args: &SimulateArgs) -> Result<BatchResults, EngineError> {
    let shutdown_timeout = config.shutdown_timeout;
    let engine = ExtractionEngine::new(config, Arc::new(args.extractor()));
    engine.start();

    let specs = (0..args.items)
        .map(|i| ItemSpec::new(ExtractRequest::company(args.subject(i), ExtractionMode::Basic)))
        .collect();
    let mut options = engine
        .default_options()
        .with_priority(args.priority)
        .with_concurrency(args.concurrency);
    options.rate_limit = args.rate_limit;
    let batch_id = engine.submit_batch(specs, options).await?;

    tokio::select! {
        status = engine.wait_for_batch(&batch_id) => {
            status?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, shutting down...");
        }
    }

    if let ShutdownResult::Timeout { remaining } = engine.shutdown(shutdown_timeout).await {
        eprintln!("Shutdown timeout, {remaining} items still running");
    }
    engine.wait_for_batch(&batch_id).await?;
    engine.get_batch_results(&batch_id)
}

/// Print results as pretty JSON. Item detail only when requested.
pub fn print_results(results: &BatchResults, include_items: bool) -> Result<(), serde_json::Error> {
    let report = if include_items {
        serde_json::to_value(results)?
    } else {
        serde_json::json!({
            "batch_id": results.batch_id,
            "status": results.status,
            "summary": results.summary,
        })
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
