//! Terminal result output.
//!
//! The CLI's result printer is a capability so adapters can swap the
//! destination; the shipped implementation targets an ANSI terminal.

use crate::model::RunAggregate;

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Anything that can render a final aggregate for a user.
pub trait ResultWriter {
    fn write_results(&self, aggregate: &RunAggregate);
}

/// Renders the aggregate as a colored table on stdout.
pub struct AnsiWriter;

impl AnsiWriter {
    fn render(aggregate: &RunAggregate) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "\n{}Run {} finished{}\n\n",
            BOLD, aggregate.run_token, RESET
        ));
        output.push_str(&format!(
            "  Requests     {} total, {}{} ok{}, {}{} failed{}\n",
            aggregate.total_requests,
            GREEN,
            aggregate.successful_requests,
            RESET,
            if aggregate.failed_requests > 0 { RED } else { "" },
            aggregate.failed_requests,
            RESET,
        ));
        output.push_str(&format!(
            "  Elapsed      {:.1}s\n",
            aggregate.total_elapsed_time as f64 / 1000.0
        ));
        output.push_str(&format!(
            "  Peak RPS     {:.2}\n",
            aggregate.requests_per_second
        ));
        output.push_str(&format!(
            "  Latency      avg {:.2}ms  min {:.2}ms  max {:.2}ms\n",
            aggregate.average_response_time,
            aggregate.min_response_time,
            aggregate.max_response_time,
        ));
        output.push_str(&format!(
            "  Percentiles  p50 {:.2}  p75 {:.2}  p90 {:.2}  p95 {:.2}  p99 {:.2}\n",
            aggregate.percentiles.p50,
            aggregate.percentiles.p75,
            aggregate.percentiles.p90,
            aggregate.percentiles.p95,
            aggregate.percentiles.p99,
        ));

        if !aggregate.status_codes.is_empty() {
            output.push_str(&format!(
                "\n{:<8} {:>8} {:>10} {:>10} {:>10} {:>10}\n",
                "Status", "Count", "Min (ms)", "Avg (ms)", "Max (ms)", "P95 (ms)"
            ));
            output.push_str(&"-".repeat(60));
            output.push('\n');
            for (status, group) in &aggregate.status_codes {
                output.push_str(&format!(
                    "{:<8} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>10.2}\n",
                    status, group.count, group.min, group.avg, group.max, group.percentiles.p95
                ));
            }
        }

        output
    }
}

impl ResultWriter for AnsiWriter {
    fn write_results(&self, aggregate: &RunAggregate) {
        print!("{}", Self::render(aggregate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PercentileSet, StatusAggregate};

    #[test]
    fn render_includes_the_headline_numbers() {
        let mut aggregate = RunAggregate::empty("tok-1");
        aggregate.total_requests = 100;
        aggregate.successful_requests = 98;
        aggregate.failed_requests = 2;
        aggregate.requests_per_second = 41.5;
        aggregate.average_response_time = 52.25;
        aggregate.total_elapsed_time = 2500;
        aggregate.percentiles = PercentileSet {
            p50: 50.0,
            p75: 55.0,
            p90: 60.0,
            p95: 65.0,
            p99: 80.0,
        };
        aggregate.status_codes.insert(
            200,
            StatusAggregate {
                count: 98,
                min: 40.0,
                avg: 52.0,
                max: 90.0,
                percentiles: PercentileSet::default(),
            },
        );

        let rendered = AnsiWriter::render(&aggregate);
        assert!(rendered.contains("tok-1"));
        assert!(rendered.contains("100 total"));
        assert!(rendered.contains("41.50"));
        assert!(rendered.contains("p99 80.00"));
        assert!(rendered.contains("200"));
    }
}
