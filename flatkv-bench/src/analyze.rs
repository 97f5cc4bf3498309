// Copyright 2025 flatkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::{fmt::Display, time::Duration};

use flatkv_memory::{Backend, StatsSnapshot};
use hdrhistogram::Histogram;

const QUANTILES: [(&str, f64); 4] = [("p50", 0.5), ("p90", 0.9), ("p99", 0.99), ("p999", 0.999)];

/// Measurements of one backend run.
#[derive(Debug)]
pub struct Report {
    pub backend: Backend,
    pub ops: u64,
    pub elapsed: Duration,
    /// Per-operation latency in nanoseconds.
    pub latency: Histogram<u64>,
    pub hits: u64,
    pub stats: StatsSnapshot,
}

impl Report {
    pub fn throughput(&self) -> f64 {
        self.ops as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    fn quantile(&self, q: f64) -> Duration {
        Duration::from_nanos(self.latency.value_at_quantile(q))
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ops: {} ({} get hits)", self.ops, self.hits)?;
        writeln!(f, "elapsed: {:.3?}", self.elapsed)?;
        writeln!(f, "throughput: {:.0} ops/s", self.throughput())?;
        for (name, q) in QUANTILES {
            writeln!(f, "{name}: {:?}", self.quantile(q))?;
        }
        writeln!(f, "max: {:?}", Duration::from_nanos(self.latency.max()))?;

        let lookups = self.stats.hit + self.stats.miss;
        if lookups > 0 {
            writeln!(f, "hit ratio: {:.2}%", self.stats.hit as f64 / lookups as f64 * 100.0)?;
        }
        writeln!(
            f,
            "insert: {}, replace: {}, remove: {}, evict: {}, reject: {}",
            self.stats.insert, self.stats.replace, self.stats.remove, self.stats.evict, self.stats.reject
        )?;
        writeln!(f, "usage: {} B in {} records", self.stats.usage, self.stats.entries)?;
        if self.backend == Backend::FlatCombine {
            writeln!(
                f,
                "combine passes: {}, average batch: {:.2}, slot unlinks: {}",
                self.stats.combine_pass,
                self.stats.avg_batch(),
                self.stats.slot_unlink
            )?;
        }
        Ok(())
    }
}

/// Throughput and tail latency of every report relative to the first one.
pub struct Comparison<'a>(pub &'a [Report]);

impl Display for Comparison<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(base) = self.0.first() else {
            return Ok(());
        };
        for report in self.0 {
            let p99 = report.quantile(0.99).as_nanos().max(1) as f64;
            let base_p99 = base.quantile(0.99).as_nanos().max(1) as f64;
            writeln!(
                f,
                "{:>14}: throughput x{:.2}, p99 x{:.2}",
                report.backend.to_string(),
                report.throughput() / base.throughput().max(f64::EPSILON),
                p99 / base_p99
            )?;
        }
        Ok(())
    }
}
