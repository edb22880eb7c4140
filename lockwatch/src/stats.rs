use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{MapData, PerCpuArray},
};
use lockwatch_common::{CaptureOutcome, STATS_MAP};
use log::{info, warn};

use crate::{events, telemetry};

/// Capture outcomes summed over all CPUs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeTotals {
    counts: [u64; CaptureOutcome::COUNT],
}

impl OutcomeTotals {
    pub fn get(&self, outcome: CaptureOutcome) -> u64 {
        self.counts[outcome.index() as usize]
    }

    pub fn set(&mut self, outcome: CaptureOutcome, value: u64) {
        self.counts[outcome.index() as usize] = value;
    }

    /// Counters only grow while the object is loaded; a smaller value
    /// reports as zero.
    pub fn since(&self, earlier: &OutcomeTotals) -> OutcomeTotals {
        let mut delta = OutcomeTotals::default();
        for outcome in CaptureOutcome::ALL {
            delta.set(outcome, self.get(outcome).saturating_sub(earlier.get(outcome)));
        }
        delta
    }

    pub fn attempts(&self) -> u64 {
        self.counts.iter().sum()
    }
}

pub struct StatsReader {
    map: PerCpuArray<MapData, u64>,
    previous: OutcomeTotals,
}

impl StatsReader {
    pub fn new(bpf: &mut Ebpf) -> Result<Self> {
        let map = PerCpuArray::try_from(
            bpf.take_map(STATS_MAP)
                .with_context(|| format!("Failed to get {} map", STATS_MAP))?,
        )?;
        Ok(Self {
            map,
            previous: OutcomeTotals::default(),
        })
    }

    pub fn read(&self) -> Result<OutcomeTotals> {
        let mut totals = OutcomeTotals::default();
        for outcome in CaptureOutcome::ALL {
            let per_cpu = self
                .map
                .get(&outcome.index(), 0)
                .with_context(|| format!("Failed to read {} counter", outcome.as_str()))?;
            totals.set(outcome, per_cpu.iter().sum());
        }
        Ok(totals)
    }

    /// Logs and exports what changed since the last report.
    pub fn report(&mut self) -> Result<OutcomeTotals> {
        let totals = self.read()?;
        let delta = totals.since(&self.previous);
        self.previous = totals;

        info!(
            "STATS attempts={} submitted={} filtered={} no_space={} aborted={} unknown_op={}",
            delta.attempts(),
            delta.get(CaptureOutcome::Submitted),
            delta.get(CaptureOutcome::FilteredOut),
            delta.get(CaptureOutcome::NoSpace),
            delta.get(CaptureOutcome::Aborted),
            events::take_unknown_operations(),
        );
        if delta.get(CaptureOutcome::NoSpace) > 0 {
            warn!(
                "{} mutex events dropped: ring buffer full",
                delta.get(CaptureOutcome::NoSpace)
            );
        }

        telemetry::record_capture_outcomes(&delta);
        Ok(delta)
    }
}
