//! Run summaries derived from a completed execution.

use serde::Serialize;

use crate::vm::machine::MachineState;
use crate::vm::profiler::JitProfile;

/// Estimated bytes held per live memory slot. This is a fixed-size
/// approximation for reporting, not allocator accounting.
const BYTES_PER_SLOT: usize = 64;

/// Read-only performance summary of one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub instructions_per_second: f64,
    pub memory_usage_bytes: usize,
    pub gc_collections: u64,
    pub jit_compilations: usize,
    pub execution_time_ms: f64,
    pub total_instructions: u64,
}

impl PerformanceMetrics {
    /// Derive the metrics from a run's final state and profile.
    pub fn from_run(state: &MachineState, profile: &JitProfile) -> Self {
        Self {
            instructions_per_second: throughput(state.instruction_count, state.execution_time_ms),
            memory_usage_bytes: state.memory.len() * BYTES_PER_SLOT,
            // There is no collector in this engine; a collaborating
            // runtime may overwrite this with a real count.
            gc_collections: 0,
            jit_compilations: profile.compilation_candidates.len(),
            execution_time_ms: state.execution_time_ms,
            total_instructions: state.instruction_count,
        }
    }

    pub fn with_gc_collections(mut self, collections: u64) -> Self {
        self.gc_collections = collections;
        self
    }

    /// Render the human-readable report.
    pub fn render_human(&self) -> String {
        format!(
            "instructions:      {}\n\
             elapsed:           {:.3} ms\n\
             throughput:        {:.0} instructions/second\n\
             memory (est.):     {} bytes\n\
             gc collections:    {}\n\
             jit compilations:  {}\n",
            self.total_instructions,
            self.execution_time_ms,
            self.instructions_per_second,
            self.memory_usage_bytes,
            self.gc_collections,
            self.jit_compilations,
        )
    }

    /// Render the report as JSON.
    pub fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Instructions per second, guarding the zero-elapsed case: an
/// instantaneous run reports infinite throughput rather than crashing,
/// and an empty run reports zero.
fn throughput(instruction_count: u64, execution_time_ms: f64) -> f64 {
    if execution_time_ms > 0.0 {
        instruction_count as f64 / (execution_time_ms / 1000.0)
    } else if instruction_count == 0 {
        0.0
    } else {
        f64::INFINITY
    }
}
