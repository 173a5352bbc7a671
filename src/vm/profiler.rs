//! Hot-spot profiling and JIT-candidate analysis.
//!
//! The profiler observes every program-counter visit during a run and
//! derives advisory metadata from the counts afterwards: hot-spot
//! rankings, compilation candidates past a threshold, and heuristic
//! optimization suggestions from the instruction windows around hot pcs.
//! Nothing here changes execution; an optimizing backend is an external
//! consumer of this data.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::vm::ops::Opcode;
use crate::vm::{Instruction, Operand};

/// A program-counter location ranked by visit frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct HotSpot {
    pub pc: usize,
    pub count: u64,
    pub percentage: f64,
}

/// Taken/not-taken counts for one conditional branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchProfile {
    taken: u64,
    not_taken: u64,
}

impl BranchProfile {
    pub fn record(&mut self, taken: bool) {
        if taken {
            self.taken += 1;
        } else {
            self.not_taken += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.taken + self.not_taken
    }

    pub fn taken_count(&self) -> u64 {
        self.taken
    }

    pub fn not_taken_count(&self) -> u64 {
        self.not_taken
    }

    pub fn taken_ratio(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.taken as f64 / self.total() as f64
        }
    }

    pub fn predict_taken(&self) -> bool {
        self.taken_ratio() > 0.5
    }
}

/// How aggressively a hot location is worth optimizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    O1,
    O2,
    O3,
}

impl OptimizationLevel {
    fn for_count(count: u64) -> Self {
        match count {
            0..=50 => OptimizationLevel::None,
            51..=500 => OptimizationLevel::O1,
            501..=5000 => OptimizationLevel::O2,
            _ => OptimizationLevel::O3,
        }
    }
}

/// A suggested transformation at a specific pc.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimization {
    pub kind: OptimizationKind,
    pub pc: usize,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizationKind {
    ConstantFolding,
    LoopInvariantHoisting,
    RedundantLoadElimination,
    BranchStraightening,
}

/// The post-run profile handed back to callers.
#[derive(Debug, Clone)]
pub struct JitProfile {
    /// All visited pcs, most-visited first (ties broken by ascending pc).
    pub hot_spots: Vec<HotSpot>,
    /// Pcs whose visit count exceeds the threshold, ascending.
    pub compilation_candidates: Vec<usize>,
    /// Heuristic rewrite suggestions around the candidates.
    pub optimizations: Vec<Optimization>,
}

/// Serializable snapshot of the raw profile tables.
#[derive(Serialize, Deserialize)]
struct ProfileData {
    visit_counts: HashMap<usize, u64>,
    branch_profiles: HashMap<usize, BranchProfile>,
    threshold: u64,
}

/// Per-run execution profiler.
pub struct ExecutionProfiler {
    visit_counts: HashMap<usize, u64>,
    branch_profiles: HashMap<usize, BranchProfile>,
    threshold: u64,
    total_visits: u64,
}

impl ExecutionProfiler {
    pub fn new(threshold: u64) -> Self {
        Self {
            visit_counts: HashMap::new(),
            branch_profiles: HashMap::new(),
            threshold,
            total_visits: 0,
        }
    }

    pub fn record_visit(&mut self, pc: usize) {
        *self.visit_counts.entry(pc).or_insert(0) += 1;
        self.total_visits += 1;
    }

    pub fn record_branch(&mut self, pc: usize, taken: bool) {
        self.branch_profiles.entry(pc).or_default().record(taken);
    }

    pub fn visit_count(&self, pc: usize) -> u64 {
        self.visit_counts.get(&pc).copied().unwrap_or(0)
    }

    pub fn total_visits(&self) -> u64 {
        self.total_visits
    }

    pub fn branch_profile(&self, pc: usize) -> Option<&BranchProfile> {
        self.branch_profiles.get(&pc)
    }

    pub fn suggested_optimization_level(&self, pc: usize) -> OptimizationLevel {
        OptimizationLevel::for_count(self.visit_count(pc))
    }

    /// All visited pcs with counts and percentages, hottest first.
    /// Recomputed from the raw table on every call; nothing is cached.
    pub fn hot_spots(&self) -> Vec<HotSpot> {
        let total = self.total_visits.max(1) as f64;
        let mut spots: Vec<HotSpot> = self
            .visit_counts
            .iter()
            .map(|(&pc, &count)| HotSpot {
                pc,
                count,
                percentage: count as f64 / total * 100.0,
            })
            .collect();
        spots.sort_by(|a, b| b.count.cmp(&a.count).then(a.pc.cmp(&b.pc)));
        spots
    }

    /// Pcs whose visit count strictly exceeds the threshold, ascending.
    pub fn compilation_candidates(&self) -> Vec<usize> {
        let mut candidates: Vec<usize> = self
            .visit_counts
            .iter()
            .filter(|&(_, &count)| count > self.threshold)
            .map(|(&pc, _)| pc)
            .collect();
        candidates.sort_unstable();
        candidates
    }

    /// Finalize the profile, running the optimization analysis over the
    /// program's instruction windows.
    pub fn finish(&self, instructions: &[Instruction]) -> JitProfile {
        let candidates = self.compilation_candidates();
        let optimizations = self.analyze(instructions, &candidates);
        JitProfile {
            hot_spots: self.hot_spots(),
            compilation_candidates: candidates,
            optimizations,
        }
    }

    /// Pattern-match the instruction window around each candidate pc.
    fn analyze(&self, instructions: &[Instruction], candidates: &[usize]) -> Vec<Optimization> {
        let mut seen: HashSet<(OptimizationKind, usize)> = HashSet::new();
        let mut out = Vec::new();
        let mut suggest = |kind, pc, description: String, out: &mut Vec<Optimization>| {
            if seen.insert((kind, pc)) {
                out.push(Optimization {
                    kind,
                    pc,
                    description,
                });
            }
        };

        for &pc in candidates {
            let Some(instruction) = instructions.get(pc) else {
                continue;
            };

            // A hot backward branch marks a tight loop: everything the
            // body recomputes per iteration is a hoisting candidate.
            if instruction.opcode.is_control_flow() {
                if let Some(Operand::Literal(target)) = instruction.operand {
                    if target >= 0 && (target as usize) <= pc {
                        suggest(
                            OptimizationKind::LoopInvariantHoisting,
                            pc,
                            format!(
                                "backward branch to {}; loop body {}..{} repeats {} times",
                                target,
                                target,
                                pc,
                                self.visit_count(pc)
                            ),
                            &mut out,
                        );
                    }
                }
            }

            // Two literal pushes feeding a hot arithmetic op fold at
            // compile time.
            if instruction.opcode.is_arithmetic() && pc >= 2 {
                let feeds_constants = instructions[pc - 2].opcode == Opcode::Push
                    && instructions[pc - 1].opcode == Opcode::Push;
                if feeds_constants {
                    suggest(
                        OptimizationKind::ConstantFolding,
                        pc,
                        format!(
                            "{} at {} consumes two constant pushes; fold to one push",
                            instruction.opcode, pc
                        ),
                        &mut out,
                    );
                }
            }

            // The same slot loaded twice in a short window can be kept
            // on the stack instead.
            if instruction.opcode == Opcode::Load {
                let window = pc.saturating_sub(4)..pc;
                let repeated = instructions[window.clone()]
                    .iter()
                    .any(|earlier| {
                        earlier.opcode == Opcode::Load && earlier.operand == instruction.operand
                    });
                if repeated {
                    suggest(
                        OptimizationKind::RedundantLoadElimination,
                        pc,
                        format!("slot reloaded at {} within a {}-instruction window", pc, 4),
                        &mut out,
                    );
                }
            }

            // A heavily biased conditional branch can be laid out for
            // its common direction.
            if matches!(instruction.opcode, Opcode::JmpIfTrue | Opcode::JmpIfFalse) {
                if let Some(profile) = self.branch_profiles.get(&pc) {
                    let ratio = profile.taken_ratio();
                    if profile.total() >= 2 && !(0.1..=0.9).contains(&ratio) {
                        suggest(
                            OptimizationKind::BranchStraightening,
                            pc,
                            format!(
                                "branch at {} is {:.0}% {}; straighten the common path",
                                pc,
                                ratio.max(1.0 - ratio) * 100.0,
                                if profile.predict_taken() { "taken" } else { "not taken" }
                            ),
                            &mut out,
                        );
                    }
                }
            }
        }

        out
    }

    /// Serialize the raw profile tables to JSON.
    pub fn export_profile_data(&self) -> String {
        let data = ProfileData {
            visit_counts: self.visit_counts.clone(),
            branch_profiles: self.branch_profiles.clone(),
            threshold: self.threshold,
        };
        serde_json::to_string(&data).unwrap_or_else(|_| "{}".to_string())
    }

    /// Replace the profile tables with previously exported data.
    pub fn import_profile_data(&mut self, data: &str) -> Result<(), String> {
        let profile: ProfileData = serde_json::from_str(data)
            .map_err(|e| format!("failed to parse profile data: {}", e))?;
        self.visit_counts = profile.visit_counts;
        self.branch_profiles = profile.branch_profiles;
        self.threshold = profile.threshold;
        self.total_visits = self.visit_counts.values().sum();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.visit_counts.clear();
        self.branch_profiles.clear();
        self.total_visits = 0;
    }
}
