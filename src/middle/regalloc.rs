//! Chaitin-style graph-coloring register allocation with spilling.
//!
//! Builds an interference graph from the CFG's liveness, simplifies it down
//! to a coloring order, and assigns each vreg one of the VM's eight physical
//! registers. Vreg 0 (the accumulator) is pre-bound to `A` and never enters
//! the graph; the remaining seven registers are available to color every
//! other vreg. When no coloring exists, the spill handler rewrites the LIR
//! to route the worst vreg through a fresh memory slot and the whole
//! allocator restarts from CFG construction.

use crate::common::{Diagnostic, Loc, Map, Set, Stage};
use crate::middle::cfg::Cfg;
use crate::middle::lir::{Instr, Program, VReg};

/// One of the VM's eight physical registers, `A`..`H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysReg(pub u8);

impl PhysReg {
    pub const A: PhysReg = PhysReg(0);
    pub const COUNT: usize = 8;

    /// The lowercase register letter the assembler emits (`a`..`h`).
    pub fn letter(self) -> char {
        (b'a' + self.0) as char
    }
}

impl std::fmt::Display for PhysReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// How many physical registers are available to vregs other than the
/// accumulator. `A` is reserved for vreg 0, so `B`..`H` remain.
const K: usize = PhysReg::COUNT - 1;

/// The final, post-allocation LIR plus the color assigned to every vreg it
/// mentions.
pub struct Allocation {
    pub program: Program,
    pub colors: Map<VReg, PhysReg>,
}

/// Bounds the spill-rewrite-restart loop. Each genuine spill strictly
/// shrinks the live set at the program point that defeated coloring, so the
/// loop always terminates well under this; it exists only as a safeguard
/// against an allocator bug looping forever.
fn spill_budget(program: &Program) -> usize {
    (program.next_vreg as usize).max(1) * 4 + 16
}

/// Allocate physical registers for `program`, spilling and restarting as
/// many times as needed. Fails only if the bounded number of spill attempts
/// is exceeded, an internal allocator error that must never trigger for
/// well-formed input with at least 8 physical registers.
pub fn allocate(mut program: Program) -> Result<Allocation, Diagnostic> {
    let budget = spill_budget(&program);
    for _ in 0..budget {
        let cfg = Cfg::build(&program);
        let graph = InterferenceGraph::build(&cfg);
        match color(&graph) {
            Ok(colors) => return Ok(Allocation { program, colors }),
            Err(spill_target) => {
                program = rewrite_spill(&program, spill_target);
            }
        }
    }
    Err(Diagnostic::error(
        Stage::Allocation,
        Loc::default(),
        "register allocator did not converge within the bounded number of spill attempts",
    ))
}

// --- interference graph -------------------------------------------------

struct InterferenceGraph {
    nodes: Set<VReg>,
    adjacency: Map<VReg, Set<VReg>>,
    /// Approximates each vreg's live range length: the number of program
    /// points (instruction boundaries) at which it is live, counted while
    /// the graph is built.
    live_points: Map<VReg, u32>,
}

impl InterferenceGraph {
    fn build(cfg: &Cfg) -> Self {
        let mut nodes = Set::new();
        let mut adjacency: Map<VReg, Set<VReg>> = Map::new();
        let mut live_points: Map<VReg, u32> = Map::new();

        for block in &cfg.blocks {
            let mut live: Set<VReg> = block.live_out.clone();
            for instr in block.instrs.iter().rev() {
                for w in instr.writes() {
                    live.remove(&w);
                }
                for r in instr.reads() {
                    live.insert(r);
                }

                let live_now: Vec<VReg> = live.iter().copied().filter(|v| !v.is_acc()).collect();
                for &v in &live_now {
                    nodes.insert(v);
                    adjacency.entry(v).or_default();
                    *live_points.entry(v).or_insert(0) += 1;
                }
                for i in 0..live_now.len() {
                    for j in i + 1..live_now.len() {
                        adjacency.entry(live_now[i]).or_default().insert(live_now[j]);
                        adjacency.entry(live_now[j]).or_default().insert(live_now[i]);
                    }
                }
            }
        }

        InterferenceGraph { nodes, adjacency, live_points }
    }

    fn degree_in(&self, v: VReg, active: &Set<VReg>) -> usize {
        self.adjacency.get(&v).map(|n| n.iter().filter(|x| active.contains(x)).count()).unwrap_or(0)
    }

    /// The vreg `max_by`-ing live range length over degree, ties broken
    /// toward the smaller vreg id. Cross-multiplies instead of dividing so
    /// the comparison stays exact integer arithmetic.
    fn worst_spill_candidate(&self, active: &Set<VReg>) -> VReg {
        let mut best: Option<VReg> = None;
        for &v in active {
            best = Some(match best {
                None => v,
                Some(b) => {
                    let length_v = *self.live_points.get(&v).unwrap_or(&1) as u64;
                    let length_b = *self.live_points.get(&b).unwrap_or(&1) as u64;
                    let degree_v = self.degree_in(v, active).max(1) as u64;
                    let degree_b = self.degree_in(b, active).max(1) as u64;
                    let lhs = length_v * degree_b;
                    let rhs = length_b * degree_v;
                    if lhs > rhs || (lhs == rhs && v.0 < b.0) {
                        v
                    } else {
                        b
                    }
                }
            });
        }
        best.expect("worst_spill_candidate is only called on a non-empty active set")
    }
}

/// Simplify the graph onto a stack, then pop it back off assigning colors.
/// Returns `Err(v)` with the vreg that could not be colored (an *actual*
/// spill) if the select phase runs out of colors.
fn color(graph: &InterferenceGraph) -> Result<Map<VReg, PhysReg>, VReg> {
    let mut active = graph.nodes.clone();
    let mut stack: Vec<VReg> = Vec::with_capacity(active.len());

    while !active.is_empty() {
        let low_degree = active.iter().copied().find(|&v| graph.degree_in(v, &active) < K);
        let chosen = low_degree.unwrap_or_else(|| graph.worst_spill_candidate(&active));
        active.remove(&chosen);
        stack.push(chosen);
    }

    let mut colors: Map<VReg, PhysReg> = Map::new();
    colors.insert(VReg::ACC, PhysReg::A);
    while let Some(v) = stack.pop() {
        let used: Set<PhysReg> =
            graph.adjacency.get(&v).into_iter().flatten().filter_map(|n| colors.get(n).copied()).collect();
        let assigned = (1..=K as u8).map(PhysReg).find(|c| !used.contains(c));
        match assigned {
            Some(c) => {
                colors.insert(v, c);
            }
            None => return Err(v),
        }
    }
    Ok(colors)
}

// --- spill rewrite --------------------------------------------------------

/// Routes every mention of `spilled` through a fresh memory slot: each
/// instruction that reads or writes it gets a fresh vreg carrying the
/// address, and (for reads) a `Load`/`Put` pair before the instruction or
/// (for writes) a `Get`/`Store` pair after it, saving and restoring the
/// accumulator around the transfer so the instruction's original effect on
/// `A` is preserved.
fn rewrite_spill(program: &Program, spilled: VReg) -> Program {
    let mut next_vreg = program.next_vreg;
    let slot = program.next_mem;

    let new_procedures: Vec<Vec<Instr>> = program
        .procedures
        .iter()
        .map(|(_, body)| rewrite_body(body, spilled, slot, &mut next_vreg))
        .collect();
    let new_main = rewrite_body(&program.main, spilled, slot, &mut next_vreg);

    let mut out = program.with_bodies(new_procedures, new_main);
    out.next_vreg = next_vreg;
    out.next_mem = slot + 1;
    out
}

fn fresh_vreg(next_vreg: &mut u32) -> VReg {
    let v = VReg(*next_vreg);
    *next_vreg += 1;
    v
}

/// Spilling a call site's return-address vreg inserts this save/restore
/// glue between the `Strk` and the `Jump{callee}` that follows it; `Jump`
/// carries no vreg operand so it is never itself rewritten, which is what
/// lets `cfg::compute_call_floors` keep finding the call site afterward.
fn rewrite_body(body: &[Instr], spilled: VReg, slot: i64, next_vreg: &mut u32) -> Vec<Instr> {
    let mut out = Vec::with_capacity(body.len());
    for instr in body {
        if instr.operand() != Some(spilled) {
            out.push(instr.clone());
            continue;
        }

        let addr = fresh_vreg(next_vreg);
        let value = fresh_vreg(next_vreg);
        let reads = instr.reads().contains(&spilled);
        let writes = instr.writes().contains(&spilled);

        if reads {
            let scratch = fresh_vreg(next_vreg);
            out.push(Instr::Put(scratch));
            materialize_constant(&mut out, addr, slot as u64);
            out.push(Instr::Load(addr));
            out.push(Instr::Put(value));
            out.push(Instr::Get(scratch));
        } else {
            materialize_constant(&mut out, addr, slot as u64);
        }

        let mut rewritten = instr.clone();
        rewritten.set_operand(value);
        out.push(rewritten);

        if writes {
            let scratch = fresh_vreg(next_vreg);
            out.push(Instr::Put(scratch));
            out.push(Instr::Get(value));
            out.push(Instr::Store(addr));
            out.push(Instr::Get(scratch));
        }
    }
    out
}

/// Binary decomposition identical to `middle::lower`'s constant
/// materialization (kept here, rather than shared, since the spill rewrite
/// only ever needs this one shape and the two call sites differ in what
/// they thread through).
fn materialize_constant(out: &mut Vec<Instr>, r: VReg, n: u64) {
    out.push(Instr::Rst(r));
    if n == 0 {
        return;
    }
    let top = 63 - n.leading_zeros();
    out.push(Instr::Inc(r));
    for i in (0..top).rev() {
        out.push(Instr::Shl(r));
        if (n >> i) & 1 == 1 {
            out.push(Instr::Inc(r));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::middle::lower::lower;

    fn allocate_src(src: &str) -> Allocation {
        let ast = parse(src).expect("parses");
        let lir = lower(&ast).expect("lowers");
        allocate(lir).expect("allocates")
    }

    #[test]
    fn accumulator_is_always_register_a() {
        let alloc = allocate_src("PROGRAM IS a IN a := 1; WRITE a; END");
        assert_eq!(alloc.colors[&VReg::ACC], PhysReg::A);
    }

    #[test]
    fn every_vreg_gets_a_distinct_color_from_its_neighbours() {
        let alloc = allocate_src(
            "PROGRAM IS a, b, c, d, e, f, g, h, i IN \
             a := 1; b := 2; c := 3; d := 4; e := 5; f := 6; g := 7; h := 8; i := 9; \
             WRITE a; WRITE b; WRITE c; WRITE d; WRITE e; WRITE f; WRITE g; WRITE h; WRITE i; \
             END",
        );
        // Just needs to converge (possibly with spills) and color every
        // vreg actually used by the final, post-spill LIR.
        let cfg = Cfg::build(&alloc.program);
        let graph = InterferenceGraph::build(&cfg);
        for v in &graph.nodes {
            assert!(alloc.colors.contains_key(v));
        }
    }

    #[test]
    fn heavy_register_pressure_still_colors_via_spilling() {
        // 20 live-at-once scalars comfortably exceed 7 colorable registers.
        let decls: Vec<String> = (0..20).map(|i| format!("v{i}")).collect();
        let assigns: String = decls.iter().enumerate().map(|(i, n)| format!("{n} := {i};")).collect();
        let writes: String = decls.iter().map(|n| format!("WRITE {n};")).collect();
        let src = format!("PROGRAM IS {} IN {assigns} {writes} END", decls.join(", "));
        let alloc = allocate_src(&src);
        assert_eq!(alloc.colors[&VReg::ACC], PhysReg::A);
    }

    #[test]
    fn call_keeps_return_address_live_and_colorable() {
        let alloc = allocate_src(
            "PROCEDURE p(x) IS IN x := x + 1; END \
             PROGRAM IS a IN a := 1; p(a); WRITE a; END",
        );
        assert_eq!(alloc.colors[&VReg::ACC], PhysReg::A);
    }
}
