//! Control-flow graph construction and liveness analysis.
//!
//! The CFG is an arena of blocks indexed by `usize` (no `Rc`/`RefCell`), the
//! same way a `std::vector<Block>` plus integer successor ids would be laid
//! out. It is rebuilt from scratch after every spill (see
//! `middle::regalloc`).

use std::collections::HashMap;

use crate::common::{Id, Map, Set};
use crate::middle::lir::{Instr, Program, VReg};

pub type BlockId = usize;

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    /// Index into the flattened instruction stream this block's first
    /// instruction occupies; used only to test whether a block lies inside
    /// a given procedure's address range.
    pub start_addr: usize,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub live_in: Set<VReg>,
    pub live_out: Set<VReg>,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
}

impl Cfg {
    /// Build the whole-program CFG: one arena spanning the leading
    /// `Jump{"MAIN"}`, every procedure body, and the main block, so that
    /// call edges (`Jump{callee}`) and liveness both flow naturally across
    /// procedure boundaries.
    pub fn build(program: &Program) -> Cfg {
        let flat = program.flatten();
        let mut cfg = Cfg { blocks: split_blocks(&flat) };
        let label_to_block = label_index(&cfg.blocks);
        connect_edges(&mut cfg.blocks, &label_to_block);

        // First pass: ordinary liveness over the real edges, ignoring calls.
        solve_liveness(&mut cfg.blocks, &Map::new());

        // `Jumpr`'s real successors (the blocks following every call site)
        // are deliberately left unconnected above, so nothing a callee does
        // with a caller-side temporary propagates backward through the call.
        // Rather than discover those edges, compute, per called procedure,
        // the union of what's live going into every one of its call sites'
        // resume blocks, plus its own return-address vreg, and force that
        // set live across the whole callee body, covering not just the
        // return-address vreg but every vreg a caller needs to survive the
        // callee untouched.
        let ranges = procedure_ranges(program, &flat);
        let floors = compute_call_floors(&cfg, &ranges);
        solve_liveness(&mut cfg.blocks, &floors);

        cfg
    }
}

fn split_blocks(flat: &[Instr]) -> Vec<Block> {
    let mut starts: Set<usize> = Set::new();
    starts.insert(0);
    for (i, instr) in flat.iter().enumerate() {
        if matches!(instr, Instr::Label(_)) {
            starts.insert(i);
        }
        if instr.ends_block() && i + 1 < flat.len() {
            starts.insert(i + 1);
        }
    }
    let starts: Vec<usize> = starts.into_iter().collect();

    let mut blocks = Vec::new();
    for (bi, &start) in starts.iter().enumerate() {
        let end = starts.get(bi + 1).copied().unwrap_or(flat.len());
        if start >= end {
            continue; // empty blocks are discarded
        }
        blocks.push(Block {
            id: blocks.len(),
            instrs: flat[start..end].to_vec(),
            start_addr: start,
            preds: Vec::new(),
            succs: Vec::new(),
            live_in: Set::new(),
            live_out: Set::new(),
        });
    }
    blocks
}

fn label_index(blocks: &[Block]) -> HashMap<Id, BlockId> {
    let mut map = HashMap::new();
    for block in blocks {
        if let Some(Instr::Label(name)) = block.instrs.first() {
            map.insert(*name, block.id);
        }
    }
    map
}

fn connect_edges(blocks: &mut [Block], label_to_block: &HashMap<Id, BlockId>) {
    let n = blocks.len();
    let mut edges: Vec<(BlockId, BlockId)> = Vec::new();
    for block in blocks.iter() {
        let next = if block.id + 1 < n { Some(block.id + 1) } else { None };
        match block.instrs.last() {
            Some(Instr::Jump(label)) => {
                if let Some(&target) = label_to_block.get(label) {
                    edges.push((block.id, target));
                }
            }
            Some(Instr::Jpos(label)) | Some(Instr::Jzero(label)) => {
                if let Some(&target) = label_to_block.get(label) {
                    edges.push((block.id, target));
                }
                if let Some(next) = next {
                    edges.push((block.id, next));
                }
            }
            // Left symbolic: see `compute_call_floors` for how the allocator
            // still gets a sound answer without real return edges.
            Some(Instr::Jumpr(_)) => {}
            Some(Instr::Halt) => {}
            _ => {
                if let Some(next) = next {
                    edges.push((block.id, next));
                }
            }
        }
    }
    for (from, to) in edges {
        blocks[from].succs.push(to);
        blocks[to].preds.push(from);
    }
}

fn read_overwrite(instrs: &[Instr]) -> (Set<VReg>, Set<VReg>) {
    let mut read = Set::new();
    let mut overwrite = Set::new();
    for instr in instrs {
        for r in instr.reads() {
            if !overwrite.contains(&r) {
                read.insert(r);
            }
        }
        for w in instr.writes() {
            overwrite.insert(w);
        }
    }
    (read, overwrite)
}

/// Iterative live-in/live-out fixpoint. `floor` gives each block an extra set
/// of vregs that are always considered live, regardless of what the normal
/// read/overwrite/successor computation would produce. Used to force a
/// callee's blocks to treat the caller's call-crossing vregs as live without
/// needing a real edge from the call site to the resume block.
fn solve_liveness(blocks: &mut [Block], floor: &Map<BlockId, Set<VReg>>) {
    let per_block: Vec<(Set<VReg>, Set<VReg>)> = blocks.iter().map(|b| read_overwrite(&b.instrs)).collect();
    for block in blocks.iter_mut() {
        block.live_in = Set::new();
        block.live_out = Set::new();
    }

    loop {
        let mut changed = false;
        for idx in (0..blocks.len()).rev() {
            let mut new_live_out: Set<VReg> = Set::new();
            for &succ in &blocks[idx].succs {
                new_live_out.extend(blocks[succ].live_in.iter().copied());
            }
            if let Some(f) = floor.get(&idx) {
                new_live_out.extend(f.iter().copied());
            }
            let (read, overwrite) = &per_block[idx];
            let mut new_live_in = read.clone();
            for v in new_live_out.difference(overwrite) {
                new_live_in.insert(*v);
            }
            if let Some(f) = floor.get(&idx) {
                new_live_in.extend(f.iter().copied());
            }

            if new_live_out != blocks[idx].live_out {
                blocks[idx].live_out = new_live_out;
                changed = true;
            }
            if new_live_in != blocks[idx].live_in {
                blocks[idx].live_in = new_live_in;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// For each procedure, the `[start, end)` half-open range of flattened
/// indices its body occupies, the vreg its trailing `Jumpr` reads, and its
/// name (used to match call sites back to the callee they target).
fn procedure_ranges(program: &Program, flat: &[Instr]) -> Vec<(usize, usize, VReg, Id)> {
    let mut ranges = Vec::new();
    let mut offset = 1; // flat[0] is the synthesized Jump{"MAIN"}
    for (name, body) in &program.procedures {
        let start = offset;
        let end = offset + body.len();
        if let Some(Instr::Jumpr(ret_vreg)) = flat.get(end - 1) {
            ranges.push((start, end, *ret_vreg, *name));
        }
        offset = end;
    }
    ranges
}

/// Scan every block for a trailing `Jump{callee}` targeting a known
/// procedure's entry label, and for each callee accumulate what must stay
/// live across its body: the return-address vreg, plus whatever the resume
/// block (the block right after the call site) needs as live-in. That
/// resume-block value is self-contained (it never depends on the callee), so
/// the ordinary liveness pass already computed it correctly before this
/// function runs.
///
/// A call site is identified purely by its trailing `Jump{callee}` matching
/// a name in `ranges`, never by the `Strk` that normally precedes it: the
/// allocator's spill rewrite can split a spilled return-address vreg's
/// `Strk` away from the `Jump` with save/restore glue (see
/// `regalloc::rewrite_body`), and `Jump` itself carries no vreg operand, so
/// it is never touched by that rewrite and stays the reliable anchor.
fn compute_call_floors(cfg: &Cfg, ranges: &[(usize, usize, VReg, Id)]) -> Map<BlockId, Set<VReg>> {
    let start_addr_to_block: HashMap<usize, BlockId> = cfg.blocks.iter().map(|b| (b.start_addr, b.id)).collect();
    let mut forced_by_proc: HashMap<Id, Set<VReg>> = HashMap::new();

    for block in &cfg.blocks {
        let Some(Instr::Jump(label)) = block.instrs.last() else { continue };
        let Some((_, _, ret_vreg, name)) = ranges.iter().find(|(_, _, _, n)| n == label) else { continue };

        let resume_addr = block.start_addr + block.instrs.len();
        if let Some(&resume_block) = start_addr_to_block.get(&resume_addr) {
            let entry = forced_by_proc.entry(*name).or_default();
            entry.extend(cfg.blocks[resume_block].live_in.iter().copied());
            entry.insert(*ret_vreg);
        }
    }

    let mut floors: Map<BlockId, Set<VReg>> = Map::new();
    for (start, end, _, name) in ranges {
        let Some(forced) = forced_by_proc.get(name) else { continue };
        for block in &cfg.blocks {
            if block.start_addr >= *start && block.start_addr < *end {
                floors.entry(block.id).or_default().extend(forced.iter().copied());
            }
        }
    }
    floors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Id;

    fn id(s: &str) -> Id {
        Id::new(s.to_string())
    }

    #[test]
    fn splits_on_labels_and_jumps() {
        let flat = vec![
            Instr::Jump(id("MAIN")),
            Instr::Label(id("MAIN")),
            Instr::Rst(VReg(1)),
            Instr::Jzero(id("END")),
            Instr::Inc(VReg(1)),
            Instr::Label(id("END")),
            Instr::Halt,
        ];
        let blocks = split_blocks(&flat);
        // [Jump MAIN] | [Label MAIN, Rst, Jzero END] | [Inc] | [Label END, Halt]
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn conditional_jump_has_two_successors() {
        let flat = vec![
            Instr::Label(id("L")),
            Instr::Jzero(id("END")),
            Instr::Inc(VReg(1)),
            Instr::Label(id("END")),
            Instr::Halt,
        ];
        let mut blocks = split_blocks(&flat);
        let labels = label_index(&blocks);
        connect_edges(&mut blocks, &labels);
        assert_eq!(blocks[0].succs.len(), 2);
    }

    #[test]
    fn liveness_propagates_across_a_loop_back_edge() {
        let flat = vec![
            Instr::Label(id("LOOP")),
            Instr::Get(VReg(1)),
            Instr::Jzero(id("END")),
            Instr::Dec(VReg(1)),
            Instr::Jump(id("LOOP")),
            Instr::Label(id("END")),
            Instr::Halt,
        ];
        let mut blocks = split_blocks(&flat);
        let labels = label_index(&blocks);
        connect_edges(&mut blocks, &labels);
        solve_liveness(&mut blocks, &Map::new());
        assert!(blocks[0].live_in.contains(&VReg(1)));
    }

    #[test]
    fn call_forces_return_vreg_live_across_callee() {
        // A synthetic flattened stream shaped like `Program::flatten()`'s
        // output: leading Jump{MAIN}, then procedure `p`'s body, then main.
        let flat = vec![
            Instr::Jump(id("MAIN")),
            Instr::Label(id("p")),
            Instr::Get(VReg(2)),
            Instr::Put(VReg(2)),
            Instr::Jumpr(VReg(1)),
            Instr::Label(id("MAIN")),
            Instr::Strk(VReg(1)),
            Instr::Jump(id("p")),
            Instr::Halt,
        ];
        let mut blocks = split_blocks(&flat);
        let labels = label_index(&blocks);
        connect_edges(&mut blocks, &labels);
        solve_liveness(&mut blocks, &Map::new());

        let program = Program {
            procedures: vec![(
                id("p"),
                vec![Instr::Label(id("p")), Instr::Get(VReg(2)), Instr::Put(VReg(2)), Instr::Jumpr(VReg(1))],
            )],
            main: vec![Instr::Label(id("MAIN")), Instr::Strk(VReg(1)), Instr::Jump(id("p")), Instr::Halt],
            ..Default::default()
        };
        let ranges = procedure_ranges(&program, &flat);
        let cfg = Cfg { blocks };
        let floors = compute_call_floors(&cfg, &ranges);
        let forced: Set<VReg> = floors.values().flat_map(|s| s.iter().copied()).collect();
        assert!(forced.contains(&VReg(1)));
    }

    #[test]
    fn call_floor_survives_return_vreg_spill_glue_between_strk_and_jump() {
        // Shaped like `regalloc::rewrite_body`'s output when the
        // return-address vreg itself gets spilled: the `Strk` that used to
        // sit directly before `Jump{p}` is now followed by a save/restore
        // sequence through a fresh memory slot, so the call site's
        // second-to-last instruction is `Get(scratch)`, not `Strk`.
        let flat = vec![
            Instr::Jump(id("MAIN")),
            Instr::Label(id("p")),
            Instr::Get(VReg(2)),
            Instr::Put(VReg(2)),
            Instr::Jumpr(VReg(1)),
            Instr::Label(id("MAIN")),
            Instr::Strk(VReg(3)),
            Instr::Put(VReg(4)),
            Instr::Get(VReg(3)),
            Instr::Store(VReg(5)),
            Instr::Get(VReg(4)),
            Instr::Jump(id("p")),
            Instr::Halt,
        ];
        let mut blocks = split_blocks(&flat);
        let labels = label_index(&blocks);
        connect_edges(&mut blocks, &labels);
        solve_liveness(&mut blocks, &Map::new());

        let program = Program {
            procedures: vec![(
                id("p"),
                vec![Instr::Label(id("p")), Instr::Get(VReg(2)), Instr::Put(VReg(2)), Instr::Jumpr(VReg(1))],
            )],
            main: vec![
                Instr::Label(id("MAIN")),
                Instr::Strk(VReg(3)),
                Instr::Put(VReg(4)),
                Instr::Get(VReg(3)),
                Instr::Store(VReg(5)),
                Instr::Get(VReg(4)),
                Instr::Jump(id("p")),
                Instr::Halt,
            ],
            ..Default::default()
        };
        let ranges = procedure_ranges(&program, &flat);
        let cfg = Cfg { blocks };
        let floors = compute_call_floors(&cfg, &ranges);
        // The callee's own range (the `p` label's block) must have a floor
        // forcing its return-address vreg (1) live, exactly as when no
        // spill glue separates `Strk` from `Jump`.
        let callee_block = cfg.blocks.iter().find(|b| matches!(b.instrs.first(), Some(Instr::Label(n)) if *n == id("p"))).unwrap();
        assert!(floors.get(&callee_block.id).is_some_and(|f| f.contains(&VReg(1))));
    }
}
