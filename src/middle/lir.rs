//! The low-level IR (LIR): VM-like instructions over an unbounded virtual
//! register space. Produced once by `middle::lower`, mutated in place by
//! `middle::regalloc`'s spill handler (which restarts CFG construction after
//! every rewrite), and finally translated by `back::asm`.
//!
//! There is only one IR tier in this compiler; earlier drafts of this module
//! used the name `tir`, but the pipeline has nothing between the AST and
//! this representation, so it is simply the LIR.

use std::fmt;

use crate::common::Id;

/// A virtual register. Vreg 0 is the distinguished accumulator and is
/// pre-bound to physical register A by the allocator; every arithmetic and
/// I/O primitive reads or writes it implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VReg(pub u32);

impl VReg {
    pub const ACC: VReg = VReg(0);

    pub fn is_acc(self) -> bool {
        self == VReg::ACC
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A symbolic jump target, resolved to a concrete instruction address by
/// `back::asm`. Interned like any other identifier since labels are
/// generated and compared frequently during emission.
pub type Label = Id;

/// A primitive VM operation, parameterized by virtual register or label.
/// See `back::asm` for how each variant becomes a `Line` and `vm` for how
/// each is executed.
#[derive(Debug, Clone)]
pub enum Instr {
    Read,
    Write,
    Load(VReg),
    Store(VReg),
    Add(VReg),
    Sub(VReg),
    Get(VReg),
    Put(VReg),
    Rst(VReg),
    Inc(VReg),
    Dec(VReg),
    Shl(VReg),
    Shr(VReg),
    Jump(Label),
    Jpos(Label),
    Jzero(Label),
    /// Stores the return address into `VReg` (see `vm` for the exact
    /// addressing convention).
    Strk(VReg),
    /// Jumps to the address recorded by a matching `Strk`.
    Jumpr(VReg),
    Label(Label),
    Halt,
}

impl Instr {
    /// Vregs this instruction reads, per its fixed per-opcode table.
    pub fn reads(&self) -> Vec<VReg> {
        use Instr::*;
        match self {
            Store(r) | Add(r) | Sub(r) => vec![VReg::ACC, *r],
            Write | Put(_) => vec![VReg::ACC],
            Load(r) | Get(r) => vec![*r],
            Inc(r) | Dec(r) | Shl(r) | Shr(r) => vec![*r],
            Jumpr(r) => vec![*r],
            Read | Rst(_) | Strk(_) | Jump(_) | Jpos(_) | Jzero(_) | Label(_) | Halt => Vec::new(),
        }
    }

    /// Vregs this instruction overwrites.
    pub fn writes(&self) -> Vec<VReg> {
        use Instr::*;
        match self {
            Read | Load(_) | Get(_) => vec![VReg::ACC],
            Put(r) | Rst(r) | Inc(r) | Dec(r) | Shl(r) | Shr(r) | Strk(r) => vec![*r],
            Write | Store(_) | Add(_) | Sub(_) | Jump(_) | Jpos(_) | Jzero(_) | Jumpr(_) | Label(_) | Halt => {
                Vec::new()
            }
        }
    }

    /// Every vreg operand this instruction mentions (read or write), used by
    /// the spill rewrite to detect whether it touches the spilled vreg.
    pub fn operand(&self) -> Option<VReg> {
        use Instr::*;
        match self {
            Load(r) | Store(r) | Add(r) | Sub(r) | Get(r) | Put(r) | Rst(r) | Inc(r) | Dec(r) | Shl(r) | Shr(r)
            | Strk(r) | Jumpr(r) => Some(*r),
            Read | Write | Jump(_) | Jpos(_) | Jzero(_) | Label(_) | Halt => None,
        }
    }

    /// Replace this instruction's vreg operand in place, if it has one.
    pub fn set_operand(&mut self, new: VReg) {
        use Instr::*;
        match self {
            Load(r) | Store(r) | Add(r) | Sub(r) | Get(r) | Put(r) | Rst(r) | Inc(r) | Dec(r) | Shl(r) | Shr(r)
            | Strk(r) | Jumpr(r) => *r = new,
            Read | Write | Jump(_) | Jpos(_) | Jzero(_) | Label(_) | Halt => {}
        }
    }

    /// A block ends right after one of these.
    pub fn ends_block(&self) -> bool {
        matches!(self, Instr::Jump(_) | Instr::Jpos(_) | Instr::Jzero(_) | Instr::Jumpr(_) | Instr::Halt)
    }
}

/// A procedure's or main block's emitted code, keyed by name (`"MAIN"` for
/// the top-level block) so the allocator's spill handler can rebuild the CFG
/// per-procedure without losing scope boundaries.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Declaration order, not alphabetical: determinism only requires that
    /// identical input produce identical output, and preserving source
    /// order keeps the assembly readable.
    pub procedures: Vec<(Id, Vec<Instr>)>,
    pub main: Vec<Instr>,
    /// One past the highest vreg id `middle::lower` allocated. The spill
    /// handler uses this as the low-water mark for vregs it mints itself,
    /// so spill rewrites never collide with a "real" vreg.
    pub next_vreg: u32,
    /// One past the highest memory address `middle::lower` handed out to a
    /// declared variable or array. The spill handler allocates spill slots
    /// starting here, for the same reason.
    pub next_mem: i64,
}

impl Program {
    pub const MAIN_LABEL: &'static str = "MAIN";

    /// Flatten into one instruction stream in final emission order: a
    /// leading `Jump{"MAIN"}`, then each procedure body, then the main
    /// block (which already carries its own `Label{"MAIN"}` and `Halt`).
    pub fn flatten(&self) -> Vec<Instr> {
        let mut out = Vec::with_capacity(1 + self.procedures.iter().map(|(_, b)| b.len()).sum::<usize>() + self.main.len());
        out.push(Instr::Jump(Id::new(Self::MAIN_LABEL.to_string())));
        for (_, body) in &self.procedures {
            out.extend(body.iter().cloned());
        }
        out.extend(self.main.iter().cloned());
        out
    }

    /// Rebuild from a flattened stream plus the original procedure name
    /// boundaries, after a pass (e.g. spill rewriting) has mutated
    /// instructions in place without changing their count per segment.
    pub fn with_bodies(&self, mut new_procedures: Vec<Vec<Instr>>, new_main: Vec<Instr>) -> Program {
        assert_eq!(new_procedures.len(), self.procedures.len());
        let procedures = self
            .procedures
            .iter()
            .map(|(name, _)| (*name, new_procedures.remove(0)))
            .collect();
        Program { procedures, main: new_main, next_vreg: self.next_vreg, next_mem: self.next_mem }
    }
}
