//! The LIR emitter: walks the AST once and produces a `lir::Program`.
//!
//! Two passes over procedures, mirroring `front::analyze`: first every
//! procedure's signature (a return-address vreg plus one pointer vreg per
//! parameter) is allocated, so that forward-referenced calls resolve;
//! then each body is actually lowered. Scratch state (vreg/label/memory
//! counters, the error list) lives in one `Ctx` threaded by `&mut`.

use crate::common::{Diagnostic, Id, Loc, Map, Stage};
use crate::front::ast::{
    Arg as AstArg, BOp, BinaryExpression, Command, Condition, Context, Declaration, Expr, Identifier, Index,
    Procedure, Program as AstProgram, RelOp, Value,
};
use crate::middle::lir::{Instr, Label, Program as LirProgram, VReg};

/// Lower a whole program to LIR, or report the errors accumulated along the
/// way. Mirrors `front::analyze`'s "collect everything, then decide"
/// contract: a non-empty error list means later stages must not run.
pub fn lower(program: &AstProgram) -> Result<LirProgram, Vec<Diagnostic>> {
    let mut ctx = Ctx::new();
    let sigs = collect_signatures(&mut ctx, program);

    let mut procedures = Vec::with_capacity(program.procedures.len());
    for proc in &program.procedures {
        procedures.push((proc.name, lower_procedure(&mut ctx, proc, &sigs)));
    }
    let main = lower_main(&mut ctx, &program.main, &sigs);

    if !ctx.errors.is_empty() {
        return Err(ctx.errors);
    }
    Ok(LirProgram { procedures, main, next_vreg: ctx.next_vreg, next_mem: ctx.next_mem })
}

struct Ctx {
    next_vreg: u32,
    next_label: u32,
    next_mem: i64,
    errors: Vec<Diagnostic>,
}

impl Ctx {
    fn new() -> Self {
        // vreg 0 is the accumulator; real allocation starts at 1.
        Ctx { next_vreg: 1, next_label: 0, next_mem: 0, errors: Vec::new() }
    }

    fn fresh_vreg(&mut self) -> VReg {
        let v = VReg(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    fn fresh_label(&mut self, hint: &str) -> Label {
        let l = Id::new(format!("L{}_{hint}", self.next_label));
        self.next_label += 1;
        l
    }

    fn alloc_mem(&mut self, size: u64) -> i64 {
        let addr = self.next_mem;
        self.next_mem += size.max(1) as i64;
        addr
    }

    fn error(&mut self, loc: Loc, message: impl Into<String>) {
        self.errors.push(Diagnostic::error(Stage::Emission, loc, message));
    }
}

#[derive(Debug, Clone, Copy)]
struct ParamInfo {
    vreg: VReg,
    is_array: bool,
}

#[derive(Clone)]
struct ProcSig {
    ret_vreg: VReg,
    params: Vec<ParamInfo>,
}

/// One entry of the variable resolution table, scoped to the procedure
/// (or main block) currently being lowered.
///
/// - Procedure parameters (`is_pointer = true`): `vreg` holds the caller's
///   address; scalars read via `Load`, write via `Store`; arrays compute an
///   offset from the pointer.
/// - Local scalars: live directly in `vreg` (`Get`/`Put`); `mem_base` is a
///   shadow memory slot, used only to round-trip the value through memory
///   when the scalar is passed by reference to a call (see `lower_call`).
/// - Local arrays: always memory-resident at `mem_base`; `vreg` is unused.
#[derive(Debug, Clone, Copy)]
struct ResolvedVar {
    vreg: Option<VReg>,
    is_pointer: bool,
    is_array: bool,
    mem_base: Option<i64>,
}

fn collect_signatures(ctx: &mut Ctx, program: &AstProgram) -> Map<Id, ProcSig> {
    let mut sigs = Map::new();
    for proc in &program.procedures {
        let ret_vreg = ctx.fresh_vreg();
        let params = proc.args.iter().map(|a: &AstArg| ParamInfo { vreg: ctx.fresh_vreg(), is_array: a.is_array }).collect();
        sigs.insert(proc.name, ProcSig { ret_vreg, params });
    }
    sigs
}

fn lower_procedure(ctx: &mut Ctx, proc: &Procedure, sigs: &Map<Id, ProcSig>) -> Vec<Instr> {
    let sig = sigs.get(&proc.name).expect("signature collected in the first pass").clone();
    let mut scope: Map<Id, ResolvedVar> = Map::new();
    for (arg, param) in proc.args.iter().zip(sig.params.iter()) {
        scope.insert(arg.name, ResolvedVar { vreg: Some(param.vreg), is_pointer: true, is_array: arg.is_array, mem_base: None });
    }

    let mut out = vec![Instr::Label(proc.name)];
    {
        let mut emitter = Emitter { ctx, sigs, out: &mut out };
        emitter.lower_context(&proc.context, &mut scope);
    }
    out.push(Instr::Jumpr(sig.ret_vreg));
    out
}

fn lower_main(ctx: &mut Ctx, main: &Context, sigs: &Map<Id, ProcSig>) -> Vec<Instr> {
    let mut out = vec![Instr::Label(Id::new(LirProgram::MAIN_LABEL.to_string()))];
    let mut scope: Map<Id, ResolvedVar> = Map::new();
    {
        let mut emitter = Emitter { ctx, sigs, out: &mut out };
        emitter.lower_context(main, &mut scope);
    }
    out.push(Instr::Halt);
    out
}

struct Emitter<'a> {
    ctx: &'a mut Ctx,
    sigs: &'a Map<Id, ProcSig>,
    out: &'a mut Vec<Instr>,
}

impl<'a> Emitter<'a> {
    fn push(&mut self, instr: Instr) {
        self.out.push(instr);
    }

    fn resolve(&mut self, scope: &Map<Id, ResolvedVar>, name: Id, loc: Loc) -> ResolvedVar {
        match scope.get(&name) {
            Some(v) => *v,
            None => {
                // Semantic analysis should already have rejected this
                // program; recover best-effort so emission can keep
                // collecting errors instead of panicking.
                self.ctx.error(loc, format!("unknown variable `{name}`"));
                ResolvedVar { vreg: Some(VReg::ACC), is_pointer: false, is_array: false, mem_base: None }
            }
        }
    }

    fn lower_context(&mut self, context: &Context, scope: &mut Map<Id, ResolvedVar>) {
        for decl in &context.declarations {
            self.declare(decl, scope);
        }
        self.lower_commands(&context.commands, scope);
    }

    fn declare(&mut self, decl: &Declaration, scope: &mut Map<Id, ResolvedVar>) {
        let var = match decl.array_size {
            Some(size) => {
                let base = self.ctx.alloc_mem(size);
                ResolvedVar { vreg: None, is_pointer: false, is_array: true, mem_base: Some(base) }
            }
            None => {
                let vreg = self.ctx.fresh_vreg();
                let base = self.ctx.alloc_mem(1);
                ResolvedVar { vreg: Some(vreg), is_pointer: false, is_array: false, mem_base: Some(base) }
            }
        };
        scope.insert(decl.name, var);
    }

    fn lower_commands(&mut self, commands: &[Command], scope: &Map<Id, ResolvedVar>) {
        for command in commands {
            self.lower_command(command, scope);
        }
    }

    fn lower_command(&mut self, command: &Command, scope: &Map<Id, ResolvedVar>) {
        match command {
            Command::Assign { target, expr } => {
                self.lower_expr(expr, scope);
                self.store_identifier(target, scope);
            }
            Command::Read(target) => {
                self.push(Instr::Read);
                self.store_identifier(target, scope);
            }
            Command::Write(value) => {
                self.load_value(value, scope);
                self.push(Instr::Write);
            }
            Command::If { cond, then_branch, else_branch } => {
                self.lower_if(cond, then_branch, else_branch.as_deref(), scope)
            }
            Command::While { cond, body } => self.lower_while(cond, body, scope),
            Command::Repeat { body, cond } => self.lower_repeat(body, cond, scope),
            Command::Call { name, name_loc, args } => self.lower_call(*name, *name_loc, args, scope),
            Command::InlinedProcedure(body) => self.lower_commands(body, scope),
        }
    }

    // --- values, identifiers, arrays -------------------------------------

    fn load_value(&mut self, value: &Value, scope: &Map<Id, ResolvedVar>) {
        match value {
            Value::Num(n) => {
                let tmp = self.ctx.fresh_vreg();
                self.materialize_constant(tmp, *n);
                self.push(Instr::Get(tmp));
            }
            Value::Id(id) => self.load_identifier(id, scope),
        }
    }

    fn load_value_into_vreg(&mut self, value: &Value, scope: &Map<Id, ResolvedVar>, target: VReg) {
        self.load_value(value, scope);
        self.push(Instr::Put(target));
    }

    fn load_identifier(&mut self, id: &Identifier, scope: &Map<Id, ResolvedVar>) {
        let var = self.resolve(scope, id.name, id.loc);
        match (&id.index, var.is_array) {
            (None, false) => {
                if var.is_pointer {
                    self.push(Instr::Load(var.vreg.unwrap()));
                } else {
                    self.push(Instr::Get(var.vreg.unwrap()));
                }
            }
            (Some(index), true) => {
                let addr = self.compute_array_address(&var, index, scope);
                self.push(Instr::Load(addr));
            }
            // A kind mismatch here means semantic analysis didn't run or was
            // bypassed; fall back to whatever access shape we can still make
            // sense of so emission doesn't panic.
            (None, true) => {
                if let Some(v) = var.vreg {
                    self.push(Instr::Get(v));
                }
            }
            (Some(_), false) => {
                if let Some(v) = var.vreg {
                    self.push(Instr::Get(v));
                }
            }
        }
    }

    fn store_identifier(&mut self, id: &Identifier, scope: &Map<Id, ResolvedVar>) {
        let var = self.resolve(scope, id.name, id.loc);
        match (&id.index, var.is_array) {
            (None, false) => {
                if var.is_pointer {
                    self.push(Instr::Store(var.vreg.unwrap()));
                } else {
                    self.push(Instr::Put(var.vreg.unwrap()));
                }
            }
            (Some(index), true) => {
                let addr = self.compute_array_address(&var, index, scope);
                self.push(Instr::Store(addr));
            }
            (None, true) => {
                if let Some(v) = var.vreg {
                    self.push(Instr::Put(v));
                }
            }
            (Some(_), false) => {
                if let Some(v) = var.vreg {
                    self.push(Instr::Put(v));
                }
            }
        }
    }

    /// Computes the final memory address for `arr[index]` into a fresh vreg,
    /// for use as the next `Load`/`Store`'s MAR. Handles all four
    /// combinations of (local array vs. by-reference array parameter) x
    /// (literal vs. variable index).
    fn compute_array_address(&mut self, arr: &ResolvedVar, index: &Index, scope: &Map<Id, ResolvedVar>) -> VReg {
        let addr = self.ctx.fresh_vreg();
        match index {
            Index::Literal(i) => {
                if arr.is_pointer {
                    let offset = self.ctx.fresh_vreg();
                    self.materialize_constant(offset, *i);
                    self.push(Instr::Get(arr.vreg.unwrap()));
                    self.push(Instr::Add(offset));
                    self.push(Instr::Put(addr));
                } else {
                    let literal_addr = arr.mem_base.unwrap() as u64 + *i;
                    self.materialize_constant(addr, literal_addr);
                }
            }
            Index::Variable(idx_name) => {
                // Array indices are always plain scalars per the grammar.
                let idx_var = self.resolve(scope, *idx_name, Loc::default());
                let idx_vreg = self.ctx.fresh_vreg();
                if idx_var.is_pointer {
                    self.push(Instr::Load(idx_var.vreg.unwrap()));
                } else {
                    self.push(Instr::Get(idx_var.vreg.unwrap()));
                }
                self.push(Instr::Put(idx_vreg));

                if arr.is_pointer {
                    self.push(Instr::Get(arr.vreg.unwrap()));
                    self.push(Instr::Add(idx_vreg));
                    self.push(Instr::Put(addr));
                } else {
                    let base_vreg = self.ctx.fresh_vreg();
                    self.materialize_constant(base_vreg, arr.mem_base.unwrap() as u64);
                    self.push(Instr::Get(idx_vreg));
                    self.push(Instr::Add(base_vreg));
                    self.push(Instr::Put(addr));
                }
            }
        }
        addr
    }

    /// Binary decomposition, MSB-first: `Rst{r}`, then one `Inc` for the
    /// (always-set) top bit, then `Shl` (+ `Inc` if the bit is set) per
    /// remaining bit. O(log N) primitives, never unary.
    fn materialize_constant(&mut self, r: VReg, n: u64) {
        self.push(Instr::Rst(r));
        if n == 0 {
            return;
        }
        let top = 63 - n.leading_zeros();
        self.push(Instr::Inc(r));
        for i in (0..top).rev() {
            self.push(Instr::Shl(r));
            if (n >> i) & 1 == 1 {
                self.push(Instr::Inc(r));
            }
        }
    }

    // --- expressions ------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr, scope: &Map<Id, ResolvedVar>) {
        match expr {
            Expr::Value(value) => self.load_value(value, scope),
            Expr::Binary(binary) => self.lower_binary(binary, scope),
        }
    }

    fn lower_binary(&mut self, binary: &BinaryExpression, scope: &Map<Id, ResolvedVar>) {
        match binary.op {
            BOp::Add => {
                let c = self.ctx.fresh_vreg();
                self.load_value_into_vreg(&binary.rhs, scope, c);
                self.load_value(&binary.lhs, scope);
                self.push(Instr::Add(c));
            }
            BOp::Sub => {
                let c = self.ctx.fresh_vreg();
                self.load_value_into_vreg(&binary.rhs, scope, c);
                self.load_value(&binary.lhs, scope);
                self.push(Instr::Sub(c));
            }
            BOp::Mul => self.lower_mul(&binary.lhs, &binary.rhs, scope),
            BOp::Div => self.lower_divmod(&binary.lhs, &binary.rhs, scope, false),
            BOp::Mod => self.lower_divmod(&binary.lhs, &binary.rhs, scope, true),
        }
    }

    /// Shift-and-add multiplication: walk the multiplier's bits from the
    /// bottom, doubling the multiplicand and halving the multiplier each
    /// round, accumulating the multiplicand into the result whenever the
    /// current multiplier bit is odd.
    fn lower_mul(&mut self, lhs: &Value, rhs: &Value, scope: &Map<Id, ResolvedVar>) {
        let result = self.ctx.fresh_vreg();
        let mcand = self.ctx.fresh_vreg();
        let mplier = self.ctx.fresh_vreg();
        let half = self.ctx.fresh_vreg();
        let doubled = self.ctx.fresh_vreg();

        self.push(Instr::Rst(result));
        self.load_value_into_vreg(lhs, scope, mcand);
        self.load_value_into_vreg(rhs, scope, mplier);

        let head = self.ctx.fresh_label("mul_head");
        let end = self.ctx.fresh_label("mul_end");
        let even = self.ctx.fresh_label("mul_even");

        self.push(Instr::Label(head));
        self.push(Instr::Get(mplier));
        self.push(Instr::Jzero(end));

        // Odd test: mplier - 2*(mplier/2) is 0 for even, 1 for odd.
        self.push(Instr::Get(mplier));
        self.push(Instr::Put(half));
        self.push(Instr::Shr(half));
        self.push(Instr::Get(half));
        self.push(Instr::Put(doubled));
        self.push(Instr::Shl(doubled));
        self.push(Instr::Get(mplier));
        self.push(Instr::Sub(doubled));
        self.push(Instr::Jzero(even));

        self.push(Instr::Get(result));
        self.push(Instr::Add(mcand));
        self.push(Instr::Put(result));

        self.push(Instr::Label(even));
        self.push(Instr::Shl(mcand));
        self.push(Instr::Shr(mplier));
        self.push(Instr::Jump(head));

        self.push(Instr::Label(end));
        self.push(Instr::Get(result));
    }

    /// Restoring binary long division. The number of bits to restore is not
    /// hard-coded: a first runtime loop doubles `shifted` (starting from the
    /// divisor) only while `2*shifted <= dividend`, gated by a saturating
    /// subtract (`shifted <= dividend - shifted`) rather than by computing
    /// `shifted*2` and checking afterwards, so `shifted` never grows past
    /// `dividend` and can't overflow the VM's 64-bit registers regardless of
    /// operand size. The restoring loop then runs exactly that many rounds
    /// (counted, not hard-coded) walking `shifted` back down. Guards
    /// division by zero by branching straight to quotient 0, remainder =
    /// dividend.
    fn lower_divmod(&mut self, lhs: &Value, rhs: &Value, scope: &Map<Id, ResolvedVar>, want_mod: bool) {
        let dividend = self.ctx.fresh_vreg();
        let divisor = self.ctx.fresh_vreg();
        let remainder = self.ctx.fresh_vreg();
        let shifted = self.ctx.fresh_vreg();
        let quotient = self.ctx.fresh_vreg();
        let shift_count = self.ctx.fresh_vreg();
        let probe = self.ctx.fresh_vreg();
        let remaining = self.ctx.fresh_vreg();

        self.load_value_into_vreg(lhs, scope, dividend);
        self.load_value_into_vreg(rhs, scope, divisor);

        let zero_divisor = self.ctx.fresh_label("div_zero");
        let done = self.ctx.fresh_label("div_done");

        self.push(Instr::Get(divisor));
        self.push(Instr::Jzero(zero_divisor));

        self.push(Instr::Get(dividend));
        self.push(Instr::Put(remainder));
        self.push(Instr::Rst(quotient));
        self.push(Instr::Get(divisor));
        self.push(Instr::Put(shifted));
        self.push(Instr::Rst(shift_count));

        let preshift_head = self.ctx.fresh_label("div_preshift");
        let can_double = self.ctx.fresh_label("div_can_double");
        let preshift_done = self.ctx.fresh_label("div_preshift_done");
        self.push(Instr::Label(preshift_head));
        // probe = max(0, dividend - shifted)
        self.push(Instr::Get(dividend));
        self.push(Instr::Sub(shifted));
        self.push(Instr::Put(probe));
        // shifted <= probe  <=>  max(0, shifted - probe) == 0  <=>  2*shifted <= dividend
        self.push(Instr::Get(shifted));
        self.push(Instr::Sub(probe));
        self.push(Instr::Jzero(can_double));
        self.push(Instr::Jump(preshift_done));
        self.push(Instr::Label(can_double));
        self.push(Instr::Shl(shifted));
        self.push(Instr::Inc(shift_count));
        self.push(Instr::Jump(preshift_head));
        self.push(Instr::Label(preshift_done));

        self.push(Instr::Get(shift_count));
        self.push(Instr::Put(remaining));
        self.push(Instr::Inc(remaining));

        let main_head = self.ctx.fresh_label("div_head");
        let main_done = self.ctx.fresh_label("div_main_done");
        self.push(Instr::Label(main_head));
        self.push(Instr::Get(remaining));
        self.push(Instr::Jzero(main_done));

        self.push(Instr::Shl(quotient));
        let do_sub = self.ctx.fresh_label("div_sub");
        let skip = self.ctx.fresh_label("div_skip");
        // shifted <= remainder  <=>  max(0, shifted - remainder) == 0
        self.push(Instr::Get(shifted));
        self.push(Instr::Sub(remainder));
        self.push(Instr::Jzero(do_sub));
        self.push(Instr::Jump(skip));
        self.push(Instr::Label(do_sub));
        self.push(Instr::Get(remainder));
        self.push(Instr::Sub(shifted));
        self.push(Instr::Put(remainder));
        self.push(Instr::Inc(quotient));
        self.push(Instr::Label(skip));
        self.push(Instr::Shr(shifted));
        self.push(Instr::Dec(remaining));
        self.push(Instr::Jump(main_head));
        self.push(Instr::Label(main_done));
        self.push(Instr::Jump(done));

        self.push(Instr::Label(zero_divisor));
        self.push(Instr::Get(dividend));
        self.push(Instr::Put(remainder));
        self.push(Instr::Rst(quotient));

        self.push(Instr::Label(done));
        if want_mod {
            self.push(Instr::Get(remainder));
        } else {
            self.push(Instr::Get(quotient));
        }
    }

    // --- conditions ---------------------------------------------------

    /// Sets A to `max(0, minuend - subtrahend)`.
    fn compute_diff(&mut self, minuend: &Value, subtrahend: &Value, scope: &Map<Id, ResolvedVar>) {
        let c = self.ctx.fresh_vreg();
        self.load_value_into_vreg(subtrahend, scope, c);
        self.load_value(minuend, scope);
        self.push(Instr::Sub(c));
    }

    /// Emits code that jumps to `true_label` when `cond` holds and to
    /// `false_label` otherwise, built entirely from one-sided saturating
    /// subtractions (`a<=b` <=> `a-b=0`, the rest composed from that and
    /// its swapped dual).
    fn lower_condition(&mut self, cond: &Condition, scope: &Map<Id, ResolvedVar>, true_label: Label, false_label: Label) {
        match cond.op {
            RelOp::Le => {
                self.compute_diff(&cond.lhs, &cond.rhs, scope);
                self.push(Instr::Jzero(true_label));
                self.push(Instr::Jump(false_label));
            }
            RelOp::Ge => {
                self.compute_diff(&cond.rhs, &cond.lhs, scope);
                self.push(Instr::Jzero(true_label));
                self.push(Instr::Jump(false_label));
            }
            RelOp::Eq => {
                let mid = self.ctx.fresh_label("eq_mid");
                self.compute_diff(&cond.lhs, &cond.rhs, scope);
                self.push(Instr::Jzero(mid));
                self.push(Instr::Jump(false_label));
                self.push(Instr::Label(mid));
                self.compute_diff(&cond.rhs, &cond.lhs, scope);
                self.push(Instr::Jzero(true_label));
                self.push(Instr::Jump(false_label));
            }
            RelOp::Ne => {
                let mid = self.ctx.fresh_label("ne_mid");
                self.compute_diff(&cond.lhs, &cond.rhs, scope);
                self.push(Instr::Jzero(mid));
                self.push(Instr::Jump(true_label));
                self.push(Instr::Label(mid));
                self.compute_diff(&cond.rhs, &cond.lhs, scope);
                self.push(Instr::Jzero(false_label));
                self.push(Instr::Jump(true_label));
            }
            RelOp::Lt => {
                let mid = self.ctx.fresh_label("lt_mid");
                self.compute_diff(&cond.lhs, &cond.rhs, scope);
                self.push(Instr::Jzero(mid));
                self.push(Instr::Jump(false_label));
                self.push(Instr::Label(mid));
                self.compute_diff(&cond.rhs, &cond.lhs, scope);
                self.push(Instr::Jzero(false_label));
                self.push(Instr::Jump(true_label));
            }
            RelOp::Gt => {
                let mid = self.ctx.fresh_label("gt_mid");
                self.compute_diff(&cond.rhs, &cond.lhs, scope);
                self.push(Instr::Jzero(mid));
                self.push(Instr::Jump(false_label));
                self.push(Instr::Label(mid));
                self.compute_diff(&cond.lhs, &cond.rhs, scope);
                self.push(Instr::Jzero(false_label));
                self.push(Instr::Jump(true_label));
            }
        }
    }

    // --- structured control -----------------------------------------------

    fn lower_if(&mut self, cond: &Condition, then_branch: &[Command], else_branch: Option<&[Command]>, scope: &Map<Id, ResolvedVar>) {
        let then_label = self.ctx.fresh_label("if_then");
        let else_label = self.ctx.fresh_label("if_else");
        let end_label = self.ctx.fresh_label("if_end");
        let false_target = if else_branch.is_some() { else_label } else { end_label };

        self.lower_condition(cond, scope, then_label, false_target);
        self.push(Instr::Label(then_label));
        self.lower_commands(then_branch, scope);
        self.push(Instr::Jump(end_label));
        if let Some(else_commands) = else_branch {
            self.push(Instr::Label(else_label));
            self.lower_commands(else_commands, scope);
            self.push(Instr::Jump(end_label));
        }
        self.push(Instr::Label(end_label));
    }

    fn lower_while(&mut self, cond: &Condition, body: &[Command], scope: &Map<Id, ResolvedVar>) {
        let head = self.ctx.fresh_label("while_head");
        let body_label = self.ctx.fresh_label("while_body");
        let end = self.ctx.fresh_label("while_end");

        self.push(Instr::Label(head));
        self.lower_condition(cond, scope, body_label, end);
        self.push(Instr::Label(body_label));
        self.lower_commands(body, scope);
        self.push(Instr::Jump(head));
        self.push(Instr::Label(end));
    }

    fn lower_repeat(&mut self, body: &[Command], cond: &Condition, scope: &Map<Id, ResolvedVar>) {
        let head = self.ctx.fresh_label("repeat_head");
        let end = self.ctx.fresh_label("repeat_end");

        self.push(Instr::Label(head));
        self.lower_commands(body, scope);
        // `until cond` loops back while cond is false, exits once it holds.
        self.lower_condition(cond, scope, end, head);
        self.push(Instr::Label(end));
    }

    // --- calls --------------------------------------------------------

    /// Materializes the call's argument addresses, transfers them into the
    /// callee's parameter vregs, emits the `Strk`/`Jump` call-site pair, then
    /// reloads any local scalars that were flushed to memory so the callee
    /// could write through them by reference.
    fn lower_call(&mut self, name: Id, name_loc: Loc, args: &[Identifier], scope: &Map<Id, ResolvedVar>) {
        let Some(sig) = self.sigs.get(&name).cloned() else {
            self.ctx.error(name_loc, format!("call to unknown procedure `{name}`"));
            return;
        };
        if sig.params.len() != args.len() {
            self.ctx.error(
                name_loc,
                format!("`{name}` expects {} argument(s), found {}", sig.params.len(), args.len()),
            );
        }

        let mut flushed: Vec<(VReg, VReg)> = Vec::new();
        for (arg, param) in args.iter().zip(sig.params.iter()) {
            let var = self.resolve(scope, arg.name, arg.loc);
            let addr = self.ctx.fresh_vreg();

            if var.is_array {
                if var.is_pointer {
                    self.push(Instr::Get(var.vreg.unwrap()));
                    self.push(Instr::Put(addr));
                } else {
                    self.materialize_constant(addr, var.mem_base.unwrap() as u64);
                }
            } else if var.is_pointer {
                self.push(Instr::Get(var.vreg.unwrap()));
                self.push(Instr::Put(addr));
            } else {
                // Local scalar: flush its live value to the shadow slot so
                // the callee can Load/Store through a real address, and
                // remember to pull the (possibly updated) value back after.
                self.materialize_constant(addr, var.mem_base.unwrap() as u64);
                self.push(Instr::Get(var.vreg.unwrap()));
                self.push(Instr::Store(addr));
                flushed.push((var.vreg.unwrap(), addr));
            }

            self.push(Instr::Get(addr));
            self.push(Instr::Put(param.vreg));
        }

        self.push(Instr::Strk(sig.ret_vreg));
        self.push(Instr::Jump(name));

        for (scalar_vreg, addr) in flushed {
            self.push(Instr::Load(addr));
            self.push(Instr::Put(scalar_vreg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    fn lower_src(src: &str) -> LirProgram {
        let program = parse(src).expect("parses");
        lower(&program).expect("lowers")
    }

    #[test]
    fn empty_procedure_is_label_then_jumpr() {
        let lir = lower_src("PROCEDURE p() IS IN END PROGRAM IS IN END");
        let (_, body) = &lir.procedures[0];
        assert!(matches!(body[0], Instr::Label(_)));
        assert!(matches!(body[1], Instr::Jumpr(_)));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn main_ends_with_halt() {
        let lir = lower_src("PROGRAM IS a IN a := 1; END");
        assert!(matches!(lir.main.last(), Some(Instr::Halt)));
    }

    #[test]
    fn constant_materialization_is_logarithmic() {
        let lir = lower_src("PROGRAM IS a IN a := 1000000; END");
        // Rst + at most ~2*log2(N) Shl/Inc; nowhere near a unary count.
        assert!(lir.main.len() < 60, "expected O(log N) instructions, got {}", lir.main.len());
    }

    #[test]
    fn while_loop_has_head_and_end_labels() {
        let lir = lower_src("PROGRAM IS a IN WHILE a > 0 DO a := a - 1; ENDWHILE END");
        let labels: Vec<_> = lir.main.iter().filter(|i| matches!(i, Instr::Label(_))).count();
        assert!(labels >= 3); // MAIN, while head, while end (plus condition helpers)
    }

    #[test]
    fn call_emits_strk_then_jump_to_callee() {
        let lir = lower_src("PROCEDURE p(x) IS IN x := x + 1; END PROGRAM IS a IN a := 1; p(a); END");
        let strk_then_jump = lir.main.windows(2).any(|w| {
            matches!(&w[0], Instr::Strk(_)) && matches!(&w[1], Instr::Jump(name) if **name == *"p")
        });
        assert!(strk_then_jump);
    }

    #[test]
    fn division_by_zero_guard_is_present() {
        let lir = lower_src("PROGRAM IS a, b, c IN c := a / b; END");
        assert!(lir.main.iter().any(|i| matches!(i, Instr::Jzero(_))));
    }

    #[test]
    fn array_element_access_computes_an_address() {
        let lir = lower_src("PROGRAM IS a[10] IN a[0] := 5; END");
        assert!(lir.main.iter().any(|i| matches!(i, Instr::Store(_))));
    }
}
