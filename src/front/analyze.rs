//! The semantic analyzer.
//!
//! Walks the AST once and reports diagnostics; it never transforms the tree
//! (lowering is a separate pass, see `middle::lower`). Mirrors the shape of
//! `Analyzer` from the original course project: an `errors` accumulator and
//! an `analyze_procedure` entry point per scope, generalized here to also
//! track per-scope symbol tables and a conservative initialized-before-use
//! approximation.

use crate::common::{Diagnostic, Id, Loc, Map, Set, Stage};
use crate::front::ast::*;

#[derive(Debug, Clone, Copy)]
struct VarInfo {
    is_array: bool,
    size: Option<u64>,
}

#[derive(Debug, Clone)]
struct ProcSig {
    arity: usize,
    arg_is_array: Vec<bool>,
}

/// Run semantic analysis over a whole program and return every diagnostic
/// found. An empty result means the program may proceed to lowering.
pub fn analyze(program: &Program) -> Vec<Diagnostic> {
    let mut analyzer = Analyzer { program, procedures: Map::new(), diagnostics: Vec::new() };
    analyzer.run();
    analyzer.diagnostics
}

struct Analyzer<'a> {
    program: &'a Program,
    procedures: Map<Id, ProcSig>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Analyzer<'a> {
    fn error(&mut self, loc: Loc, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(Stage::Semantic, loc, message));
    }

    fn warn(&mut self, loc: Loc, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(Stage::Semantic, loc, message));
    }

    fn run(&mut self) {
        self.collect_procedure_signatures();
        for procedure in &self.program.procedures {
            self.analyze_procedure(procedure);
        }
        let mut initialized = Set::new();
        self.analyze_context(&self.program.main, Map::new(), &mut initialized);
    }

    // Signatures are collected before any body is walked so that calls to
    // procedures declared later in the source resolve correctly.
    fn collect_procedure_signatures(&mut self) {
        for procedure in &self.program.procedures {
            if self.procedures.contains_key(&procedure.name) {
                self.error(procedure.name_loc, format!("duplicate procedure `{}`", procedure.name));
                continue;
            }
            let arg_is_array = procedure.args.iter().map(|a| a.is_array).collect();
            self.procedures.insert(procedure.name, ProcSig { arity: procedure.arity(), arg_is_array });
        }
    }

    fn analyze_procedure(&mut self, procedure: &Procedure) {
        let mut scope: Map<Id, VarInfo> = Map::new();
        let mut seen_args: Set<Id> = Set::new();
        for arg in &procedure.args {
            if !seen_args.insert(arg.name) {
                self.error(arg.loc, format!("duplicate parameter `{}`", arg.name));
                continue;
            }
            scope.insert(arg.name, VarInfo { is_array: arg.is_array, size: None });
        }
        // By-reference parameters are caller-supplied addresses; treat them
        // as already initialized from the callee's point of view.
        let mut initialized: Set<Id> = scope.keys().copied().collect();
        self.analyze_context(&procedure.context, scope, &mut initialized);
    }

    fn analyze_context(&mut self, ctx: &Context, mut scope: Map<Id, VarInfo>, initialized: &mut Set<Id>) {
        for decl in &ctx.declarations {
            if scope.contains_key(&decl.name) {
                self.error(decl.loc, format!("duplicate declaration of `{}`", decl.name));
                continue;
            }
            if decl.array_size == Some(0) {
                self.error(decl.loc, format!("array `{}` declared with size 0", decl.name));
            }
            scope.insert(decl.name, VarInfo { is_array: decl.array_size.is_some(), size: decl.array_size });
        }
        self.analyze_commands(&ctx.commands, &scope, initialized);
    }

    fn analyze_commands(&mut self, commands: &[Command], scope: &Map<Id, VarInfo>, initialized: &mut Set<Id>) {
        for command in commands {
            self.analyze_command(command, scope, initialized);
        }
    }

    fn analyze_command(&mut self, command: &Command, scope: &Map<Id, VarInfo>, initialized: &mut Set<Id>) {
        match command {
            Command::Assign { target, expr } => {
                self.check_expr(expr, scope, initialized);
                self.check_identifier(target, scope, initialized, false);
                initialized.insert(target.name);
            }
            Command::Read(target) => {
                self.check_identifier(target, scope, initialized, false);
                initialized.insert(target.name);
            }
            Command::Write(value) => self.check_value(value, scope, initialized),
            Command::If { cond, then_branch, else_branch } => {
                self.check_condition(cond, scope, initialized);
                let mut then_init = initialized.clone();
                self.analyze_commands(then_branch, scope, &mut then_init);
                match else_branch {
                    Some(else_commands) => {
                        let mut else_init = initialized.clone();
                        self.analyze_commands(else_commands, scope, &mut else_init);
                        *initialized = then_init.intersection(&else_init).copied().collect();
                    }
                    None => {
                        *initialized = then_init.intersection(initialized).copied().collect();
                    }
                }
            }
            Command::While { cond, body } => {
                self.check_condition(cond, scope, initialized);
                // The loop may run zero times, so nothing the body
                // initializes is guaranteed on the way out.
                let mut body_init = initialized.clone();
                self.analyze_commands(body, scope, &mut body_init);
            }
            Command::Repeat { body, cond } => {
                // `repeat` always runs its body at least once.
                self.analyze_commands(body, scope, initialized);
                self.check_condition(cond, scope, initialized);
            }
            Command::Call { name, name_loc, args } => self.check_call(*name, *name_loc, args, scope, initialized),
            Command::InlinedProcedure(body) => self.analyze_commands(body, scope, initialized),
        }
    }

    fn check_value(&mut self, value: &Value, scope: &Map<Id, VarInfo>, initialized: &Set<Id>) {
        if let Value::Id(id) = value {
            self.check_identifier(id, scope, initialized, true);
        }
    }

    fn check_expr(&mut self, expr: &Expr, scope: &Map<Id, VarInfo>, initialized: &Set<Id>) {
        match expr {
            Expr::Value(value) => self.check_value(value, scope, initialized),
            Expr::Binary(binary) => {
                self.check_value(&binary.lhs, scope, initialized);
                self.check_value(&binary.rhs, scope, initialized);
            }
        }
    }

    fn check_condition(&mut self, cond: &Condition, scope: &Map<Id, VarInfo>, initialized: &Set<Id>) {
        self.check_value(&cond.lhs, scope, initialized);
        self.check_value(&cond.rhs, scope, initialized);
    }

    fn check_call(
        &mut self,
        name: Id,
        name_loc: Loc,
        args: &[Identifier],
        scope: &Map<Id, VarInfo>,
        initialized: &mut Set<Id>,
    ) {
        let Some(sig) = self.procedures.get(&name).cloned() else {
            self.error(name_loc, format!("call to undeclared procedure `{name}`"));
            for arg in args {
                self.check_identifier(arg, scope, initialized, false);
            }
            return;
        };
        if sig.arity != args.len() {
            self.error(name_loc, format!("`{name}` expects {} argument(s), found {}", sig.arity, args.len()));
        }
        for (i, arg) in args.iter().enumerate() {
            // Arguments are passed by reference (address-of), not read, so
            // they do not need to already be initialized.
            self.check_identifier(arg, scope, initialized, false);
            if let (Some(&expects_array), Some(info)) = (sig.arg_is_array.get(i), scope.get(&arg.name)) {
                if expects_array != info.is_array {
                    let kind = if expects_array { "an array" } else { "a scalar" };
                    self.error(arg.loc, format!("argument `{}` to `{name}` must be {kind}", arg.name));
                }
            }
            // The callee may write through the reference.
            initialized.insert(arg.name);
        }
    }

    /// `needs_init` is true for read positions (values, conditions) and
    /// false for write targets and by-reference call arguments, which take
    /// the variable's address rather than its current value.
    fn check_identifier(
        &mut self,
        id: &Identifier,
        scope: &Map<Id, VarInfo>,
        initialized: &Set<Id>,
        needs_init: bool,
    ) {
        let Some(info) = scope.get(&id.name) else {
            self.error(id.loc, format!("use of undeclared variable `{}`", id.name));
            return;
        };

        match (&id.index, info.is_array) {
            (None, true) => self.error(id.loc, format!("array `{}` used without an index", id.name)),
            (Some(_), false) => self.error(id.loc, format!("`{}` is not an array", id.name)),
            _ => {}
        }

        if let Some(index) = &id.index {
            match index {
                Index::Literal(i) => {
                    if let Some(size) = info.size {
                        if *i >= size {
                            self.error(
                                id.loc,
                                format!("index {i} out of bounds for array `{}` of size {size}", id.name),
                            );
                        }
                    }
                }
                Index::Variable(idx_name) => match scope.get(idx_name) {
                    None => self.error(id.loc, format!("use of undeclared variable `{idx_name}` as index")),
                    Some(idx_info) if idx_info.is_array => {
                        self.error(id.loc, format!("array `{idx_name}` cannot be used as an index"));
                    }
                    _ => {
                        if !initialized.contains(idx_name) {
                            self.warn(id.loc, format!("`{idx_name}` may be used before initialization"));
                        }
                    }
                },
            }
        }

        if needs_init && !initialized.contains(&id.name) {
            self.warn(id.loc, format!("`{}` may be used before initialization", id.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    fn errors(src: &str) -> Vec<Diagnostic> {
        let program = parse(src).expect("parses");
        analyze(&program).into_iter().filter(|d| !d.is_warning).collect()
    }

    fn warnings(src: &str) -> Vec<Diagnostic> {
        let program = parse(src).expect("parses");
        analyze(&program).into_iter().filter(|d| d.is_warning).collect()
    }

    #[test]
    fn accepts_well_formed_program() {
        assert!(errors("PROGRAM IS a IN a := 1; WRITE a; END").is_empty());
    }

    #[test]
    fn rejects_duplicate_declaration() {
        assert_eq!(errors("PROGRAM IS a, a IN END").len(), 1);
    }

    #[test]
    fn rejects_undeclared_use() {
        assert_eq!(errors("PROGRAM IS IN WRITE a; END").len(), 1);
    }

    #[test]
    fn rejects_zero_size_array_at_semantic_time() {
        assert_eq!(errors("PROGRAM IS a[0] IN END").len(), 1);
    }

    #[test]
    fn rejects_arity_mismatch() {
        let src = "PROCEDURE p(x) IS IN END PROGRAM IS a, b IN p(a, b); END";
        assert_eq!(errors(src).len(), 1);
    }

    #[test]
    fn rejects_array_scalar_mismatch() {
        let src = "PROCEDURE p(T x) IS IN END PROGRAM IS a IN p(a); END";
        assert_eq!(errors(src).len(), 1);
    }

    #[test]
    fn rejects_out_of_bounds_literal_index() {
        assert_eq!(errors("PROGRAM IS a[3] IN WRITE a[3]; END").len(), 1);
    }

    #[test]
    fn warns_on_use_before_initialization() {
        assert_eq!(warnings("PROGRAM IS a IN WRITE a; END").len(), 1);
    }

    #[test]
    fn does_not_warn_after_assignment() {
        assert!(warnings("PROGRAM IS a IN a := 1; WRITE a; END").is_empty());
    }

    #[test]
    fn does_not_warn_when_both_if_branches_initialize() {
        let src = "PROGRAM IS a, b IN IF b = 0 THEN a := 1; ELSE a := 2; ENDIF WRITE a; END";
        assert!(warnings(src).is_empty());
    }

    #[test]
    fn warns_when_only_one_branch_initializes() {
        let src = "PROGRAM IS a, b IN IF b = 0 THEN a := 1; ENDIF WRITE a; END";
        assert_eq!(warnings(src).len(), 1);
    }
}
