//! The parser.
//!
//! Recursive-descent, one token of lookahead. Builds the AST of `front::ast`
//! directly from the token stream; there is no separate concrete syntax
//! tree. Syntactic errors ("unexpected token", "missing terminator") are
//! fatal and reported with `(line, column)`; the parser stops at the first
//! one rather than attempting recovery.

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::{Id, Loc};

use super::ast::*;
use super::lex::*;

#[derive(Display)]
#[display("Parse error at {}: {}", loc, message)]
pub struct ParseError {
    pub message: String,
    pub loc: Loc,
}

impl ParseError {
    fn new(loc: Loc, message: impl Into<String>) -> Self {
        ParseError { message: message.into(), loc }
    }
}

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for ParseError {}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(input)
        .lex_all()
        .map_err(|e| ParseError::new(e.loc, e.message))?;
    Parser::new(&tokens).parse_program()
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

type PResult<T> = Result<T, ParseError>;

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn loc(&self) -> Loc {
        self.peek().map(|t| t.loc).unwrap_or_else(|| {
            self.tokens.last().map(|t| t.loc).unwrap_or_default()
        })
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        match self.peek() {
            Some(t) if t.kind == kind => {
                let t = t.clone();
                self.pos += 1;
                Ok(t)
            }
            Some(t) => Err(ParseError::new(
                t.loc,
                format!("expected {kind}, found {} {:?}", t.kind, t.lexeme),
            )),
            None => Err(ParseError::new(self.loc(), format!("expected {kind}, found end of input"))),
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_pidentifier(&mut self) -> PResult<(Id, Loc)> {
        let tok = self.expect(TokenKind::Pidentifier)?;
        Ok((Id::new(tok.lexeme.clone()), tok.loc))
    }

    fn expect_num(&mut self) -> PResult<(u64, Loc)> {
        let tok = self.expect(TokenKind::Num)?;
        let value = tok.lexeme.parse::<u64>().map_err(|_| {
            ParseError::new(tok.loc, format!("numeral {:?} does not fit in 64 bits", tok.lexeme))
        })?;
        Ok((value, tok.loc))
    }

    // program_all ::= procedures main
    fn parse_program(&mut self) -> PResult<Program> {
        let mut procedures = Vec::new();
        while self.at(TokenKind::Procedure) {
            procedures.push(self.parse_procedure()?);
        }
        let main = self.parse_main()?;
        if let Some(t) = self.peek() {
            return Err(ParseError::new(t.loc, format!("unexpected trailing token {} {:?}", t.kind, t.lexeme)));
        }
        Ok(Program { procedures, main })
    }

    // PROCEDURE pidentifier "(" args_decl ")" IS [declarations] IN commands END
    fn parse_procedure(&mut self) -> PResult<Procedure> {
        self.expect(TokenKind::Procedure)?;
        let (name, name_loc) = self.expect_pidentifier()?;
        self.expect(TokenKind::LParen)?;
        let args = self.parse_args_decl()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Is)?;
        let context = self.parse_context()?;
        Ok(Procedure { name, name_loc, args, context })
    }

    // PROGRAM IS [declarations] IN commands END
    fn parse_main(&mut self) -> PResult<Context> {
        self.expect(TokenKind::Program)?;
        self.expect(TokenKind::Is)?;
        self.parse_context()
    }

    fn parse_context(&mut self) -> PResult<Context> {
        let declarations = if self.at(TokenKind::In) {
            Vec::new()
        } else {
            self.parse_declarations()?
        };
        self.expect(TokenKind::In)?;
        let commands = self.parse_commands()?;
        self.expect(TokenKind::End)?;
        Ok(Context { declarations, commands })
    }

    fn parse_declarations(&mut self) -> PResult<Vec<Declaration>> {
        let mut decls = vec![self.parse_declaration()?];
        while self.eat(TokenKind::Comma) {
            decls.push(self.parse_declaration()?);
        }
        Ok(decls)
    }

    fn parse_declaration(&mut self) -> PResult<Declaration> {
        let (name, loc) = self.expect_pidentifier()?;
        let array_size = if self.eat(TokenKind::LBracket) {
            let (size, _size_loc) = self.expect_num()?;
            self.expect(TokenKind::RBracket)?;
            // Zero-size arrays are syntactically well-formed; rejecting them
            // is the semantic analyzer's job.
            Some(size)
        } else {
            None
        };
        Ok(Declaration { name, array_size, loc })
    }

    fn parse_args_decl(&mut self) -> PResult<Vec<Arg>> {
        if self.at(TokenKind::RParen) {
            return Ok(Vec::new());
        }
        let mut args = vec![self.parse_arg_decl()?];
        while self.eat(TokenKind::Comma) {
            args.push(self.parse_arg_decl()?);
        }
        Ok(args)
    }

    fn parse_arg_decl(&mut self) -> PResult<Arg> {
        let is_array = self.eat(TokenKind::ArrayMarker);
        let (name, loc) = self.expect_pidentifier()?;
        Ok(Arg { name, is_array, loc })
    }

    fn parse_commands(&mut self) -> PResult<Vec<Command>> {
        let mut commands = vec![self.parse_command()?];
        while !self.at_command_terminator() {
            commands.push(self.parse_command()?);
        }
        Ok(commands)
    }

    fn at_command_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            None | Some(TokenKind::End)
                | Some(TokenKind::Else)
                | Some(TokenKind::EndIf)
                | Some(TokenKind::EndWhile)
                | Some(TokenKind::Until)
        )
    }

    fn parse_command(&mut self) -> PResult<Command> {
        match self.peek_kind() {
            Some(TokenKind::If) => self.parse_if(),
            Some(TokenKind::While) => self.parse_while(),
            Some(TokenKind::Repeat) => self.parse_repeat(),
            Some(TokenKind::Read) => self.parse_read(),
            Some(TokenKind::Write) => self.parse_write(),
            Some(TokenKind::Pidentifier) => self.parse_assign_or_call(),
            Some(_) => {
                let t = self.peek().unwrap();
                Err(ParseError::new(t.loc, format!("unexpected token {} starting a command", t.kind)))
            }
            None => Err(ParseError::new(self.loc(), "unexpected end of input while parsing a command")),
        }
    }

    fn parse_if(&mut self) -> PResult<Command> {
        self.expect(TokenKind::If)?;
        let cond = self.parse_condition()?;
        self.expect(TokenKind::Then)?;
        let then_branch = self.parse_commands()?;
        let else_branch = if self.eat(TokenKind::Else) {
            Some(self.parse_commands()?)
        } else {
            None
        };
        self.expect(TokenKind::EndIf)?;
        Ok(Command::If { cond, then_branch, else_branch })
    }

    fn parse_while(&mut self) -> PResult<Command> {
        self.expect(TokenKind::While)?;
        let cond = self.parse_condition()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_commands()?;
        self.expect(TokenKind::EndWhile)?;
        Ok(Command::While { cond, body })
    }

    fn parse_repeat(&mut self) -> PResult<Command> {
        self.expect(TokenKind::Repeat)?;
        let body = self.parse_commands()?;
        self.expect(TokenKind::Until)?;
        let cond = self.parse_condition()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Command::Repeat { body, cond })
    }

    fn parse_read(&mut self) -> PResult<Command> {
        self.expect(TokenKind::Read)?;
        let id = self.parse_identifier()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Command::Read(id))
    }

    fn parse_write(&mut self) -> PResult<Command> {
        self.expect(TokenKind::Write)?;
        let value = self.parse_value()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Command::Write(value))
    }

    // An identifier starts both an assignment (`x := ...`) and a call
    // (`proc(a, b)`); disambiguate on the token after the identifier.
    fn parse_assign_or_call(&mut self) -> PResult<Command> {
        let (name, name_loc) = self.expect_pidentifier()?;
        if self.eat(TokenKind::LParen) {
            let args = self.parse_call_args()?;
            self.expect(TokenKind::RParen)?;
            self.expect(TokenKind::Semicolon)?;
            return Ok(Command::Call { name, name_loc, args });
        }

        let index = self.parse_optional_index()?;
        let target = Identifier { name, index, loc: name_loc };
        self.expect(TokenKind::Walrus)?;
        let expr = self.parse_expr()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Command::Assign { target, expr })
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Identifier>> {
        if self.at(TokenKind::RParen) {
            return Ok(Vec::new());
        }
        let mut args = vec![self.parse_identifier_scalar()?];
        while self.eat(TokenKind::Comma) {
            args.push(self.parse_identifier_scalar()?);
        }
        Ok(args)
    }

    fn parse_identifier_scalar(&mut self) -> PResult<Identifier> {
        let (name, loc) = self.expect_pidentifier()?;
        Ok(Identifier::scalar(name, loc))
    }

    fn parse_optional_index(&mut self) -> PResult<Option<Index>> {
        if !self.eat(TokenKind::LBracket) {
            return Ok(None);
        }
        let index = match self.peek_kind() {
            Some(TokenKind::Num) => {
                let (v, _) = self.expect_num()?;
                Index::Literal(v)
            }
            Some(TokenKind::Pidentifier) => {
                let (name, _) = self.expect_pidentifier()?;
                Index::Variable(name)
            }
            _ => {
                let t = self.peek();
                let loc = t.map(|t| t.loc).unwrap_or_default();
                return Err(ParseError::new(loc, "expected a numeral or identifier as an array index"));
            }
        };
        self.expect(TokenKind::RBracket)?;
        Ok(Some(index))
    }

    fn parse_identifier(&mut self) -> PResult<Identifier> {
        let (name, loc) = self.expect_pidentifier()?;
        let index = self.parse_optional_index()?;
        Ok(Identifier { name, index, loc })
    }

    fn parse_value(&mut self) -> PResult<Value> {
        match self.peek_kind() {
            Some(TokenKind::Num) => {
                let (v, _) = self.expect_num()?;
                Ok(Value::Num(v))
            }
            Some(TokenKind::Pidentifier) => Ok(Value::Id(self.parse_identifier()?)),
            Some(_) => {
                let t = self.peek().unwrap();
                Err(ParseError::new(t.loc, format!("expected a value, found {}", t.kind)))
            }
            None => Err(ParseError::new(self.loc(), "expected a value, found end of input")),
        }
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        let lhs = self.parse_value()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Plus) => Some(BOp::Add),
            Some(TokenKind::Minus) => Some(BOp::Sub),
            Some(TokenKind::Star) => Some(BOp::Mul),
            Some(TokenKind::Slash) => Some(BOp::Div),
            Some(TokenKind::Percent) => Some(BOp::Mod),
            _ => None,
        };
        match op {
            None => Ok(Expr::Value(lhs)),
            Some(op) => {
                self.pos += 1;
                let rhs = self.parse_value()?;
                Ok(Expr::Binary(BinaryExpression { op, lhs, rhs }))
            }
        }
    }

    fn parse_condition(&mut self) -> PResult<Condition> {
        let lhs = self.parse_value()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Equals) => RelOp::Eq,
            Some(TokenKind::BangEquals) => RelOp::Ne,
            Some(TokenKind::Less) => RelOp::Lt,
            Some(TokenKind::LessEquals) => RelOp::Le,
            Some(TokenKind::Greater) => RelOp::Gt,
            Some(TokenKind::GreaterEquals) => RelOp::Ge,
            Some(_) | None => {
                let t = self.peek();
                let loc = t.map(|t| t.loc).unwrap_or_else(|| self.loc());
                return Err(ParseError::new(loc, "expected a comparison operator"));
            }
        };
        self.pos += 1;
        let rhs = self.parse_value()?;
        Ok(Condition { op, lhs, rhs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_main() {
        let prog = parse("PROGRAM IS IN END").unwrap();
        assert!(prog.procedures.is_empty());
        assert!(prog.main.declarations.is_empty());
        assert!(prog.main.commands.is_empty());
    }

    #[test]
    fn empty_procedure_body_parses() {
        let prog = parse("PROCEDURE foo() IS IN END PROGRAM IS IN END").unwrap();
        assert_eq!(prog.procedures.len(), 1);
        assert!(prog.procedures[0].context.commands.is_empty());
    }

    #[test]
    fn parses_assignment_and_write() {
        let prog = parse("PROGRAM IS x IN x := 1 + 2; WRITE x; END").unwrap();
        assert_eq!(prog.main.commands.len(), 2);
    }

    #[test]
    fn parses_array_declaration_and_index() {
        let prog = parse("PROGRAM IS a[10] IN a[0] := 5; WRITE a[0]; END").unwrap();
        match &prog.main.declarations[0].array_size {
            Some(10) => {}
            other => panic!("expected array size 10, got {other:?}"),
        }
    }

    #[test]
    fn zero_size_array_parses_but_is_rejected_later() {
        // Rejection happens during semantic analysis, not parsing; see
        // `front::analyze`.
        let prog = parse("PROGRAM IS a[0] IN END").unwrap();
        assert_eq!(prog.main.declarations[0].array_size, Some(0));
    }

    #[test]
    fn parses_procedure_call() {
        let prog = parse(
            "PROCEDURE inc(x) IS IN x := x + 1; END \
             PROGRAM IS n IN inc(n); END",
        )
        .unwrap();
        assert!(matches!(prog.main.commands[0], Command::Call { .. }));
    }

    #[test]
    fn parses_if_while_repeat() {
        let src = "PROGRAM IS a, b IN \
            IF a < b THEN WRITE a; ELSE WRITE b; ENDIF \
            WHILE a < b DO a := a + 1; ENDWHILE \
            REPEAT a := a - 1; UNTIL a = 0; \
            END";
        let prog = parse(src).unwrap();
        assert_eq!(prog.main.commands.len(), 3);
    }
}
