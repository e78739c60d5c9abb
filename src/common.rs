//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers.
pub type Id = internment::Intern<String>;

/// A source position, attached to tokens, AST nodes, and diagnostics so that
/// every stage can report `(line, column)` the way the error handling design
/// requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub column: u32,
}

impl Loc {
    pub fn new(line: u32, column: u32) -> Self {
        Loc { line, column }
    }
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which stage of the pipeline produced a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lexical,
    Syntactic,
    Semantic,
    Emission,
    Allocation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Lexical => "lexical",
            Stage::Syntactic => "syntactic",
            Stage::Semantic => "semantic",
            Stage::Emission => "emission",
            Stage::Allocation => "allocation",
        };
        write!(f, "{s}")
    }
}

/// A single diagnostic record: `(source-stage, message, line, column,
/// is_warning)` per the error handling design.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub stage: Stage,
    pub message: String,
    pub loc: Loc,
    pub is_warning: bool,
}

impl Diagnostic {
    pub fn error(stage: Stage, loc: Loc, message: impl Into<String>) -> Self {
        Diagnostic { stage, message: message.into(), loc, is_warning: false }
    }

    pub fn warning(stage: Stage, loc: Loc, message: impl Into<String>) -> Self {
        Diagnostic { stage, message: message.into(), loc, is_warning: true }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_warning { "warning" } else { "error" };
        write!(f, "{} {kind} at {}: {}", self.stage, self.loc, self.message)
    }
}
