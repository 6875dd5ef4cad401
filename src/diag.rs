//! Diagnostic rendering and the unified error type for the pipeline

use std::fmt;

use colored::Colorize;

use crate::codegen::CodegenError;
use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::preprocess::PreprocessError;

#[derive(Debug)]
pub enum CompileError {
    Io(std::io::Error),
    Preprocess(PreprocessError),
    Lex(LexError),
    Parse(ParseError),
    Codegen(CodegenError),
    Args(String),
    Toolchain(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Io(e) => write!(f, "{}", e),
            CompileError::Preprocess(e) => write!(f, "{}", e),
            CompileError::Lex(e) => write!(f, "{}", e),
            CompileError::Parse(e) => write!(f, "{}", e),
            CompileError::Codegen(e) => write!(f, "{}", e),
            CompileError::Args(msg) => write!(f, "{}", msg),
            CompileError::Toolchain(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

impl From<PreprocessError> for CompileError {
    fn from(e: PreprocessError) -> Self {
        CompileError::Preprocess(e)
    }
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError::Lex(e)
    }
}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        CompileError::Parse(e)
    }
}

impl From<CodegenError> for CompileError {
    fn from(e: CodegenError) -> Self {
        CompileError::Codegen(e)
    }
}

/// Print a fatal diagnostic. The caller decides when to terminate.
pub fn print_fatal(message: &impl fmt::Display) {
    eprintln!(
        "{} {} {}\n{}",
        "entc:".white().bold(),
        "fatal error:".red().bold(),
        message,
        "compilation terminated."
    );
}

/// Print a non-fatal diagnostic.
pub fn print_error(message: &impl fmt::Display) {
    eprintln!(
        "{} {} {}",
        "entc:".white().bold(),
        "error:".red().bold(),
        message
    );
}
