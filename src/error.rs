use std::fmt;

/// Shared error type for the whole compilation pipeline.
#[derive(Debug)]
pub enum CompileError {
    IoError(String),
    SyntaxError(String),
    CodegenError(String),
    CapacityError(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::IoError(msg) => write!(f, "I/O error: {}", msg),
            CompileError::SyntaxError(msg) => write!(f, "Syntax error: {}", msg),
            CompileError::CodegenError(msg) => write!(f, "Codegen error: {}", msg),
            CompileError::CapacityError(msg) => write!(f, "Capacity error: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(value: std::io::Error) -> Self {
        CompileError::IoError(value.to_string())
    }
}

impl From<crate::lexer::ScanError> for CompileError {
    fn from(error: crate::lexer::ScanError) -> Self {
        CompileError::SyntaxError(error.to_string())
    }
}
