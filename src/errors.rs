// File: src/errors.rs
//
// Error reporting for the Hemlock compiler and runtime.
// Compile-time diagnostics carry a source location and render with color;
// runtime errors carry the frame-by-frame trace collected by the VM.

use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    ParseError,
    CompileError,
    RuntimeError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ParseError => write!(f, "Parse error"),
            ErrorKind::CompileError => write!(f, "Compile error"),
            ErrorKind::RuntimeError => write!(f, "Runtime error"),
        }
    }
}

/// A diagnostic with source location information.
#[derive(Debug, Clone)]
pub struct HemlockError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub file: Option<String>,
}

impl HemlockError {
    pub fn parse(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self { kind: ErrorKind::ParseError, message: message.into(), line, column, file: None }
    }

    pub fn compile(message: impl Into<String>, line: u32) -> Self {
        Self { kind: ErrorKind::CompileError, message: message.into(), line, column: 0, file: None }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for HemlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind.red().bold(), self.message.bold())?;
        let location = match (&self.file, self.column) {
            (Some(file), 0) => format!("  --> {}:{}", file, self.line),
            (Some(file), col) => format!("  --> {}:{}:{}", file, self.line, col),
            (None, 0) => format!("  --> line {}", self.line),
            (None, col) => format!("  --> line {}:{}", self.line, col),
        };
        write!(f, "{}", location.bright_blue())
    }
}

impl std::error::Error for HemlockError {}

/// One entry of a runtime stack trace: chunk name and source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub name: String,
    pub line: u32,
}

/// Render an uncaught exception the way the CLI prints it:
/// `Runtime error: <message>` followed by `  at <chunk>:<line>` per frame,
/// innermost first.
pub fn render_runtime_error(message: &str, trace: &[TraceFrame]) -> String {
    let mut out = format!("Runtime error: {}", message);
    for frame in trace {
        out.push_str(&format!("\n  at {}:{}", frame.name, frame.line));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_renders_trace_innermost_first() {
        let trace = vec![
            TraceFrame { name: "inner".to_string(), line: 4 },
            TraceFrame { name: "<script>".to_string(), line: 9 },
        ];
        let rendered = render_runtime_error("boom", &trace);
        assert_eq!(rendered, "Runtime error: boom\n  at inner:4\n  at <script>:9");
    }
}
