use crate::source::SourcePos;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("Syntax error: {reason}")]
    Syntax {
        pos: SourcePos,
        stack: Vec<String>,
        reason: String,
    },

    #[error("{reason}")]
    Compiler { pos: SourcePos, reason: String },

    #[error("{reason}")]
    ExpressionEvaluate { pos: SourcePos, reason: String },

    #[error("Deferred value is recursively defined")]
    RecursiveDefinition,

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

impl AssemblyError {
    pub fn pos(&self) -> Option<&SourcePos> {
        match self {
            AssemblyError::Syntax { pos, .. }
            | AssemblyError::Compiler { pos, .. }
            | AssemblyError::ExpressionEvaluate { pos, .. } => Some(pos),
            _ => None,
        }
    }

    /// Multi-line human-readable report, with the parser stage breadcrumb
    /// for syntax errors and the offending source text for compiler errors.
    pub fn format_human(&self) -> String {
        match self {
            AssemblyError::Syntax { pos, stack, reason } => {
                let mut out = format!("Syntax error\n{reason}\n  at {pos}");
                for stage in stack {
                    out.push_str("\n  at ");
                    out.push_str(stage);
                }
                out
            }
            AssemblyError::Compiler { pos, reason } => {
                format!("{reason}\n  at {pos}\n\n{}", pos.text)
            }
            AssemblyError::ExpressionEvaluate { pos, reason } => {
                format!("{reason}\n  at {pos}")
            }
            other => other.to_string(),
        }
    }

    /// One-line `file:::line:::col:::message` form for editor integration.
    pub fn format_sublime(&self) -> String {
        let (file, line, column) = match self.pos() {
            Some(pos) => (pos.file.as_str(), pos.line, pos.column),
            None => ("", 0, 0),
        };
        format!("{}:::{}:::{}:::{}", file, line, column, self)
    }
}
