// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Indicates that a submitted logical plan violates a structural invariant: a cycle, a
    /// dangling edge, or an operator whose input schemas cannot be reconciled.
    ///
    /// The query is not admitted into any shared query plan.
    SchemaMismatch,

    /// Indicates that a logical plan arrived malformed: unknown operator references, a missing
    /// sink, or a source that is not registered in the source catalog.
    InvalidQueryPlan,

    /// Indicates that no topology node satisfies the placement constraints of an operator.
    ///
    /// The query is marked failed; previously placed queries are never relocated as a result.
    PlacementFailed,

    /// Indicates that the pipeline generator could not express an operator as an executable
    /// stage.
    CompilationFailed,

    /// Indicates that the buffer pool could not satisfy an allocation within the configured
    /// timeout.
    ///
    /// Pipeline stages treat this as retryable on the next tick; the control plane surfaces it
    /// as a query failure when it persists.
    CapacityExhausted,

    /// Indicates that a request accessed a storage resource it did not declare before its
    /// locks were acquired.
    ///
    /// This is fatal for the request. Declared-resource sets exist so lock acquisition stays in
    /// a canonical total order, which is what makes the two-phase handler deadlock-free.
    ResourceUndeclared,

    /// Indicates an invalid engine configuration. Callers conventionally map this to process
    /// exit code 2.
    ConfigurationError,

    /// Indicates an internal invariant violation in the engine. This error is not recoverable
    /// and indicates a bug; it is surfaced only so the owner of the query can log it.
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::SchemaMismatch => write!(f, "schema mismatch"),
            ErrorKind::InvalidQueryPlan => write!(f, "invalid query plan"),
            ErrorKind::PlacementFailed => write!(f, "placement failed"),
            ErrorKind::CompilationFailed => write!(f, "pipeline compilation failed"),
            ErrorKind::CapacityExhausted => write!(f, "buffer capacity exhausted"),
            ErrorKind::ResourceUndeclared => write!(f, "access to undeclared storage resource"),
            ErrorKind::ConfigurationError => write!(f, "invalid configuration"),
            ErrorKind::InternalError => write!(f, "internal engine error"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
