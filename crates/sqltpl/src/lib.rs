//! sqltpl renders parameterized SQL from handlebars templates and executes it.
//!
//! A request flows through four stages:
//! [`registry::Registry`] lookup, [`render::TemplateSet::render`] (a [`Volume`]
//! in, named SQL out), [`resolve::Resolver::to_sql`] (named SQL and its data
//! in, literal SQL out), and finally an [`executor::Executor`] which runs the
//! literal SQL and shapes its result into the caller's output type.
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod executor;
pub mod funcs;
pub mod ops;
pub mod registry;
pub mod render;
pub mod resolve;
pub mod volume;

pub use config::DbConfig;
pub use executor::{CallContext, Executor, Outcome};
pub use registry::Registry;
pub use render::{Rendered, TemplateSet};
pub use resolve::{Dialect, Resolver};
pub use volume::Volume;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to parse template {name:?}: {reason}")]
    TemplateParse { name: String, reason: String },
    #[error("template {0:?} is not defined")]
    TemplateMissing(String),
    #[error("failed to render template {name:?}: {reason}")]
    TemplateRender { name: String, reason: String },
    #[error("{func}: expected {expected}, got {actual}")]
    HelperArgument {
        func: &'static str,
        expected: &'static str,
        actual: String,
    },
    #[error(
        "named parameter :{name} has no value{}",
        .closest.as_ref().map(|c| format!(" (did you mean :{c}?)")).unwrap_or_default()
    )]
    ParameterMissing {
        name: String,
        closest: Option<String>,
    },
    #[error("invalid named SQL at byte {offset}: {reason}")]
    ParameterSyntax { offset: usize, reason: &'static str },
    #[error("named SQL data must be an object, got {0}")]
    ParameterSource(String),
    #[error("record not found")]
    RecordNotFound,
    #[error("no executor is registered for {0:?}")]
    ExecutorMissing(String),
    #[error("database operation failed: {0:#}")]
    Database(Arc<anyhow::Error>),
    #[error("failed to decode query result: {0}")]
    Decode(String),
    #[error("call was cancelled")]
    Cancelled,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

/// Fatal errors are not recoverable by retrying the call which produced them.
/// Callers may reasonably respond by exiting the process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fatal {
    #[error("failed to connect to the database after {attempts} attempts: {cause:#}")]
    ConnectExhausted {
        attempts: u32,
        cause: Arc<anyhow::Error>,
    },
    #[error("cannot convert volume value {name:?} ({value}) into {target}")]
    Conversion {
        name: String,
        value: String,
        target: &'static str,
    },
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RecordNotFound)
    }

    /// Template, helper, and parameter failures all originate from
    /// the SQL-generation half of the pipeline.
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            Error::TemplateParse { .. }
                | Error::TemplateMissing(_)
                | Error::TemplateRender { .. }
                | Error::HelperArgument { .. }
                | Error::ParameterMissing { .. }
                | Error::ParameterSyntax { .. }
                | Error::ParameterSource(_)
        )
    }

    pub(crate) fn database(err: anyhow::Error) -> Self {
        Error::Database(Arc::new(err))
    }
}
