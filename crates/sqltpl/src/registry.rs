use crate::executor::{CallContext, Executor};
use crate::ops::{self, Event, Op};
use crate::render::{Rendered, TemplateSet};
use crate::resolve::{Dialect, Resolver};
use crate::{Error, Volume};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// ExecutorFactory produces the Executor of a registration when it's called.
pub type ExecutorFactory = Arc<dyn Fn() -> Result<Arc<dyn Executor>, Error> + Send + Sync>;

/// Registration is a template set and the Executor which runs its SQL.
#[derive(Clone)]
pub struct Registration {
    pub templates: Arc<TemplateSet>,
    pub executor: Option<ExecutorFactory>,
}

/// Generated is the SQL of a rendered template.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// Literal SQL, ready to execute.
    pub sql: String,
    /// SQL with `:name` placeholders, as rendered.
    pub named_sql: String,
    /// Volume which resolved `named_sql`.
    pub volume: Volume,
}

/// Registry maps identifiers to their Registrations, and runs the
/// render, resolve, and execute pipeline on their behalf.
///
/// A Registry may be shared across threads and tasks. Registration and
/// lookup may interleave freely, and the last registration of an
/// identifier wins.
pub struct Registry {
    resolver: Resolver,
    handler: ops::Handler,
    entries: RwLock<HashMap<String, Registration>>,
    executors: Arc<RwLock<HashMap<String, Arc<dyn Executor>>>>,
}

impl Registry {
    /// Build an empty Registry, resolving SQL literals of `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        let handler = ops::tracing_handler();
        Self {
            resolver: Resolver::new(dialect).with_handler(handler.clone()),
            handler,
            entries: Default::default(),
            executors: Default::default(),
        }
    }

    /// Send ops Events of this Registry to `handler`.
    pub fn with_handler(self, handler: ops::Handler) -> Self {
        Self {
            resolver: self.resolver.with_handler(handler.clone()),
            handler,
            ..self
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.resolver.dialect()
    }

    pub fn register(
        &self,
        id: impl Into<String>,
        templates: impl Into<Arc<TemplateSet>>,
        executor: Option<ExecutorFactory>,
    ) {
        let id = id.into();
        let templates = templates.into();
        tracing::debug!(%id, templates = ?templates.names(), "registered SQL templates");

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Registration {
                    templates,
                    executor,
                },
            );
    }

    pub fn lookup(&self, id: &str) -> Result<Registration, Error> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ExecutorMissing(id.to_string()))
    }

    /// Remove the registration of `id`, returning whether it existed.
    pub fn unregister(&self, id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Remove all registrations and named executors.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Sorted identifiers of all registrations.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Make `executor` available as `name` to factories of [`Registry::executor_factory`].
    pub fn register_executor(&self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), executor);
    }

    /// ExecutorFactory which looks up the executor `name` each time it's
    /// called, so that it may be registered before the executor exists.
    pub fn executor_factory(&self, name: impl Into<String>) -> ExecutorFactory {
        let executors = self.executors.clone();
        let name = name.into();

        Arc::new(move || {
            executors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&name)
                .cloned()
                .ok_or_else(|| Error::ExecutorMissing(name.clone()))
        })
    }

    /// Render `template` of registration `id` against `volume` and resolve it.
    pub fn get_sql(&self, id: &str, template: &str, volume: Volume) -> Result<Generated, Error> {
        let Registration { templates, .. } = self.lookup(id)?;

        let mut event = Event::begin(Op::Render, template);
        let rendered = templates.render(template, volume);
        event.output = rendered.as_ref().ok().map(|r| r.named_sql.clone());
        (self.handler)(&event.finish(rendered.as_ref().err()));

        let Rendered { named_sql, volume } = rendered?;
        let sql = self.resolver.to_sql(&named_sql, &volume)?;

        Ok(Generated {
            sql,
            named_sql,
            volume,
        })
    }

    /// Render, resolve, and execute `template` of registration `id`,
    /// decoding its Outcome as a `T`.
    pub async fn exec_sql_tpl<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        id: &str,
        template: &str,
        volume: Volume,
    ) -> Result<T, Error> {
        let Generated { sql, .. } = self.get_sql(id, template, volume)?;
        self.exec_sql(ctx, id, &sql).await
    }

    /// Execute literal `sql` with the executor of registration `id`,
    /// decoding its Outcome as a `T`.
    pub async fn exec_sql<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        id: &str,
        sql: &str,
    ) -> Result<T, Error> {
        let executor = self.executor(id)?;
        executor.exec_or_query(ctx, sql).await?.decode()
    }

    fn executor(&self, id: &str) -> Result<Arc<dyn Executor>, Error> {
        match self.lookup(id)?.executor {
            Some(factory) => factory(),
            None => Err(Error::ExecutorMissing(id.to_string())),
        }
    }
}
