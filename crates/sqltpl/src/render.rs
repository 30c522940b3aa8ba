use crate::{funcs, Error, Volume};
use handlebars::Handlebars;
use std::path::Path;

/// TemplateSet is a set of compiled SQL templates, each rendering into
/// named SQL with the function library available as helpers.
pub struct TemplateSet {
    reg: Handlebars<'static>,
}

/// Rendered is the output of a TemplateSet render.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// SQL with `:name` placeholders.
    pub named_sql: String,
    /// The input Volume, plus every value bound by helpers during the render.
    pub volume: Volume,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateSet")
            .field("names", &self.names())
            .finish()
    }
}

impl TemplateSet {
    pub fn new() -> Self {
        let mut reg = Handlebars::new();
        reg.register_escape_fn(handlebars::no_escape);
        funcs::register(&mut reg);

        Self { reg }
    }

    /// Compile `source` as template `name`, replacing any prior definition.
    /// Returns `name` if it was not previously defined.
    pub fn add_from_str(&mut self, name: &str, source: &str) -> Result<Vec<String>, Error> {
        let existed = self.reg.has_template(name);

        self.reg
            .register_template_string(name, source)
            .map_err(|err| Error::TemplateParse {
                name: name.to_string(),
                reason: err.to_string(),
            })?;

        Ok(if existed {
            Vec::new()
        } else {
            vec![name.to_string()]
        })
    }

    /// Compile every file of `dir` whose name ends with `suffix`, naming each
    /// template by its file name less the suffix. Returns newly-defined
    /// names in sorted order.
    pub fn add_from_dir(&mut self, dir: impl AsRef<Path>, suffix: &str) -> Result<Vec<String>, Error> {
        let dir = dir.as_ref();
        let read_err = |err: std::io::Error| Error::TemplateParse {
            name: dir.display().to_string(),
            reason: err.to_string(),
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            if !entry.file_type().map_err(read_err)?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(suffix) {
                files.push((name.to_string(), entry.path()));
            }
        }
        files.sort();

        let mut added = Vec::new();
        for (name, path) in files {
            let source = std::fs::read_to_string(&path).map_err(|err| Error::TemplateParse {
                name: name.clone(),
                reason: format!("reading {}: {err}", path.display()),
            })?;
            added.extend(self.add_from_str(&name, &source)?);
        }
        tracing::debug!(dir = %dir.display(), ?added, "loaded SQL templates");

        Ok(added)
    }

    /// Sorted names of all defined templates.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.reg.get_templates().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reg.has_template(name)
    }

    /// Render template `name` against `volume`, which is both the data
    /// context of the template and the target of values bound by helpers.
    pub fn render(&self, name: &str, mut volume: Volume) -> Result<Rendered, Error> {
        if !self.reg.has_template(name) {
            return Err(Error::TemplateMissing(name.to_string()));
        }
        // Helpers bind into the scope's Volume, not the data context.
        let context = handlebars::Context::wraps(&volume).map_err(|err| Error::TemplateRender {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        let result = {
            let mut scope = funcs::enter(&mut volume);
            let result = self.reg.render_with_context(name, &context);
            match (result, scope.take_failure()) {
                (Ok(out), _) => Ok(out),
                (Err(_), Some(failure)) => Err(failure),
                (Err(err), None) => Err(Error::TemplateRender {
                    name: name.to_string(),
                    reason: err.to_string(),
                }),
            }
        };
        let named_sql = result?.replace("\r\n", "\n").trim().to_string();

        Ok(Rendered { named_sql, volume })
    }
}
