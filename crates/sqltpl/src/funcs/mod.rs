//! Template function library.
//!
//! Every function here is available both as a plain Rust function and as a
//! handlebars helper registered into each [`crate::TemplateSet`]. Helpers which
//! bind values (`in`, `insert`, `zeroTime`, ...) write into the *active*
//! Volume: the Volume of the render currently running on this thread.
use crate::{Error, Volume};
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
    RenderError, RenderErrorReason,
};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;

mod format;
mod params;
mod text;

pub use format::{is_blank, no_empty, sprintf};
pub use params::{
    current_time, in_list, in_values, insert, insert_value, permanent_time, zero_time, Record,
    Serialized, IN_INDEX, PERMANENT_TIME, TIME_FORMAT, ZERO_TIME,
};
pub use text::{fen2yuan, md5_lower, snake_case, timestamp_second, to_camel, to_lower_camel, xid};

/// PreComma emits "" the first time it's called and "," every time after.
/// It separates conditionally-included fragments within a template loop.
#[derive(Debug, Default, Clone)]
pub struct PreComma {
    started: bool,
}

impl PreComma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_comma(&mut self) -> &'static str {
        if self.started {
            ","
        } else {
            self.started = true;
            ""
        }
    }
}

// State of the render running on this thread.
struct Scope {
    volume: Volume,
    commas: BTreeMap<String, PreComma>,
    // First helper failure, which is more precise than the RenderError it becomes.
    failure: Option<Error>,
}

thread_local!(static SCOPE: RefCell<Option<Scope>> = RefCell::new(None));

/// ScopeGuard makes a Volume the active volume of this thread until dropped,
/// at which point the (updated) Volume is handed back and any enclosing
/// scope is restored.
pub(crate) struct ScopeGuard<'v> {
    volume: &'v mut Volume,
    prior: Option<Scope>,
}

pub(crate) fn enter(volume: &mut Volume) -> ScopeGuard<'_> {
    let scope = Scope {
        volume: std::mem::take(volume),
        commas: BTreeMap::new(),
        failure: None,
    };
    let prior = SCOPE.with(|s| s.replace(Some(scope)));

    ScopeGuard { volume, prior }
}

impl ScopeGuard<'_> {
    /// Take the first error raised by a helper during this scope.
    pub(crate) fn take_failure(&mut self) -> Option<Error> {
        SCOPE.with(|s| s.borrow_mut().as_mut().and_then(|scope| scope.failure.take()))
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let scope = SCOPE.with(|s| s.replace(self.prior.take()));
        if let Some(scope) = scope {
            *self.volume = scope.volume;
        }
    }
}

fn with_scope<R>(
    func: &'static str,
    f: impl FnOnce(&mut Scope) -> Result<R, Error>,
) -> Result<R, RenderError> {
    SCOPE.with(|s| {
        let mut s = s.borrow_mut();
        let Some(scope) = s.as_mut() else {
            return Err(RenderError::from(RenderErrorReason::Other(format!(
                "{func} may only be called while rendering a template"
            ))));
        };
        match f(scope) {
            Ok(out) => Ok(out),
            Err(err) => {
                let reason = RenderErrorReason::Other(err.to_string());
                scope.failure.get_or_insert(err);
                Err(RenderError::from(reason))
            }
        }
    })
}

fn param<'a>(h: &'a Helper, index: usize) -> &'a Value {
    static NULL: Value = Value::Null;
    h.param(index).map(|p| p.value()).unwrap_or(&NULL)
}

/// Register the function library into `reg`.
pub(crate) fn register(reg: &mut Handlebars<'_>) {
    reg.register_helper("zeroTime", Box::new(zero_time_helper));
    reg.register_helper("currentTime", Box::new(current_time_helper));
    reg.register_helper("permanentTime", Box::new(permanent_time_helper));
    reg.register_helper("in", Box::new(in_helper));
    reg.register_helper("insert", Box::new(insert_helper));
    reg.register_helper("noEmpty", Box::new(no_empty_helper));
    reg.register_helper("md5lower", Box::new(md5_lower_helper));
    reg.register_helper("fen2yuan", Box::new(fen2yuan_helper));
    reg.register_helper("timestampSecond", Box::new(timestamp_second_helper));
    reg.register_helper("xid", Box::new(xid_helper));
    reg.register_helper("newPreComma", Box::new(new_pre_comma_helper));
    reg.register_helper("preComma", Box::new(pre_comma_helper));
    reg.register_helper("contains", Box::new(contains));
    reg.register_helper("toCamel", Box::new(to_camel_helper));
    reg.register_helper("toLowerCamel", Box::new(to_lower_camel_helper));
    reg.register_helper("snakeCase", Box::new(snake_case_helper));
}

handlebars_helper!(contains: |s: str, substr: str| s.contains(substr));
handlebars_helper!(to_camel_helper: |s: str| to_camel(s));
handlebars_helper!(to_lower_camel_helper: |s: str| to_lower_camel(s));
handlebars_helper!(snake_case_helper: |s: str| snake_case(s));

fn zero_time_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let placeholder = with_scope("zeroTime", |scope| Ok(zero_time(&mut scope.volume)))?;
    out.write(&placeholder)?;
    Ok(())
}

fn current_time_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let placeholder = with_scope("currentTime", |scope| Ok(current_time(&mut scope.volume)))?;
    out.write(&placeholder)?;
    Ok(())
}

fn permanent_time_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let placeholder =
        with_scope("permanentTime", |scope| Ok(permanent_time(&mut scope.volume)))?;
    out.write(&placeholder)?;
    Ok(())
}

fn in_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let data = param(h, 0);
    let placeholders = with_scope("in", |scope| in_list(&mut scope.volume, data))?;
    out.write(&placeholders)?;
    Ok(())
}

fn insert_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let data = param(h, 0);
    let fragment = with_scope("insert", |scope| insert_value(&mut scope.volume, data))?;
    out.write(&fragment)?;
    Ok(())
}

fn no_empty_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let Some(format) = param(h, 0).as_str() else {
        return Err(RenderErrorReason::Other(
            "noEmpty: expected a format string as its first argument".to_string(),
        )
        .into());
    };
    out.write(&no_empty(format, param(h, 1)))?;
    Ok(())
}

fn md5_lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let parts: Vec<String> = h
        .params()
        .iter()
        .map(|p| match p.value() {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect();
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();

    out.write(&md5_lower(&parts))?;
    Ok(())
}

fn fen2yuan_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&fen2yuan(param(h, 0)))?;
    Ok(())
}

fn timestamp_second_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&timestamp_second().to_string())?;
    Ok(())
}

fn xid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&xid())?;
    Ok(())
}

fn comma_group(h: &Helper) -> String {
    param(h, 0).as_str().unwrap_or_default().to_string()
}

fn new_pre_comma_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    _: &mut dyn Output,
) -> HelperResult {
    let group = comma_group(h);
    with_scope("newPreComma", |scope| {
        scope.commas.insert(group, PreComma::new());
        Ok(())
    })
}

fn pre_comma_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let group = comma_group(h);
    let comma = with_scope("preComma", |scope| {
        Ok(scope.commas.entry(group).or_default().pre_comma())
    })?;
    out.write(comma)?;
    Ok(())
}
