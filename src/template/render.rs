//! `{{ .Var }}` substitution shared by boot commands and provisioner
//! command templates.

use std::collections::BTreeMap;

use thiserror::Error;

/// Values substituted into `{{ .Name }}` expressions.
pub type TemplateVars = BTreeMap<String, String>;

/// Errors raised while rendering a string template.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RenderError {
    /// The template refers to a variable that was not provided.
    #[error("unknown variable {name:?}")]
    UnknownVariable {
        /// Variable name without the leading dot.
        name: String,
    },
    /// A `{{` has no matching `}}`.
    #[error("unterminated template expression")]
    Unterminated,
}

/// Replaces every `{{ .Var }}` expression in `template` with its value.
///
/// # Errors
///
/// Returns [`RenderError::UnknownVariable`] when a name is missing from
/// `vars` and [`RenderError::Unterminated`] for a dangling `{{`.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((before, after)) = rest.split_once("{{") {
        out.push_str(before);
        let (expr, tail) = after.split_once("}}").ok_or(RenderError::Unterminated)?;
        let name = expr.trim().trim_start_matches('.');
        let value = vars
            .get(name)
            .ok_or_else(|| RenderError::UnknownVariable {
                name: name.to_owned(),
            })?;
        out.push_str(value);
        rest = tail;
    }
    out.push_str(rest);
    Ok(out)
}
