//! Prompt templates.
//!
//! Templates use `{name}` placeholders. Rendering fails if any
//! placeholder is left unresolved, so a prompt with a hole in it never
//! reaches the model.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::errors::TemplateError;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a tested constant
    RE.get_or_init(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").unwrap())
}

/// A named prompt template with `{placeholder}` variables.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    name: String,
    body: String,
}

impl PromptTemplate {
    /// Creates a template from its name and body.
    #[must_use]
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// Template name, used in error messages and trace spans.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the template, substituting every placeholder.
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<String, TemplateError> {
        let mut missing = None;
        let rendered = placeholder_regex().replace_all(&self.body, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match vars.get(key) {
                Some(value) => value.clone(),
                None => {
                    if missing.is_none() {
                        missing = Some(key.to_string());
                    }
                    caps[0].to_string()
                }
            }
        });

        match missing {
            Some(variable) => Err(TemplateError::MissingVariable {
                template: self.name.clone(),
                variable,
            }),
            None => Ok(rendered.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_placeholders() {
        let template = PromptTemplate::new("score", "Case: {case}\nQuality: {quality}");
        let mut vars = HashMap::new();
        vars.insert("case", "kickback scheme".to_string());
        vars.insert("quality", "self-reported eligibility".to_string());

        let out = template.render(&vars).unwrap();
        assert_eq!(out, "Case: kickback scheme\nQuality: self-reported eligibility");
    }

    #[test]
    fn missing_variable_names_template_and_variable() {
        let template = PromptTemplate::new("score", "Case: {case}");
        let err = template.render(&HashMap::new()).unwrap_err();
        let TemplateError::MissingVariable { template, variable } = err;
        assert_eq!(template, "score");
        assert_eq!(variable, "case");
    }

    #[test]
    fn literal_braces_with_uppercase_are_left_alone() {
        let template = PromptTemplate::new("schema", r#"Respond with {{"name": "{name}"}}"#);
        let mut vars = HashMap::new();
        vars.insert("name", "x".to_string());
        // Only lowercase snake_case placeholders substitute; JSON-ish
        // brace content passes through.
        let out = template.render(&vars).unwrap();
        assert!(out.contains(r#""x""#));
    }
}
