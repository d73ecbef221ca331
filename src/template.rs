//! Step input templates
//!
//! Placeholders:
//! - `{{goal}}` - the request goal
//! - `{{param.KEY}}` - a request parameter
//! - `{{step.ID}}` - output of dependency `ID` (or of its fallback)
//! - `{{inputs}}` - every dependency output, labelled, in dependency order

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConclaveError;
use crate::types::{Step, StepId, WorkflowRequest};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-z_]+)(?:\.([^}\s]+))?\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// A placeholder found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Goal,
    Param(String),
    Step(StepId),
    Inputs,
}

/// List the placeholders of `template`, rejecting unknown forms
pub fn placeholders(template: &str) -> Result<Vec<Placeholder>, ConclaveError> {
    placeholder()
        .captures_iter(template)
        .map(|caps| {
            let kind = &caps[1];
            let arg = caps.get(2).map(|m| m.as_str());
            match (kind, arg) {
                ("goal", None) => Ok(Placeholder::Goal),
                ("inputs", None) => Ok(Placeholder::Inputs),
                ("param", Some(key)) => Ok(Placeholder::Param(key.to_string())),
                ("step", Some(id)) => Ok(Placeholder::Step(StepId::from(id))),
                _ => Err(ConclaveError::Template(format!(
                    "unsupported placeholder '{}'",
                    &caps[0]
                ))),
            }
        })
        .collect()
}

/// Check a step's template against its request before the plan is accepted.
///
/// Step placeholders must name declared dependencies.
pub fn validate(step: &Step, request: &WorkflowRequest) -> Result<(), ConclaveError> {
    for placeholder in placeholders(&step.input_template)? {
        match placeholder {
            Placeholder::Param(key) if !request.parameters.contains_key(&key) => {
                return Err(ConclaveError::InvalidPlan(format!(
                    "step '{}' references missing parameter '{}'",
                    step.step_id, key
                )));
            }
            Placeholder::Step(id) if !step.dependencies.contains(&id) => {
                return Err(ConclaveError::InvalidPlan(format!(
                    "step '{}' references '{}' which is not a dependency",
                    step.step_id, id
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Render `template` with the request and the outputs of dependencies
pub fn render(
    template: &str,
    request: &WorkflowRequest,
    inputs: &BTreeMap<StepId, String>,
) -> Result<String, ConclaveError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder().captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        rendered.push_str(&template[last..whole.start()]);
        last = whole.end();

        let arg = caps.get(2).map(|m| m.as_str());
        match (&caps[1], arg) {
            ("goal", None) => rendered.push_str(&request.goal),
            ("inputs", None) => rendered.push_str(&labelled(inputs)),
            ("param", Some(key)) => {
                let value = request.parameter_text(key).ok_or_else(|| {
                    ConclaveError::Template(format!("missing parameter '{key}'"))
                })?;
                rendered.push_str(&value);
            }
            ("step", Some(id)) => {
                let output = inputs.get(&StepId::from(id)).ok_or_else(|| {
                    ConclaveError::Template(format!("no output available for step '{id}'"))
                })?;
                rendered.push_str(output);
            }
            _ => {
                return Err(ConclaveError::Template(format!(
                    "unsupported placeholder '{}'",
                    whole.as_str()
                )))
            }
        }
    }

    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Outputs as `[id]` headed sections
pub fn labelled(inputs: &BTreeMap<StepId, String>) -> String {
    inputs
        .iter()
        .map(|(id, text)| format!("[{id}]\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WorkflowRequest {
        WorkflowRequest::new("summarize the reports")
            .with_parameter("audience", serde_json::json!("executives"))
    }

    fn inputs() -> BTreeMap<StepId, String> {
        [
            (StepId::from("fetch-1"), "alpha".to_string()),
            (StepId::from("fetch-2"), "beta".to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_render_goal_and_param() {
        let out = render("Goal: {{goal}} for {{ param.audience }}", &request(), &inputs()).unwrap();
        assert_eq!(out, "Goal: summarize the reports for executives");
    }

    #[test]
    fn test_render_step_output() {
        let out = render("Use {{step.fetch-2}}.", &request(), &inputs()).unwrap();
        assert_eq!(out, "Use beta.");
    }

    #[test]
    fn test_render_inputs_block() {
        let out = render("{{inputs}}", &request(), &inputs()).unwrap();
        assert_eq!(out, "[fetch-1]\nalpha\n\n[fetch-2]\nbeta");
    }

    #[test]
    fn test_render_missing_param() {
        let err = render("{{param.tone}}", &request(), &inputs()).unwrap_err();
        assert!(matches!(err, ConclaveError::Template(_)));
    }

    #[test]
    fn test_plain_text_untouched() {
        let out = render("no placeholders { here }", &request(), &BTreeMap::new()).unwrap();
        assert_eq!(out, "no placeholders { here }");
    }

    #[test]
    fn test_unknown_placeholder() {
        assert!(placeholders("{{whatever}}").is_err());
        assert!(placeholders("{{goal.extra}}").is_err());
    }

    #[test]
    fn test_validate_requires_dependency() {
        let request = request();
        let step = Step::new("sum", "summarize", "{{step.fetch-1}}");
        assert!(matches!(
            validate(&step, &request),
            Err(ConclaveError::InvalidPlan(_))
        ));

        let step = step.depends_on("fetch-1");
        assert!(validate(&step, &request).is_ok());
    }

    #[test]
    fn test_validate_missing_param() {
        let step = Step::new("a", "generic", "{{param.nope}}");
        assert!(validate(&step, &request()).is_err());
    }
}
