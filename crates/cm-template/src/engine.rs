//! Template engine for config values and profile activation

use crate::error::TemplateResult;
use crate::filters;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;
use tracing::trace;

/// Template engine shared by the config resolver and the profile manager
///
/// Undefined variables are errors, so a typo in a template surfaces as a
/// resolution failure instead of an empty string.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        Self::register_filters(&mut env);
        Self::register_globals(&mut env);

        Self { env }
    }

    fn register_filters(env: &mut Environment<'static>) {
        env.add_filter("regex_replace", filters::regex_replace);
        env.add_filter("regex_match", filters::regex_match);
        env.add_filter("float", filters::to_float);
        env.add_filter("int", filters::to_int);
        env.add_filter("bool", filters::to_bool);
        env.add_filter("round", filters::round_filter);
        env.add_filter("clamp", filters::clamp);
    }

    fn register_globals(env: &mut Environment<'static>) {
        env.add_function("now", || chrono::Local::now().to_rfc3339());
        env.add_function("timestamp", || chrono::Utc::now().timestamp());
        env.add_function("iif", |condition: Value, if_true: Value, if_false: Option<Value>| {
            if condition.is_true() {
                if_true
            } else {
                if_false.unwrap_or(Value::from(""))
            }
        });
    }

    /// Render a template string against a context
    pub fn render(&self, template: &str, context: impl Serialize) -> TemplateResult<String> {
        trace!("Rendering template: {}", template);

        let tmpl = self.env.template_from_str(template)?;
        Ok(tmpl.render(context)?)
    }

    /// Evaluate a bare expression (no `{{ }}`) and return its value
    pub fn evaluate(
        &self,
        expression: &str,
        context: impl Serialize,
    ) -> TemplateResult<serde_json::Value> {
        let expr = self.env.compile_expression(expression)?;
        let value = expr.eval(context)?;
        Ok(serde_json::to_value(&value).unwrap_or(serde_json::Value::Null))
    }

    /// Decide whether a condition holds
    ///
    /// Template strings are rendered and the output compared against the
    /// truthy words; anything else is evaluated as an expression.
    pub fn is_truthy(&self, condition: &str, context: impl Serialize) -> TemplateResult<bool> {
        if Self::is_template(condition) {
            let rendered = self.render(condition, context)?;
            return Ok(matches!(
                rendered.trim().to_lowercase().as_str(),
                "true" | "yes" | "on" | "1"
            ));
        }

        let expr = self.env.compile_expression(condition)?;
        Ok(expr.eval(context)?.is_true())
    }

    /// Check if a string contains template syntax
    pub fn is_template(template: &str) -> bool {
        template.contains("{{") || template.contains("{%") || template.contains("{#")
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TemplateError;
    use serde_json::json;

    // ==================== Rendering ====================

    #[test]
    fn test_plain_text() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.render("Hello", json!({})).unwrap(), "Hello");
    }

    #[test]
    fn test_variable_substitution() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("Thanks {{ user }}!", json!({"user": "lordtocs"}))
            .unwrap();
        assert_eq!(result, "Thanks lordtocs!");
    }

    #[test]
    fn test_undefined_is_error() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{ missing }}", json!({}));
        assert!(matches!(result, Err(TemplateError::UndefinedVariable { .. })));
    }

    #[test]
    fn test_syntax_error() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{ user ", json!({"user": "x"}));
        assert!(matches!(result, Err(TemplateError::SyntaxError { .. })));
    }

    #[test]
    fn test_filters() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine.render("{{ amount | float * 2 }}", json!({"amount": "2.5"})).unwrap(),
            "5.0"
        );
        assert_eq!(engine.render("{{ 3.14159 | round(2) }}", json!({})).unwrap(), "3.14");
        assert_eq!(
            engine.render("{{ 'a  b' | regex_replace('\\\\s+', '_') }}", json!({})).unwrap(),
            "a_b"
        );
    }

    #[test]
    fn test_iif() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine.render("{{ iif(live, 'on', 'off') }}", json!({"live": true})).unwrap(),
            "on"
        );
    }

    // ==================== Conditions ====================

    #[test]
    fn test_evaluate_expression() {
        let engine = TemplateEngine::new();
        let value = engine.evaluate("viewers + 1", json!({"viewers": 41})).unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_is_truthy() {
        let engine = TemplateEngine::new();
        let ctx = json!({"scene": "gaming"});

        assert!(engine.is_truthy("scene == 'gaming'", &ctx).unwrap());
        assert!(!engine.is_truthy("scene == 'chatting'", &ctx).unwrap());
        assert!(engine.is_truthy("{{ scene == 'gaming' }}", &ctx).unwrap());
        assert!(!engine.is_truthy("{{ 'no' }}", &ctx).unwrap());
    }

    #[test]
    fn test_is_template() {
        assert!(TemplateEngine::is_template("{{ foo }}"));
        assert!(TemplateEngine::is_template("{% if x %}{% endif %}"));
        assert!(!TemplateEngine::is_template("plain text"));
    }
}
