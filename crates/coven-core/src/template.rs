//! Template rendering for spells and `when`/`command` expressions (C1).
//!
//! See spec Section 4.1. `render(template, context) -> string | error`
//! resolves `{{ ... }}` placeholders against a [`Context`](crate::context::Context).
//! Undefined variable references fail with [`TemplateError::Undefined`];
//! missing keys do not silently produce the empty string except through an
//! explicit `default` operator. Rendering is pure.

use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("undefined template variable: {0}")]
    Undefined(String),
    #[error("malformed template expression {0:?}: {1}")]
    Malformed(String, String),
    #[error("unterminated placeholder (missing closing '}}}}')")]
    Unterminated,
}

/// Render a template string against a context, replacing every `{{ ... }}`
/// placeholder with its resolved value. Literal text outside placeholders
/// passes through unchanged.
pub fn render(template: &str, context: &Context) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(TemplateError::Unterminated);
        };
        let expr_src = after_open[..close].trim();
        let value = eval_source(expr_src, context)?;
        out.push_str(&value);
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// True if `render`ing `template` would be truthy for a `when` gate
/// (spec Section 4.1 guarantees): `"true"`, non-empty, or a non-zero
/// numeric string is truthy; `"false"`, `""`, `"0"` are falsy.
pub fn is_truthy(rendered: &str) -> bool {
    !matches!(rendered, "false" | "" | "0")
}

/// Evaluate a `when` template directly to a boolean, per the truthy rule.
/// A step whose `when` is absent always runs; callers handle that case
/// before calling this.
pub fn eval_when(template: &str, context: &Context) -> Result<bool, TemplateError> {
    Ok(is_truthy(&render(template, context)?))
}

fn eval_source(src: &str, context: &Context) -> Result<String, TemplateError> {
    let tokens = tokenize(src);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let expr = parser.parse_expr(src)?;
    if parser.pos != tokens.len() {
        return Err(TemplateError::Malformed(
            src.to_string(),
            "trailing tokens after expression".to_string(),
        ));
    }
    eval(&expr, context)
}

#[derive(Debug, Clone)]
enum Expr {
    Path(Vec<String>),
    Literal(String),
    Not(Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Default(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
}

fn tokenize(src: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                s.push(c);
            }
            tokens.push(format!("\"{s}"));
            continue;
        }
        let mut tok = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            tok.push(c);
            chars.next();
        }
        tokens.push(tok);
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn advance(&mut self) -> Option<&str> {
        let tok = self.tokens.get(self.pos).map(String::as_str);
        self.pos += 1;
        tok
    }

    fn parse_expr(&mut self, full_src: &str) -> Result<Expr, TemplateError> {
        let mut left = self.parse_primary(full_src)?;
        while self.peek() == Some("and") {
            self.advance();
            let right = self.parse_primary(full_src)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self, full_src: &str) -> Result<Expr, TemplateError> {
        let malformed = |msg: &str| TemplateError::Malformed(full_src.to_string(), msg.to_string());
        match self.advance() {
            Some("not") => {
                let inner = self.parse_primary(full_src)?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some("eq") => {
                let a = self.parse_primary(full_src)?;
                let b = self.parse_primary(full_src)?;
                Ok(Expr::Eq(Box::new(a), Box::new(b)))
            }
            Some("default") => {
                let a = self.parse_primary(full_src)?;
                let b = self.parse_primary(full_src)?;
                Ok(Expr::Default(Box::new(a), Box::new(b)))
            }
            Some(tok) if tok.starts_with('.') => {
                let path: Vec<String> = tok[1..].split('.').map(str::to_string).collect();
                if path.iter().any(String::is_empty) {
                    return Err(malformed("empty path segment"));
                }
                Ok(Expr::Path(path))
            }
            Some(tok) if tok.starts_with('"') => Ok(Expr::Literal(tok[1..].to_string())),
            Some(tok) => Ok(Expr::Literal(tok.to_string())),
            None => Err(malformed("empty expression")),
        }
    }
}

fn eval(expr: &Expr, context: &Context) -> Result<String, TemplateError> {
    match expr {
        Expr::Literal(s) => Ok(s.clone()),
        Expr::Path(segments) => resolve_path(segments, context),
        Expr::Not(inner) => {
            let v = eval(inner, context)?;
            Ok(bool_str(!is_truthy(&v)))
        }
        Expr::Eq(a, b) => {
            let va = eval(a, context)?;
            let vb = eval(b, context)?;
            Ok(bool_str(va == vb))
        }
        Expr::And(a, b) => {
            let va = eval(a, context)?;
            let vb = eval(b, context)?;
            Ok(bool_str(is_truthy(&va) && is_truthy(&vb)))
        }
        Expr::Default(a, b) => match eval(a, context) {
            Ok(v) => Ok(v),
            Err(TemplateError::Undefined(_)) => eval(b, context),
            Err(other) => Err(other),
        },
    }
}

fn bool_str(b: bool) -> String {
    if b { "true" } else { "false" }.to_string()
}

fn resolve_path(segments: &[String], context: &Context) -> Result<String, TemplateError> {
    let joined = || segments.join(".");
    let head = segments[0].as_str();

    match head {
        "workflow_id" => Ok(context.workflow_id.to_string()),
        "worktree_path" => Ok(context.worktree_path.clone()),
        "task" => {
            let field = segments
                .get(1)
                .ok_or_else(|| TemplateError::Undefined(joined()))?;
            match field.as_str() {
                "title" => Ok(context.task.title.clone()),
                "body" => Ok(context.task.body.clone()),
                "id" => Ok(context.task.id.to_string()),
                "priority" => Ok(context.task.priority.to_string()),
                "type" => Ok(context.task.task_type.as_str().to_string()),
                _ => Err(TemplateError::Undefined(joined())),
            }
        }
        "previous" => {
            let result = context
                .previous
                .as_ref()
                .ok_or_else(|| TemplateError::Undefined(joined()))?;
            resolve_step_fields(&segments[1..], result, &joined)
        }
        output_name => {
            let result = context
                .outputs
                .get(output_name)
                .ok_or_else(|| TemplateError::Undefined(joined()))?;
            if segments.len() == 1 {
                return Ok(result.stdout.trim().to_string());
            }
            resolve_step_fields(&segments[1..], result, &joined)
        }
    }
}

fn resolve_step_fields(
    fields: &[String],
    result: &crate::context::StepOutput,
    joined: &dyn Fn() -> String,
) -> Result<String, TemplateError> {
    let field = fields
        .first()
        .ok_or_else(|| TemplateError::Undefined(joined()))?;
    match field.as_str() {
        "success" => Ok(bool_str(result.success())),
        "failed" => Ok(bool_str(result.failed())),
        "status" => Ok(result.status.as_str().to_string()),
        "exit_code" => Ok(result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_default()),
        "output" => Ok(result.stdout.trim().to_string()),
        "outputs" => {
            let key = fields
                .get(1)
                .ok_or_else(|| TemplateError::Undefined(joined()))?;
            let structured = result
                .structured
                .as_ref()
                .ok_or_else(|| TemplateError::Undefined(joined()))?;
            structured
                .get(key)
                .map(value_to_string)
                .ok_or_else(|| TemplateError::Undefined(joined()))
        }
        _ => Err(TemplateError::Undefined(joined())),
    }
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepOutput;
    use crate::types::{Id, StepOutcome, Task, TaskStatus, TaskType};

    fn base_context() -> Context {
        Context::new(
            Id::from_string("wf-1"),
            Task {
                id: Id::from_string("task-1"),
                title: "Fix the thing".into(),
                body: "details".into(),
                task_type: TaskType::Bug,
                priority: 0,
                labels: vec![],
                status: TaskStatus::InProgress,
                claimed_by: Some("wf-1".into()),
                parent_id: None,
                dependencies: vec![],
                created_at: chrono::Utc::now(),
            },
            "implement-bead",
            "/work/worktrees/task-1",
            "main",
        )
    }

    #[test]
    fn renders_literal_text_unchanged() {
        let ctx = base_context();
        assert_eq!(render("hello world", &ctx).unwrap(), "hello world");
    }

    #[test]
    fn renders_task_fields() {
        let ctx = base_context();
        assert_eq!(
            render("{{.task.title}}", &ctx).unwrap(),
            "Fix the thing"
        );
        assert_eq!(render("{{.task.type}}", &ctx).unwrap(), "bug");
    }

    #[test]
    fn renders_workflow_id_and_worktree_path() {
        let ctx = base_context();
        assert_eq!(render("{{.workflow_id}}", &ctx).unwrap(), "wf-1");
        assert_eq!(
            render("{{.worktree_path}}", &ctx).unwrap(),
            "/work/worktrees/task-1"
        );
    }

    #[test]
    fn undefined_output_fails_with_err_template() {
        let ctx = base_context();
        let err = render("{{.nonexistent}}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Undefined(_)));
    }

    #[test]
    fn default_operator_substitutes_on_undefined() {
        let ctx = base_context();
        assert_eq!(
            render("{{default .nonexistent \"fallback\"}}", &ctx).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn bare_output_reference_resolves_to_trimmed_stdout() {
        let mut ctx = base_context();
        ctx.record_output(
            "flag_result",
            StepOutput {
                status: StepOutcome::Success,
                exit_code: Some(0),
                stdout: "true\n".into(),
                duration_ms: 5,
                structured: None,
            },
        );
        assert_eq!(render("{{.flag_result}}", &ctx).unwrap(), "true");
    }

    #[test]
    fn not_operator_inverts_truthiness() {
        let mut ctx = base_context();
        ctx.record_output(
            "flag_result",
            StepOutput {
                status: StepOutcome::Success,
                exit_code: Some(0),
                stdout: "true".into(),
                duration_ms: 1,
                structured: None,
            },
        );
        assert_eq!(render("{{not .flag_result}}", &ctx).unwrap(), "false");
    }

    #[test]
    fn previous_success_and_failed() {
        let mut ctx = base_context();
        ctx.record_output(
            "maybe-fail",
            StepOutput {
                status: StepOutcome::Success,
                exit_code: Some(0),
                stdout: String::new(),
                duration_ms: 1,
                structured: None,
            },
        );
        assert_eq!(render("{{.previous.success}}", &ctx).unwrap(), "true");
        assert_eq!(render("{{not .previous.success}}", &ctx).unwrap(), "false");
    }

    #[test]
    fn previous_undefined_before_first_step() {
        let ctx = base_context();
        let err = render("{{.previous.success}}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Undefined(_)));
    }

    #[test]
    fn eq_operator_compares_values() {
        let ctx = base_context();
        assert_eq!(
            render("{{eq .task.type \"bug\"}}", &ctx).unwrap(),
            "true"
        );
        assert_eq!(
            render("{{eq .task.type \"feature\"}}", &ctx).unwrap(),
            "false"
        );
    }

    #[test]
    fn structured_outputs_key_lookup() {
        let mut ctx = base_context();
        ctx.record_output(
            "implement",
            StepOutput {
                status: StepOutcome::Success,
                exit_code: None,
                stdout: String::new(),
                duration_ms: 1,
                structured: Some(serde_json::json!({"files_changed": "3"})),
            },
        );
        assert_eq!(
            render("{{.implement.outputs.files_changed}}", &ctx).unwrap(),
            "3"
        );
    }

    #[test]
    fn is_truthy_rules() {
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("0"));
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(is_truthy("anything"));
    }

    #[test]
    fn rendering_is_pure_and_repeatable() {
        let ctx = base_context();
        let a = render("{{.task.title}} / {{.workflow_id}}", &ctx).unwrap();
        let b = render("{{.task.title}} / {{.workflow_id}}", &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let ctx = base_context();
        let err = render("{{.task.title", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated));
    }

    #[test]
    fn mixed_literal_and_placeholder_text() {
        let ctx = base_context();
        assert_eq!(
            render("Task: {{.task.title}}!", &ctx).unwrap(),
            "Task: Fix the thing!"
        );
    }
}
