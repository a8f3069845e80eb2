//! The form/resume protocol.
//!
//! A form flow is an explicit iterator-style contract: ask it for the
//! next page, validate the submitted input against that page, feed the
//! validated input back, repeat until it returns the merged result.
//! `post_form` drives a flow over a list of submitted pages and either
//! completes or reports the next page to present.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::state::{merge, State};

/// Field types a form page can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Uuid,
    Object,
}

/// A single declared form field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A per-field validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// A declarative page of user input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormPage {
    pub title: String,
    pub fields: Vec<FormField>,
}

impl FormPage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            kind,
            required: true,
            nullable: false,
            default: None,
        });
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            kind,
            required: false,
            nullable: false,
            default: None,
        });
        self
    }

    pub fn nullable_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            kind,
            required: false,
            nullable: true,
            default: None,
        });
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.required = false;
            last.default = Some(default);
        }
        self
    }

    /// JSON-schema style rendering presented to the caller.
    pub fn schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let type_name = match field.kind {
                FieldKind::Text | FieldKind::Uuid => "string",
                FieldKind::Number => "number",
                FieldKind::Boolean => "boolean",
                FieldKind::Object => "object",
            };
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), json!(type_name));
            if let Some(default) = &field.default {
                prop.insert("default".into(), default.clone());
            }
            if field.nullable {
                prop.insert("nullable".into(), json!(true));
            }
            properties.insert(field.name.clone(), Value::Object(prop));
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "title": self.title,
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Validate a submitted page against the declaration.
    ///
    /// Returns the cleaned input: defaults applied, empty strings for
    /// nullable fields normalized to null.
    pub fn validate(&self, input: &State) -> Result<State, Vec<FieldError>> {
        let mut errors = Vec::new();
        let mut cleaned = State::new();

        for field in &self.fields {
            let value = match input.get(&field.name) {
                Some(v) => v.clone(),
                None => match (&field.default, field.required) {
                    (Some(default), _) => default.clone(),
                    (None, true) => {
                        errors.push(FieldError {
                            field: field.name.clone(),
                            message: "field is required".into(),
                        });
                        continue;
                    }
                    (None, false) => continue,
                },
            };

            // Empty strings submitted for nullable fields become null.
            let value = match value {
                Value::String(s) if s.is_empty() && field.nullable => Value::Null,
                other => other,
            };

            if !value.is_null() {
                let ok = match field.kind {
                    FieldKind::Text => value.is_string(),
                    FieldKind::Number => value.is_number(),
                    FieldKind::Boolean => value.is_boolean(),
                    FieldKind::Object => value.is_object(),
                    FieldKind::Uuid => value
                        .as_str()
                        .map(|s| uuid::Uuid::parse_str(s).is_ok())
                        .unwrap_or(false),
                };
                if !ok {
                    errors.push(FieldError {
                        field: field.name.clone(),
                        message: format!("expected {:?}", field.kind).to_lowercase(),
                    });
                    continue;
                }
            } else if !field.nullable {
                errors.push(FieldError {
                    field: field.name.clone(),
                    message: "field is not nullable".into(),
                });
                continue;
            }

            cleaned.insert(field.name.clone(), value);
        }

        if errors.is_empty() {
            Ok(cleaned)
        } else {
            Err(errors)
        }
    }
}

/// What a form flow produces when driven.
pub enum FlowStep {
    /// Another page must be presented and submitted.
    Page(FormPage),
    /// The flow is complete; the value is the merged, validated result.
    Done(State),
}

/// An iterator-style form wizard.
///
/// `next(None)` yields the first page; each subsequent call feeds the
/// validated input of the page previously yielded.
pub trait FormFlow: Send {
    fn next(&mut self, input: Option<State>) -> FlowStep;
}

/// Produces a form flow for a given process state.
pub type FormFactory = Arc<dyn Fn(&State) -> Box<dyn FormFlow> + Send + Sync>;

/// Errors surfaced while driving a form.
#[derive(Debug, Error)]
pub enum FormError {
    /// More input is needed; carries the schema of the next page.
    #[error("form not complete")]
    NotComplete { form: Value },

    /// Submitted input failed validation.
    #[error("form input invalid")]
    Validation { errors: Vec<FieldError> },
}

/// A single-page flow returning the validated input as its result.
struct SinglePageFlow {
    page: Option<FormPage>,
}

impl FormFlow for SinglePageFlow {
    fn next(&mut self, input: Option<State>) -> FlowStep {
        match (self.page.take(), input) {
            (Some(page), None) => FlowStep::Page(page),
            (_, Some(input)) => FlowStep::Done(input),
            (None, None) => FlowStep::Done(State::new()),
        }
    }
}

/// A fixed sequence of pages whose validated inputs are merged in order.
struct PagesFlow {
    pending: std::vec::IntoIter<FormPage>,
    collected: State,
}

impl FormFlow for PagesFlow {
    fn next(&mut self, input: Option<State>) -> FlowStep {
        if let Some(input) = input {
            self.collected = merge(std::mem::take(&mut self.collected), input);
        }
        match self.pending.next() {
            Some(page) => FlowStep::Page(page),
            None => FlowStep::Done(std::mem::take(&mut self.collected)),
        }
    }
}

/// A form factory for a single page.
pub fn form(page: FormPage) -> FormFactory {
    Arc::new(move |_state| {
        Box::new(SinglePageFlow {
            page: Some(page.clone()),
        })
    })
}

/// A form factory for a multi-page wizard.
pub fn wizard(pages: Vec<FormPage>) -> FormFactory {
    Arc::new(move |_state| {
        Box::new(PagesFlow {
            pending: pages.clone().into_iter(),
            collected: State::new(),
        })
    })
}

/// A form factory built from the process state.
pub fn form_with<F>(f: F) -> FormFactory
where
    F: Fn(&State) -> FormPage + Send + Sync + 'static,
{
    Arc::new(move |state| {
        Box::new(SinglePageFlow {
            page: Some(f(state)),
        })
    })
}

/// The default initial form: a single empty page.
///
/// Every workflow needs an initial form even when no input is required,
/// so starting always takes an explicit (possibly empty) submission.
pub fn no_form() -> FormFactory {
    form(FormPage::new("Start"))
}

/// Drive a form flow over the submitted pages.
///
/// Each submitted page is validated against the page the flow yields
/// before being fed back. Missing pages raise [`FormError::NotComplete`]
/// with the next schema; extra pages are ignored.
pub fn post_form(
    factory: &FormFactory,
    state: &State,
    user_inputs: &[State],
) -> Result<State, FormError> {
    let mut flow = factory(state);
    let mut inputs = user_inputs.iter();
    let mut pending: Option<State> = None;

    loop {
        match flow.next(pending.take()) {
            FlowStep::Done(result) => return Ok(result),
            FlowStep::Page(page) => {
                let submitted = inputs
                    .next()
                    .ok_or_else(|| FormError::NotComplete { form: page.schema() })?;
                let validated = page
                    .validate(submitted)
                    .map_err(|errors| FormError::Validation { errors })?;
                pending = Some(validated);
            }
        }
    }
}
