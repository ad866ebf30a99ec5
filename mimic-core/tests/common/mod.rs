#![allow(dead_code)]

use std::sync::Mutex;

use mimic_core::services::model::{ModelBackend, ModelError, ModelRequest, Role};

/// In-process backend answering from a closure and recording every request.
pub struct ScriptedBackend<F> {
    respond: F,
    seen: Mutex<Vec<ModelRequest>>,
}

impl<F> ScriptedBackend<F>
where
    F: Fn(&ModelRequest) -> Result<String, ModelError>,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl<F> ModelBackend for ScriptedBackend<F>
where
    F: Fn(&ModelRequest) -> Result<String, ModelError>,
{
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.seen.lock().unwrap().push(request.clone());
        (self.respond)(request)
    }
}

/// Which call a request is, from its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Persona,
    Social,
    Email,
    Text,
}

pub fn classify(req: &ModelRequest) -> Call {
    if req.messages.iter().any(|m| m.role == Role::System) {
        return Call::Persona;
    }
    match req.max_tokens {
        150 => Call::Social,
        200 => Call::Email,
        _ => Call::Text,
    }
}

/// Canned answers; any call listed in `failing` errors instead.
pub fn canned(failing: &'static [Call]) -> impl Fn(&ModelRequest) -> Result<String, ModelError> {
    move |req| {
        let call = classify(req);
        if failing.contains(&call) {
            return Err(ModelError::Status {
                status: 503,
                body: "overloaded".into(),
            });
        }
        Ok(match call {
            Call::Persona => "A pragmatic security engineer.".to_string(),
            Call::Social => "social post".to_string(),
            Call::Email => "email body".to_string(),
            Call::Text => "hey, read this".to_string(),
        })
    }
}
