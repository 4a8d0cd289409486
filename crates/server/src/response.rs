use serde::Serialize;

/// JSON error body shared by the HTTP handlers.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    field: &'static str,
    message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

impl<'a> ErrorBody<'a> {
    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            reason: None,
            details: Some(details),
        }
    }

    pub fn unauthorized(reason: &'a str) -> Self {
        Self {
            error: "unauthorized",
            reason: Some(reason),
            details: None,
        }
    }

    pub fn forbidden(reason: &'a str) -> Self {
        Self {
            error: "forbidden",
            reason: Some(reason),
            details: None,
        }
    }

    pub fn simple(error: &'a str) -> Self {
        Self {
            error,
            reason: None,
            details: None,
        }
    }
}

/// Trims `value` and records a "must be provided" error when it ends up empty.
pub fn required_field(
    value: Option<String>,
    field: &'static str,
    errors: &mut Vec<FieldError>,
) -> String {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        errors.push(FieldError::new(field, "must be provided"));
    }
    value
}
