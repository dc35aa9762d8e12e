//! Payload validation
//!
//! Validation is pure: it inspects a decoded payload and reports every broken
//! rule, in a stable order, without touching I/O.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// One broken rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    Invalid(Vec<FieldError>),
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationResult::Ok)
    }

    /// Collapse a list of errors; empty means valid.
    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        if errors.is_empty() {
            ValidationResult::Ok
        } else {
            ValidationResult::Invalid(errors)
        }
    }

    /// "field: reason; field: reason", used as the dead-letter error message
    pub fn describe(&self) -> String {
        match self {
            ValidationResult::Ok => String::new(),
            ValidationResult::Invalid(errors) => errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Structural and business-rule check for a decoded payload
pub trait Validator<T>: Send + Sync {
    fn validate(&self, payload: &T) -> ValidationResult;
}

impl<T, V: Validator<T> + ?Sized> Validator<T> for Arc<V> {
    fn validate(&self, payload: &T) -> ValidationResult {
        (**self).validate(payload)
    }
}

/// Adapts a closure into a [`Validator`].
pub struct FnValidator<F>(pub F);

impl<T, F> Validator<T> for FnValidator<F>
where
    F: Fn(&T) -> ValidationResult + Send + Sync,
{
    fn validate(&self, payload: &T) -> ValidationResult {
        (self.0)(payload)
    }
}

/// Runs the rules declared with `#[derive(validator::Validate)]`.
///
/// Field errors are sorted by field name, then by rule code, so the same bad
/// payload always yields the same message.
pub struct DeriveValidator<T>(PhantomData<fn(&T)>);

impl<T> DeriveValidator<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for DeriveValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: validator::Validate> Validator<T> for DeriveValidator<T> {
    fn validate(&self, payload: &T) -> ValidationResult {
        let Err(errors) = payload.validate() else {
            return ValidationResult::Ok;
        };

        let mut out: Vec<FieldError> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                let field = field.to_string();
                errs.iter().map(move |e| {
                    let reason = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    FieldError::new(field.clone(), reason)
                })
            })
            .collect();

        // Struct-level or nested failures carry no field entry
        if out.is_empty() {
            out.push(FieldError::new("_", errors.to_string()));
        }

        out.sort_by(|a, b| a.field.cmp(&b.field).then_with(|| a.reason.cmp(&b.reason)));
        ValidationResult::Invalid(out)
    }
}
