use crate::calc::formula::CalculationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    CalculationSyntax(#[from] CalculationSyntaxError),
}

/// Raised by calculation checks only; the data path never produces it.
#[derive(Debug, Error)]
#[error("invalid calculation{} `{formula}`: {reason}", subject(.virtual_point))]
pub struct CalculationSyntaxError {
    pub formula: String,
    pub virtual_point: Option<i64>,
    #[source]
    pub reason: CalculationError,
}

fn subject(virtual_point: &Option<i64>) -> String {
    match virtual_point {
        Some(id) => format!(" for vmp({id})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_message_names_virtual_point() {
        let err = CalculationSyntaxError {
            formula: "mp(1) +".into(),
            virtual_point: Some(4),
            reason: CalculationError::UnknownPoint(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("vmp(4)"), "{msg}");
        assert!(msg.contains("mp(1) +"), "{msg}");
    }

    #[test]
    fn test_syntax_error_converts_into_app_error() {
        let err: AppError = CalculationSyntaxError {
            formula: "vmp(2)".into(),
            virtual_point: None,
            reason: CalculationError::UnknownVirtualPoint(2),
        }
        .into();
        assert!(matches!(err, AppError::CalculationSyntax(_)));
    }
}
