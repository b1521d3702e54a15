use thiserror::Error;

use super::types::Scenario;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum TaxRuleError {
    #[error("no tax table for tax year {year}")]
    UnsupportedTaxYear { year: u32 },

    #[error("required minimum distributions do not apply at age {age}")]
    UnsupportedAge { age: u32 },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("tax rule lookup failed: {0}")]
    TaxRules(#[from] TaxRuleError),

    #[error(
        "numeric instability in {scenario} run at year {year_index}: {account} balance became {value}"
    )]
    NumericInstability {
        scenario: Scenario,
        year_index: u32,
        account: &'static str,
        value: f64,
    },
}
