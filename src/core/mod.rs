mod compare;
mod engine;
mod error;
#[cfg(test)]
mod fixtures;
mod income;
mod tax;
mod tax_tables;
mod types;

pub use compare::{Comparison, analyze, analyze_with_rules, compare_projections, format_dollars};
pub use engine::{
    ConversionOutcome, DeathEvent, ProjectionRun, RunEvents, after_tax_net_worth, run_projection,
};
pub use error::{EngineError, TaxRuleError, ValidationError};
pub use income::{IncomeBreakdown, IncomeResolver, PersonIncome, PersonStatus, rmd_amount};
pub use tax::{TaxBreakdown, TaxInputs, compute_tax, total_tax};
pub use tax_tables::{
    Bracket, RMD_START_AGE, StatusSchedule, TaxRuleBook, TaxYearTable, rmd_divisor,
    ss_taxable_fraction,
};
pub use types::{
    Allocation, AnalysisConfig, AnalysisResult, BreakevenYears, ClaimingCurve, Exclusions,
    FilingStatus, Household, HouseholdIncome, HouseholdProfile, Inheritance, LifeState, Pension,
    Person, PersonCapital, PersonYear, Recommendation, Scenario, SocialSecurity, SpendingPlan,
    SurvivorshipPolicy, YearRecord,
};
