use std::fmt;

use serde::{Serialize, Serializer};

use super::error::ValidationError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    Single,
    MarriedFilingJointly,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Baseline,
    Converted,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::Baseline => f.write_str("baseline"),
            Scenario::Converted => f.write_str("converted"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LifeState {
    Alive,
    Deceased { year_index: u32 },
}

impl LifeState {
    pub fn is_alive(self) -> bool {
        matches!(self, LifeState::Alive)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Allocation {
    pub stock_pct: u32,
    pub expected_return: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SocialSecurity {
    pub amount: f64,
    pub start_age: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pension {
    pub amount: f64,
    pub has_cola: bool,
    pub survivorship_pct: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PersonCapital {
    pub bank_accounts: f64,
    pub brokerage_non_retirement: f64,
    pub crypto: f64,
    pub precious_metals: f64,
    pub before_tax_ira: f64,
    pub roth: f64,
}

impl PersonCapital {
    pub fn taxable_assets(&self) -> f64 {
        self.bank_accounts + self.brokerage_non_retirement + self.crypto + self.precious_metals
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Person {
    pub age: u32,
    pub longevity: u32,
    pub retirement_year: u32,
    pub social_security: SocialSecurity,
    pub pension: Pension,
    pub capital: PersonCapital,
    pub traditional_allocation: Allocation,
    pub roth_allocation: Allocation,
}

impl Person {
    pub fn remaining_years(&self) -> u32 {
        self.longevity.saturating_sub(self.age)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Household {
    Single(Person),
    Couple(Person, Person),
}

impl Household {
    pub fn people(&self) -> Vec<&Person> {
        match self {
            Household::Single(person) => vec![person],
            Household::Couple(first, second) => vec![first, second],
        }
    }

    /// Years from now until the longer-lived person reaches their longevity.
    pub fn horizon_years(&self) -> u32 {
        self.people()
            .iter()
            .map(|p| p.remaining_years())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Inheritance {
    pub amount: f64,
    pub year: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HouseholdIncome {
    pub taxable_income: f64,
    pub rental_income: f64,
    pub other_income: f64,
    pub inheritances: Vec<Inheritance>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Exclusions {
    pub emergency_fund: f64,
    pub large_purchases: f64,
}

impl Exclusions {
    pub fn reserve(&self) -> f64 {
        self.emergency_fund + self.large_purchases
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HouseholdProfile {
    pub household: Household,
    pub income: HouseholdIncome,
    pub exclusions: Exclusions,
}

fn person_field(name: &str, index: usize) -> String {
    format!("{name}_person{}", index + 1)
}

fn check_dollars(field: impl Into<String>, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::new(field, "must be a non-negative amount"));
    }
    Ok(())
}

fn check_allocation(
    allocation: &Allocation,
    pct_field: String,
    return_field: String,
) -> Result<(), ValidationError> {
    if allocation.stock_pct > 100 {
        return Err(ValidationError::new(pct_field, "must be between 0 and 100"));
    }
    if !allocation.expected_return.is_finite() || allocation.expected_return < 0.0 {
        return Err(ValidationError::new(return_field, "must be >= 0"));
    }
    Ok(())
}

impl HouseholdProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (idx, person) in self.household.people().into_iter().enumerate() {
            if person.age >= person.longevity {
                return Err(ValidationError::new(
                    person_field("longevity", idx),
                    format!("must be greater than age ({})", person.age),
                ));
            }

            let capital = &person.capital;
            for (name, value) in [
                ("bank_accounts", capital.bank_accounts),
                ("brokerage_non_retirement", capital.brokerage_non_retirement),
                ("crypto", capital.crypto),
                ("precious_metals", capital.precious_metals),
                ("before_tax_ira", capital.before_tax_ira),
                ("roth", capital.roth),
                ("social_security", person.social_security.amount),
                ("pension", person.pension.amount),
            ] {
                check_dollars(person_field(name, idx), value)?;
            }

            if person.social_security.amount > 0.0
                && !(62..=70).contains(&person.social_security.start_age)
            {
                return Err(ValidationError::new(
                    person_field("social_security_start_age", idx),
                    "must be between 62 and 70",
                ));
            }

            if !(0.0..=100.0).contains(&person.pension.survivorship_pct) {
                return Err(ValidationError::new(
                    person_field("pension_survivorship", idx),
                    "must be between 0 and 100",
                ));
            }

            check_allocation(
                &person.traditional_allocation,
                person_field("allocation_traditional", idx),
                person_field("return_traditional", idx),
            )?;
            check_allocation(
                &person.roth_allocation,
                person_field("allocation_roth", idx),
                person_field("return_roth", idx),
            )?;
        }

        check_dollars("taxable_income", self.income.taxable_income)?;
        check_dollars("rental_income", self.income.rental_income)?;
        check_dollars("other_income", self.income.other_income)?;
        for (idx, inheritance) in self.income.inheritances.iter().enumerate() {
            check_dollars(format!("inheritances[{idx}].amount"), inheritance.amount)?;
        }
        check_dollars("emergency_fund", self.exclusions.emergency_fund)?;
        check_dollars("large_purchases", self.exclusions.large_purchases)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SurvivorshipPolicy {
    #[default]
    BothSpouses,
    FirstPersonOnly,
    SecondPersonOnly,
}

impl SurvivorshipPolicy {
    pub fn applies_to(self, holder_index: usize) -> bool {
        match self {
            SurvivorshipPolicy::BothSpouses => true,
            SurvivorshipPolicy::FirstPersonOnly => holder_index == 0,
            SurvivorshipPolicy::SecondPersonOnly => holder_index == 1,
        }
    }
}

/// Benefit multipliers for claiming ages 62 through 70.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClaimingCurve {
    pub factors: [f64; 9],
}

impl ClaimingCurve {
    pub fn full_retirement_age_67() -> Self {
        Self {
            factors: [0.70, 0.75, 0.80, 0.8667, 0.9333, 1.0, 1.08, 1.16, 1.24],
        }
    }

    pub fn factor(&self, start_age: u32) -> f64 {
        let idx = start_age.clamp(62, 70) - 62;
        self.factors[idx as usize]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpendingPlan {
    pub annual_amount: f64,
    pub growth_rate: f64,
}

impl SpendingPlan {
    pub fn amount_for(&self, year_index: u32) -> f64 {
        self.annual_amount * (1.0 + self.growth_rate).powi(year_index as i32)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisConfig {
    pub as_of_year: u32,
    pub conversion_amount: Option<f64>,
    pub taxable_return: f64,
    pub pension_cola_rate: f64,
    pub spending: Option<SpendingPlan>,
    pub claiming_curve: Option<ClaimingCurve>,
    pub survivorship: SurvivorshipPolicy,
    pub filing_status: Option<FilingStatus>,
    pub strong_breakeven_fraction: f64,
}

impl AnalysisConfig {
    pub fn new(as_of_year: u32) -> Self {
        Self {
            as_of_year,
            conversion_amount: None,
            taxable_return: 0.04,
            pension_cola_rate: 0.02,
            spending: None,
            claiming_curve: None,
            survivorship: SurvivorshipPolicy::BothSpouses,
            filing_status: None,
            strong_breakeven_fraction: 0.5,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(amount) = self.conversion_amount {
            check_dollars("options.conversion_amount", amount)?;
        }
        if !self.taxable_return.is_finite() || self.taxable_return <= -1.0 {
            return Err(ValidationError::new(
                "options.taxable_return",
                "must be greater than -1",
            ));
        }
        if !self.pension_cola_rate.is_finite() || self.pension_cola_rate < 0.0 {
            return Err(ValidationError::new("options.pension_cola_rate", "must be >= 0"));
        }
        if let Some(plan) = self.spending {
            check_dollars("options.annual_spending", plan.annual_amount)?;
            if !plan.growth_rate.is_finite() || plan.growth_rate <= -1.0 {
                return Err(ValidationError::new(
                    "options.spending_growth",
                    "must be greater than -1",
                ));
            }
        }
        if !(self.strong_breakeven_fraction > 0.0 && self.strong_breakeven_fraction <= 1.0) {
            return Err(ValidationError::new(
                "options.strong_breakeven_fraction",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Strong,
    Moderate,
    NotRecommended,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakevenYears {
    Years(u32),
    Never,
}

impl BreakevenYears {
    pub fn years(self) -> Option<u32> {
        match self {
            BreakevenYears::Years(n) => Some(n),
            BreakevenYears::Never => None,
        }
    }
}

impl Serialize for BreakevenYears {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BreakevenYears::Years(n) => serializer.serialize_u32(*n),
            BreakevenYears::Never => serializer.serialize_str("never"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub recommendation: Recommendation,
    pub summary: String,
    pub conversion_tax_cost: f64,
    pub breakeven_years: BreakevenYears,
    pub lifetime_tax_savings: f64,
    pub projected_traditional_ira_value: f64,
    pub projected_roth_value: f64,
    pub key_factors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PersonYear {
    pub age: u32,
    pub alive: bool,
    pub traditional: f64,
    pub roth: f64,
    pub taxable: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearRecord {
    pub year_index: u32,
    pub calendar_year: u32,
    pub filing_status: FilingStatus,
    pub people: Vec<PersonYear>,
    pub ordinary_income: f64,
    pub social_security: f64,
    pub ss_taxable_fraction: f64,
    pub rmd: f64,
    pub conversion: f64,
    pub capital_gains: f64,
    pub income_cash: f64,
    pub spending: f64,
    pub tax_paid: f64,
    pub cumulative_taxes: f64,
    pub marginal_rate: f64,
    pub traditional_total: f64,
    pub roth_total: f64,
    pub taxable_total: f64,
    pub after_tax_net_worth: f64,
}

impl YearRecord {
    pub fn total_assets(&self) -> f64 {
        self.traditional_total + self.roth_total + self.taxable_total
    }
}
