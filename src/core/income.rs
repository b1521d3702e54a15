use super::error::TaxRuleError;
use super::tax_tables::{RMD_START_AGE, rmd_divisor};
use super::types::{AnalysisConfig, ClaimingCurve, HouseholdProfile, LifeState, Person};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonStatus {
    pub age: u32,
    pub life: LifeState,
    pub traditional_balance: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PersonIncome {
    pub pension: f64,
    pub survivor_pension: f64,
    pub social_security: f64,
    pub forced_withdrawal: f64,
    pub ordinary_income: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomeBreakdown {
    pub people: Vec<PersonIncome>,
    pub wages: f64,
    pub rental_income: f64,
    pub other_income: f64,
    pub inheritance: f64,
}

impl IncomeBreakdown {
    pub fn household_ordinary_income(&self) -> f64 {
        self.wages
            + self.rental_income
            + self.other_income
            + self.people.iter().map(|p| p.ordinary_income).sum::<f64>()
    }

    pub fn social_security(&self) -> f64 {
        self.people.iter().map(|p| p.social_security).sum()
    }

    pub fn forced_withdrawal(&self) -> f64 {
        self.people.iter().map(|p| p.forced_withdrawal).sum()
    }

    /// Cash arriving from outside the household's accounts this year.
    pub fn external_cash(&self) -> f64 {
        self.household_ordinary_income() - self.forced_withdrawal()
            + self.social_security()
            + self.inheritance
    }
}

pub fn social_security_benefit(person: &Person, age: u32, curve: Option<&ClaimingCurve>) -> f64 {
    let ss = &person.social_security;
    if ss.amount <= 0.0 || age < ss.start_age {
        return 0.0;
    }
    let factor = curve.map(|c| c.factor(ss.start_age)).unwrap_or(1.0);
    ss.amount * factor
}

pub fn pension_benefit(person: &Person, calendar_year: u32, first_year: u32, cola_rate: f64) -> f64 {
    let pension = &person.pension;
    let start_year = person.retirement_year.max(first_year);
    if pension.amount <= 0.0 || calendar_year < start_year {
        return 0.0;
    }
    if pension.has_cola {
        pension.amount * (1.0 + cola_rate).powi((calendar_year - start_year) as i32)
    } else {
        pension.amount
    }
}

pub fn rmd_amount(traditional_balance: f64, age: u32) -> Result<f64, TaxRuleError> {
    if age < RMD_START_AGE || traditional_balance <= 0.0 {
        return Ok(0.0);
    }
    Ok(traditional_balance / rmd_divisor(age)?)
}

pub struct IncomeResolver<'a> {
    profile: &'a HouseholdProfile,
    config: &'a AnalysisConfig,
}

impl<'a> IncomeResolver<'a> {
    pub fn new(profile: &'a HouseholdProfile, config: &'a AnalysisConfig) -> Self {
        Self { profile, config }
    }

    pub fn resolve(
        &self,
        year_index: u32,
        statuses: &[PersonStatus],
    ) -> Result<IncomeBreakdown, TaxRuleError> {
        let people = self.profile.household.people();
        let calendar_year = self.config.as_of_year + year_index;
        let curve = self.config.claiming_curve.as_ref();
        let mut breakdown = IncomeBreakdown {
            people: Vec::with_capacity(people.len()),
            ..IncomeBreakdown::default()
        };

        for (idx, (person, status)) in people.iter().zip(statuses).enumerate() {
            if !status.life.is_alive() {
                breakdown.people.push(PersonIncome::default());
                continue;
            }

            let pension = pension_benefit(
                person,
                calendar_year,
                self.config.as_of_year,
                self.config.pension_cola_rate,
            );
            let mut social_security = social_security_benefit(person, status.age, curve);
            let mut survivor_pension = 0.0;

            for (other_idx, (other, other_status)) in people.iter().zip(statuses).enumerate() {
                if other_idx == idx || other_status.life.is_alive() {
                    continue;
                }
                if self.config.survivorship.applies_to(other_idx) {
                    survivor_pension += pension_benefit(
                        other,
                        calendar_year,
                        self.config.as_of_year,
                        self.config.pension_cola_rate,
                    ) * other.pension.survivorship_pct
                        / 100.0;
                }
                if other.social_security.start_age <= other.longevity {
                    let deceased_benefit =
                        social_security_benefit(other, other.social_security.start_age, curve);
                    social_security = social_security.max(deceased_benefit);
                }
            }

            let forced_withdrawal = rmd_amount(status.traditional_balance, status.age)?;
            breakdown.people.push(PersonIncome {
                pension,
                survivor_pension,
                social_security,
                forced_withdrawal,
                ordinary_income: pension + survivor_pension + forced_withdrawal,
            });
        }

        let living_retirement_year = people
            .iter()
            .zip(statuses)
            .filter(|(_, status)| status.life.is_alive())
            .map(|(person, _)| person.retirement_year)
            .max();
        let anyone_alive = living_retirement_year.is_some();
        let income = &self.profile.income;

        if anyone_alive
            && (year_index == 0 || living_retirement_year.is_some_and(|y| calendar_year < y))
        {
            breakdown.wages = income.taxable_income;
        }
        if anyone_alive {
            breakdown.rental_income = income.rental_income;
            breakdown.other_income = income.other_income;
            breakdown.inheritance = income
                .inheritances
                .iter()
                .filter(|i| i.year == calendar_year)
                .map(|i| i.amount)
                .sum();
        }

        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::person;
    use crate::core::types::{Allocation, Exclusions, Household, HouseholdIncome, Inheritance};
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn alive(age: u32, traditional_balance: f64) -> PersonStatus {
        PersonStatus {
            age,
            life: LifeState::Alive,
            traditional_balance,
        }
    }

    fn deceased(age: u32) -> PersonStatus {
        PersonStatus {
            age,
            life: LifeState::Deceased { year_index: 0 },
            traditional_balance: 0.0,
        }
    }

    fn couple_profile() -> HouseholdProfile {
        let mut first = person(70, 80);
        first.pension.amount = 30_000.0;
        first.pension.has_cola = true;
        first.pension.survivorship_pct = 50.0;
        first.social_security.amount = 24_000.0;
        first.social_security.start_age = 67;

        let mut second = person(68, 95);
        second.social_security.amount = 12_000.0;
        second.social_security.start_age = 62;
        second.traditional_allocation = Allocation {
            stock_pct: 40,
            expected_return: 0.05,
        };

        HouseholdProfile {
            household: Household::Couple(first, second),
            income: HouseholdIncome {
                taxable_income: 50_000.0,
                rental_income: 6_000.0,
                other_income: 1_000.0,
                inheritances: vec![Inheritance {
                    amount: 100_000.0,
                    year: 2027,
                }],
            },
            exclusions: Exclusions::default(),
        }
    }

    #[test]
    fn social_security_is_zero_before_start_age_then_flat() {
        let profile = couple_profile();
        let people = profile.household.people();
        assert_approx(social_security_benefit(people[0], 66, None), 0.0);
        assert_approx(social_security_benefit(people[0], 67, None), 24_000.0);
        assert_approx(social_security_benefit(people[0], 80, None), 24_000.0);
    }

    #[test]
    fn claiming_curve_scales_early_and_delayed_benefits() {
        let profile = couple_profile();
        let people = profile.household.people();
        let curve = ClaimingCurve::full_retirement_age_67();
        assert_approx(social_security_benefit(people[0], 67, Some(&curve)), 24_000.0);
        assert_approx(
            social_security_benefit(people[1], 68, Some(&curve)),
            12_000.0 * 0.70,
        );
    }

    #[test]
    fn pension_compounds_with_cola_from_first_payment_year() {
        let profile = couple_profile();
        let people = profile.household.people();
        assert_approx(pension_benefit(people[0], 2025, 2025, 0.02), 30_000.0);
        assert_approx(pension_benefit(people[0], 2027, 2025, 0.02), 30_000.0 * 1.02 * 1.02);

        let mut flat = people[0].clone();
        flat.pension.has_cola = false;
        assert_approx(pension_benefit(&flat, 2035, 2025, 0.02), 30_000.0);

        let mut future = people[0].clone();
        future.retirement_year = 2030;
        assert_approx(pension_benefit(&future, 2029, 2025, 0.02), 0.0);
        assert_approx(pension_benefit(&future, 2031, 2025, 0.02), 30_000.0 * 1.02);
    }

    #[test]
    fn rmd_starts_at_73() {
        assert_approx(rmd_amount(265_000.0, 72).expect("rmd"), 0.0);
        assert_approx(rmd_amount(265_000.0, 73).expect("rmd"), 10_000.0);
    }

    #[test]
    fn resolver_applies_rmd_and_household_income() {
        let profile = couple_profile();
        let config = AnalysisConfig::new(2025);
        let resolver = IncomeResolver::new(&profile, &config);
        let income = resolver
            .resolve(0, &[alive(75, 246_000.0), alive(68, 0.0)])
            .expect("income");

        assert_approx(income.people[0].forced_withdrawal, 10_000.0);
        assert_approx(income.people[0].pension, 30_000.0);
        assert_approx(income.people[0].ordinary_income, 40_000.0);
        assert_approx(income.people[1].social_security, 12_000.0);
        assert_approx(income.wages, 50_000.0);
        assert_approx(income.rental_income, 6_000.0);
        assert_approx(income.household_ordinary_income(), 97_000.0);
        assert_approx(income.social_security(), 36_000.0);
        assert_approx(income.external_cash(), 97_000.0 - 10_000.0 + 36_000.0);
    }

    #[test]
    fn wages_stop_after_retirement_year_and_inheritance_lands_once() {
        let profile = couple_profile();
        let config = AnalysisConfig::new(2025);
        let resolver = IncomeResolver::new(&profile, &config);
        let statuses = [alive(72, 0.0), alive(70, 0.0)];

        let year_two = resolver.resolve(2, &statuses).expect("income");
        assert_approx(year_two.wages, 0.0);
        assert_approx(year_two.inheritance, 100_000.0);

        let year_three = resolver.resolve(3, &statuses).expect("income");
        assert_approx(year_three.inheritance, 0.0);
    }

    #[test]
    fn survivor_receives_reduced_pension_and_larger_social_security() {
        let profile = couple_profile();
        let config = AnalysisConfig::new(2025);
        let resolver = IncomeResolver::new(&profile, &config);
        let income = resolver
            .resolve(11, &[deceased(81), alive(79, 0.0)])
            .expect("income");

        assert_eq!(income.people[0], PersonIncome::default());
        let expected_pension = 30_000.0 * 1.02_f64.powi(11) * 0.5;
        assert_approx(income.people[1].survivor_pension, expected_pension);
        assert_approx(income.people[1].social_security, 24_000.0);
        assert_approx(income.people[1].ordinary_income, expected_pension);
    }

    #[test]
    fn survivorship_policy_can_exclude_a_direction() {
        let profile = couple_profile();
        let mut config = AnalysisConfig::new(2025);
        config.survivorship = crate::core::types::SurvivorshipPolicy::SecondPersonOnly;
        let resolver = IncomeResolver::new(&profile, &config);
        let income = resolver
            .resolve(11, &[deceased(81), alive(79, 0.0)])
            .expect("income");
        assert_approx(income.people[1].survivor_pension, 0.0);
    }

    #[test]
    fn nobody_alive_means_no_income() {
        let profile = couple_profile();
        let config = AnalysisConfig::new(2025);
        let resolver = IncomeResolver::new(&profile, &config);
        let income = resolver
            .resolve(0, &[deceased(81), deceased(96)])
            .expect("income");
        assert_approx(income.household_ordinary_income(), 0.0);
        assert_approx(income.external_cash(), 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_rmd_is_monotone_in_traditional_balance(
            balance in 0u32..5_000_000,
            extra in 0u32..1_000_000,
            age in 60u32..115,
        ) {
            let low = rmd_amount(balance as f64, age).expect("rmd");
            let high = rmd_amount((balance + extra) as f64, age).expect("rmd");
            prop_assert!(high >= low);
            prop_assert!(low <= balance as f64);
        }
    }
}
