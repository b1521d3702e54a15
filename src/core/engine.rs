use serde::Serialize;
use tracing::debug;

use super::error::EngineError;
use super::income::{IncomeBreakdown, IncomeResolver, PersonStatus};
use super::tax::{TaxBreakdown, TaxInputs, compute_tax};
use super::tax_tables::TaxYearTable;
use super::types::{
    AnalysisConfig, FilingStatus, HouseholdProfile, LifeState, PersonYear, Scenario, YearRecord,
};

const BISECTION_ITERATIONS: usize = 60;
const FUNDING_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConversionOutcome {
    pub requested: f64,
    pub converted: f64,
    pub gross_up_withdrawal: f64,
    pub conversion_tax: f64,
    pub liquidity_available: f64,
    pub insufficient_liquidity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeathEvent {
    pub person_index: usize,
    pub year_index: u32,
    pub survivor_index: Option<usize>,
    /// Share of the deceased's pension that keeps paying the survivor, 0..=100.
    pub pension_continued_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunEvents {
    pub conversion: Option<ConversionOutcome>,
    pub deaths: Vec<DeathEvent>,
    pub depleted_year: Option<u32>,
    pub unfunded_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionRun {
    pub scenario: Scenario,
    pub horizon_years: u32,
    pub years: Vec<YearRecord>,
    pub events: RunEvents,
}

impl ProjectionRun {
    pub fn terminal(&self) -> Option<&YearRecord> {
        self.years.last()
    }

    pub fn cumulative_taxes(&self) -> f64 {
        self.terminal().map(|r| r.cumulative_taxes).unwrap_or(0.0)
    }

    pub fn year(&self, year_index: u32) -> Option<&YearRecord> {
        self.years.get(year_index as usize)
    }
}

#[derive(Debug, Clone, Copy)]
struct PersonState {
    base_age: u32,
    age: u32,
    longevity: u32,
    life: LifeState,
    traditional: f64,
    roth: f64,
    taxable: f64,
    taxable_basis: f64,
    traditional_return: f64,
    roth_return: f64,
}

impl PersonState {
    fn total(&self) -> f64 {
        self.traditional + self.roth + self.taxable
    }
}

#[derive(Debug, Clone)]
struct SimulationYearState {
    people: Vec<PersonState>,
    cumulative_taxes_paid: f64,
}

impl SimulationYearState {
    fn from_profile(profile: &HouseholdProfile) -> Self {
        let people = profile
            .household
            .people()
            .into_iter()
            .map(|p| PersonState {
                base_age: p.age,
                age: p.age,
                longevity: p.longevity,
                life: LifeState::Alive,
                traditional: p.capital.before_tax_ira,
                roth: p.capital.roth,
                taxable: p.capital.taxable_assets(),
                taxable_basis: p.capital.taxable_assets(),
                traditional_return: p.traditional_allocation.expected_return,
                roth_return: p.roth_allocation.expected_return,
            })
            .collect();
        Self {
            people,
            cumulative_taxes_paid: 0.0,
        }
    }

    fn living_count(&self) -> usize {
        self.people.iter().filter(|p| p.life.is_alive()).count()
    }

    fn first_living(&self) -> Option<usize> {
        self.people.iter().position(|p| p.life.is_alive())
    }

    fn traditional_total(&self) -> f64 {
        self.people.iter().map(|p| p.traditional).sum()
    }

    fn roth_total(&self) -> f64 {
        self.people.iter().map(|p| p.roth).sum()
    }

    fn taxable_total(&self) -> f64 {
        self.people.iter().map(|p| p.taxable).sum()
    }

    fn total_assets(&self) -> f64 {
        self.people.iter().map(PersonState::total).sum()
    }

    fn statuses(&self) -> Vec<PersonStatus> {
        self.people
            .iter()
            .map(|p| PersonStatus {
                age: p.age,
                life: p.life,
                traditional_balance: p.traditional,
            })
            .collect()
    }

    fn person_years(&self) -> Vec<PersonYear> {
        self.people
            .iter()
            .map(|p| PersonYear {
                age: p.age,
                alive: p.life.is_alive(),
                traditional: p.traditional,
                roth: p.roth,
                taxable: p.taxable,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct TaxYearState {
    ordinary_income: f64,
    gross_social_security: f64,
    capital_gains: f64,
    filing_status: FilingStatus,
}

impl TaxYearState {
    fn breakdown(&self, table: &TaxYearTable) -> TaxBreakdown {
        compute_tax(
            table,
            &TaxInputs {
                ordinary_income: self.ordinary_income,
                gross_social_security: self.gross_social_security,
                capital_gains: self.capital_gains,
                filing_status: self.filing_status,
            },
        )
    }

    fn tax(&self, table: &TaxYearTable) -> f64 {
        self.breakdown(table).total()
    }

    fn with_ordinary(&self, additional: f64) -> Self {
        Self {
            ordinary_income: self.ordinary_income + additional,
            ..*self
        }
    }

    fn with_gains(&self, additional: f64) -> Self {
        Self {
            capital_gains: self.capital_gains + additional,
            ..*self
        }
    }
}

/// Projects one scenario from year 0 through the year the longer-lived person reaches longevity.
pub fn run_projection(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    table: &TaxYearTable,
    scenario: Scenario,
) -> Result<ProjectionRun, EngineError> {
    profile.validate()?;
    config.validate()?;

    let horizon_years = profile.household.horizon_years();
    let resolver = IncomeResolver::new(profile, config);
    let reserve = profile.exclusions.reserve();
    let mut state = SimulationYearState::from_profile(profile);
    let mut years = Vec::with_capacity(horizon_years as usize + 1);
    let mut events = RunEvents::default();

    debug!(
        %scenario,
        horizon_years,
        tax_year = table.year,
        people = state.people.len(),
        "starting projection"
    );

    for year_index in 0..=horizon_years {
        for person in &mut state.people {
            person.age = person.base_age + year_index;
        }
        apply_deaths(&mut state, profile, config, year_index, &mut events);
        if state.living_count() == 0 {
            break;
        }

        let filing_status = config.filing_status.unwrap_or(if state.living_count() >= 2 {
            FilingStatus::MarriedFilingJointly
        } else {
            FilingStatus::Single
        });

        let income = resolver.resolve(year_index, &state.statuses())?;
        deposit_income(&mut state, &income);

        let mut tax_state = TaxYearState {
            ordinary_income: income.household_ordinary_income(),
            gross_social_security: income.social_security(),
            capital_gains: 0.0,
            filing_status,
        };

        let mut converted = 0.0;
        if scenario == Scenario::Converted && year_index == 0 {
            let outcome = apply_conversion(
                &mut state,
                &mut tax_state,
                table,
                config.conversion_amount,
                reserve,
            );
            converted = outcome.converted;
            if outcome.insufficient_liquidity {
                debug!(
                    %scenario,
                    gross_up = outcome.gross_up_withdrawal,
                    liquidity = outcome.liquidity_available,
                    "conversion tax exceeds liquid taxable assets"
                );
            }
            events.conversion = Some(outcome);
        }

        let spending = config
            .spending
            .map(|plan| plan.amount_for(year_index))
            .unwrap_or(0.0);
        let unfunded = fund_obligation(&mut state, &mut tax_state, table, spending);

        let breakdown = tax_state.breakdown(table);
        let tax_paid = breakdown.total();
        state.cumulative_taxes_paid += tax_paid;

        let depleted = unfunded > FUNDING_EPS;
        if depleted {
            events.unfunded_total += unfunded;
            events.depleted_year = Some(year_index);
            for person in &mut state.people {
                person.traditional = 0.0;
                person.roth = 0.0;
                person.taxable = 0.0;
                person.taxable_basis = 0.0;
            }
        } else {
            apply_growth(&mut state, config.taxable_return);
            check_balances(&mut state, scenario, year_index)?;
        }

        let traditional_total = state.traditional_total();
        let roth_total = state.roth_total();
        let taxable_total = state.taxable_total();
        years.push(YearRecord {
            year_index,
            calendar_year: config.as_of_year + year_index,
            filing_status,
            people: state.person_years(),
            ordinary_income: tax_state.ordinary_income,
            social_security: tax_state.gross_social_security,
            ss_taxable_fraction: breakdown.ss_taxable_fraction,
            rmd: income.forced_withdrawal(),
            conversion: converted,
            capital_gains: tax_state.capital_gains,
            income_cash: income.external_cash(),
            spending,
            tax_paid,
            cumulative_taxes: state.cumulative_taxes_paid,
            marginal_rate: breakdown.marginal_rate,
            traditional_total,
            roth_total,
            taxable_total,
            after_tax_net_worth: after_tax_net_worth(
                traditional_total,
                roth_total,
                taxable_total,
                breakdown.marginal_rate,
            ),
        });

        if depleted {
            debug!(%scenario, year_index, unfunded, "household assets depleted");
            push_zero_tail(&mut years, &state, config, year_index + 1, horizon_years);
            break;
        }
    }

    debug!(
        %scenario,
        years = years.len(),
        cumulative_taxes = state.cumulative_taxes_paid,
        terminal_assets = state.total_assets(),
        "projection finished"
    );

    Ok(ProjectionRun {
        scenario,
        horizon_years,
        years,
        events,
    })
}

pub fn after_tax_net_worth(traditional: f64, roth: f64, taxable: f64, marginal_rate: f64) -> f64 {
    traditional * (1.0 - marginal_rate.clamp(0.0, 1.0)) + roth + taxable
}

fn apply_deaths(
    state: &mut SimulationYearState,
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    year_index: u32,
    events: &mut RunEvents,
) {
    let people = profile.household.people();
    for idx in 0..state.people.len() {
        let person = state.people[idx];
        if !person.life.is_alive() || person.age <= person.longevity {
            continue;
        }
        state.people[idx].life = LifeState::Deceased { year_index };

        let survivor_index = state.first_living();
        if let Some(survivor) = survivor_index {
            let heir = &mut state.people[survivor];
            heir.traditional += person.traditional;
            heir.roth += person.roth;
            heir.taxable += person.taxable;
            heir.taxable_basis += person.taxable_basis;

            let deceased = &mut state.people[idx];
            deceased.traditional = 0.0;
            deceased.roth = 0.0;
            deceased.taxable = 0.0;
            deceased.taxable_basis = 0.0;
        }

        let pension = &people[idx].pension;
        let pension_continued_pct = if survivor_index.is_some()
            && pension.amount > 0.0
            && config.survivorship.applies_to(idx)
        {
            pension.survivorship_pct
        } else {
            0.0
        };
        events.deaths.push(DeathEvent {
            person_index: idx,
            year_index,
            survivor_index,
            pension_continued_pct,
        });
    }
}

fn deposit_income(state: &mut SimulationYearState, income: &IncomeBreakdown) {
    for (person, flows) in state.people.iter_mut().zip(&income.people) {
        let withdrawal = flows.forced_withdrawal.min(person.traditional);
        person.traditional -= withdrawal;

        let cash = flows.pension + flows.survivor_pension + flows.social_security + withdrawal;
        person.taxable += cash;
        person.taxable_basis += cash;
    }

    let household_cash =
        income.wages + income.rental_income + income.other_income + income.inheritance;
    if let Some(idx) = state.first_living() {
        let person = &mut state.people[idx];
        person.taxable += household_cash;
        person.taxable_basis += household_cash;
    }
}

fn apply_conversion(
    state: &mut SimulationYearState,
    tax_state: &mut TaxYearState,
    table: &TaxYearTable,
    requested: Option<f64>,
    reserve: f64,
) -> ConversionOutcome {
    let total_traditional = state.traditional_total();
    let requested = requested
        .unwrap_or(total_traditional)
        .clamp(0.0, total_traditional);
    let liquidity_available = (state.taxable_total() - reserve).max(0.0);
    if requested <= 0.0 {
        return ConversionOutcome {
            requested,
            converted: 0.0,
            gross_up_withdrawal: 0.0,
            conversion_tax: 0.0,
            liquidity_available,
            insufficient_liquidity: false,
        };
    }

    let base_tax = tax_state.tax(table);
    // Tax the conversion plus a gross-up withdrawal would owe, beyond what
    // liquid assets and the withdrawal itself can cover.
    let shortfall = |withdrawal: f64| {
        let converted = requested.min(total_traditional - withdrawal);
        tax_state.with_ordinary(converted + withdrawal).tax(table)
            - base_tax
            - liquidity_available
            - withdrawal
    };

    let gross_up_withdrawal = if shortfall(0.0) <= 0.0 {
        0.0
    } else if shortfall(total_traditional) > 0.0 {
        total_traditional
    } else {
        let mut lo = 0.0;
        let mut hi = total_traditional;
        for _ in 0..BISECTION_ITERATIONS {
            let mid = (lo + hi) * 0.5;
            if shortfall(mid) > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        hi
    };

    let converted = requested
        .min(total_traditional - gross_up_withdrawal)
        .max(0.0);
    for person in &mut state.people {
        if person.traditional <= 0.0 {
            continue;
        }
        let share = person.traditional / total_traditional;
        let withdrawal = gross_up_withdrawal * share;
        let conversion = converted * share;
        person.traditional = (person.traditional - withdrawal - conversion).max(0.0);
        person.roth += conversion;
        person.taxable += withdrawal;
        person.taxable_basis += withdrawal;
    }

    tax_state.ordinary_income += converted + gross_up_withdrawal;
    ConversionOutcome {
        requested,
        converted,
        gross_up_withdrawal,
        conversion_tax: tax_state.tax(table) - base_tax,
        liquidity_available,
        insufficient_liquidity: gross_up_withdrawal > 0.0,
    }
}

/// Pays the year's tax plus spending from taxable, then Traditional, then Roth.
/// Returns the amount left unfunded.
fn fund_obligation(
    state: &mut SimulationYearState,
    tax_state: &mut TaxYearState,
    table: &TaxYearTable,
    spending: f64,
) -> f64 {
    let mut drawn = 0.0;

    for person in &mut state.people {
        let need = tax_state.tax(table) + spending - drawn;
        if need <= FUNDING_EPS {
            return 0.0;
        }
        drawn += withdraw_from_taxable_for_net(
            need,
            &mut person.taxable,
            &mut person.taxable_basis,
            tax_state,
            table,
        );
    }

    for person in &mut state.people {
        let need = tax_state.tax(table) + spending - drawn;
        if need <= FUNDING_EPS {
            return 0.0;
        }
        drawn += withdraw_from_traditional_for_net(need, &mut person.traditional, tax_state, table);
    }

    for person in &mut state.people {
        let need = tax_state.tax(table) + spending - drawn;
        if need <= FUNDING_EPS {
            return 0.0;
        }
        let gross = need.min(person.roth);
        person.roth -= gross;
        drawn += gross;
    }

    (tax_state.tax(table) + spending - drawn).max(0.0)
}

/// Smallest gross amount in `[0, upper]` whose net reaches `desired_net`.
fn bisect_gross(upper: f64, desired_net: f64, net_for: impl Fn(f64) -> f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = upper;
    for _ in 0..BISECTION_ITERATIONS {
        let mid = (lo + hi) * 0.5;
        if net_for(mid) < desired_net {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Sells enough of a taxable account to net `target_net` after the capital
/// gains tax the sale adds. Returns the gross sale.
fn withdraw_from_taxable_for_net(
    target_net: f64,
    taxable_value: &mut f64,
    taxable_basis: &mut f64,
    tax_state: &mut TaxYearState,
    table: &TaxYearTable,
) -> f64 {
    if target_net <= 0.0 || *taxable_value <= 0.0 {
        return 0.0;
    }

    let value_before = *taxable_value;
    let basis_before = *taxable_basis;
    let base_tax = tax_state.tax(table);
    let net_for = |gross: f64| {
        let gain = realized_gain(gross, value_before, basis_before);
        let incremental_tax = (tax_state.with_gains(gain).tax(table) - base_tax).max(0.0);
        (gross - incremental_tax).max(0.0)
    };

    let max_net = net_for(value_before);
    let desired_net = target_net.min(max_net);
    if desired_net <= 0.0 {
        return 0.0;
    }

    let gross = if max_net <= target_net {
        value_before
    } else {
        bisect_gross(value_before, desired_net, net_for)
    };
    let gain = execute_taxable_sale(gross, taxable_value, taxable_basis);
    tax_state.capital_gains += gain;
    gross
}

/// Withdraws from a Traditional balance, grossed up for the ordinary income tax
/// the withdrawal adds. Returns the gross withdrawal.
fn withdraw_from_traditional_for_net(
    target_net: f64,
    traditional: &mut f64,
    tax_state: &mut TaxYearState,
    table: &TaxYearTable,
) -> f64 {
    if target_net <= 0.0 || *traditional <= 0.0 {
        return 0.0;
    }

    let balance = *traditional;
    let base_tax = tax_state.tax(table);
    let net_for = |gross: f64| {
        let incremental_tax = (tax_state.with_ordinary(gross).tax(table) - base_tax).max(0.0);
        (gross - incremental_tax).max(0.0)
    };

    let max_net = net_for(balance);
    let desired_net = target_net.min(max_net);
    if desired_net <= 0.0 {
        return 0.0;
    }

    let gross = if max_net <= target_net {
        balance
    } else {
        bisect_gross(balance, desired_net, net_for)
    };
    *traditional -= gross;
    tax_state.ordinary_income += gross;
    gross
}

fn realized_gain(gross_sale: f64, value_before: f64, basis_before: f64) -> f64 {
    if gross_sale <= 0.0 || value_before <= 0.0 {
        return 0.0;
    }
    let gross = gross_sale.min(value_before);
    let basis_portion = (basis_before * (gross / value_before)).min(basis_before);
    (gross - basis_portion).max(0.0)
}

fn execute_taxable_sale(gross_sale: f64, taxable_value: &mut f64, taxable_basis: &mut f64) -> f64 {
    if gross_sale <= 0.0 || *taxable_value <= 0.0 {
        return 0.0;
    }

    let gross = gross_sale.min(*taxable_value);
    let value_before = *taxable_value;
    let basis_before = *taxable_basis;
    let basis_portion = (basis_before * (gross / value_before)).min(basis_before);

    *taxable_value -= gross;
    *taxable_basis = (basis_before - basis_portion).max(0.0).min(*taxable_value);
    (gross - basis_portion).max(0.0)
}

fn apply_growth(state: &mut SimulationYearState, taxable_return: f64) {
    for person in &mut state.people {
        person.traditional *= 1.0 + person.traditional_return;
        person.roth *= 1.0 + person.roth_return;
        person.taxable *= 1.0 + taxable_return;
        person.taxable_basis = person.taxable_basis.min(person.taxable);
    }
}

fn check_balances(
    state: &mut SimulationYearState,
    scenario: Scenario,
    year_index: u32,
) -> Result<(), EngineError> {
    for person in &mut state.people {
        for (account, value) in [
            ("traditional", &mut person.traditional),
            ("roth", &mut person.roth),
            ("taxable", &mut person.taxable),
        ] {
            if !value.is_finite() || *value < -FUNDING_EPS {
                return Err(EngineError::NumericInstability {
                    scenario,
                    year_index,
                    account,
                    value: *value,
                });
            }
            *value = (*value).max(0.0);
        }
    }
    Ok(())
}

fn push_zero_tail(
    years: &mut Vec<YearRecord>,
    state: &SimulationYearState,
    config: &AnalysisConfig,
    start_year: u32,
    horizon_years: u32,
) {
    for year_index in start_year..=horizon_years {
        let people = state
            .people
            .iter()
            .map(|p| {
                let age = p.base_age + year_index;
                PersonYear {
                    age,
                    alive: p.life.is_alive() && age <= p.longevity,
                    traditional: 0.0,
                    roth: 0.0,
                    taxable: 0.0,
                }
            })
            .collect::<Vec<_>>();
        let living = people.iter().filter(|p| p.alive).count();
        years.push(YearRecord {
            year_index,
            calendar_year: config.as_of_year + year_index,
            filing_status: config.filing_status.unwrap_or(if living >= 2 {
                FilingStatus::MarriedFilingJointly
            } else {
                FilingStatus::Single
            }),
            people,
            ordinary_income: 0.0,
            social_security: 0.0,
            ss_taxable_fraction: 0.0,
            rmd: 0.0,
            conversion: 0.0,
            capital_gains: 0.0,
            income_cash: 0.0,
            spending: 0.0,
            tax_paid: 0.0,
            cumulative_taxes: state.cumulative_taxes_paid,
            marginal_rate: 0.0,
            traditional_total: 0.0,
            roth_total: 0.0,
            taxable_total: 0.0,
            after_tax_net_worth: 0.0,
        });
    }
}
