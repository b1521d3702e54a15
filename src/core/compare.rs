use serde::Serialize;
use tracing::info;

use super::engine::{ProjectionRun, run_projection};
use super::error::EngineError;
use super::tax_tables::TaxRuleBook;
use super::types::{
    AnalysisConfig, AnalysisResult, BreakevenYears, FilingStatus, Household, HouseholdProfile,
    Recommendation, Scenario,
};

const NET_WORTH_EPS: f64 = 1e-6;
const SAVINGS_EPS: f64 = 1e-6;
const CONVERSION_BRACKET_NOTE: f64 = 0.24;
const RETURN_GAP_NOTE: f64 = 0.005;
const LONG_HORIZON_YEARS: u32 = 20;
const SHORT_HORIZON_YEARS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub baseline: ProjectionRun,
    pub converted: ProjectionRun,
    pub result: AnalysisResult,
}

pub fn analyze(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, EngineError> {
    analyze_with_rules(profile, config, &TaxRuleBook::standard())
}

pub fn analyze_with_rules(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    rules: &TaxRuleBook,
) -> Result<AnalysisResult, EngineError> {
    Ok(compare_projections(profile, config, rules)?.result)
}

/// Runs the baseline and converted projections side by side and scores the difference.
pub fn compare_projections(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    rules: &TaxRuleBook,
) -> Result<Comparison, EngineError> {
    profile.validate()?;
    config.validate()?;
    let table = rules.table(config.as_of_year)?;

    let (baseline, converted) = rayon::join(
        || run_projection(profile, config, table, Scenario::Baseline),
        || run_projection(profile, config, table, Scenario::Converted),
    );
    let baseline = baseline?;
    let converted = converted?;

    let result = build_result(profile, config, &baseline, &converted);
    info!(
        recommendation = ?result.recommendation,
        conversion_tax_cost = result.conversion_tax_cost,
        lifetime_tax_savings = result.lifetime_tax_savings,
        breakeven = ?result.breakeven_years.years(),
        "analysis complete"
    );

    Ok(Comparison {
        baseline,
        converted,
        result,
    })
}

fn build_result(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    baseline: &ProjectionRun,
    converted: &ProjectionRun,
) -> AnalysisResult {
    let year_zero_tax = |run: &ProjectionRun| run.year(0).map(|r| r.tax_paid).unwrap_or(0.0);
    let conversion_tax_cost = year_zero_tax(converted) - year_zero_tax(baseline);
    let lifetime_tax_savings = baseline.cumulative_taxes() - converted.cumulative_taxes();
    let breakeven_years = breakeven(baseline, converted);
    let horizon_years = profile.household.horizon_years();
    let recommendation = recommend(
        lifetime_tax_savings,
        breakeven_years,
        horizon_years,
        config.strong_breakeven_fraction,
    );
    let converted_amount = converted
        .events
        .conversion
        .map(|c| c.converted)
        .unwrap_or(0.0);

    AnalysisResult {
        recommendation,
        summary: summarize(
            recommendation,
            converted_amount,
            conversion_tax_cost,
            lifetime_tax_savings,
            breakeven_years,
        ),
        conversion_tax_cost,
        breakeven_years,
        lifetime_tax_savings,
        projected_traditional_ira_value: baseline
            .terminal()
            .map(|r| r.traditional_total)
            .unwrap_or(0.0),
        projected_roth_value: converted.terminal().map(|r| r.roth_total).unwrap_or(0.0),
        key_factors: key_factors(profile, config, baseline, converted),
    }
}

/// First year in which the converted path's after-tax net worth is ahead.
fn breakeven(baseline: &ProjectionRun, converted: &ProjectionRun) -> BreakevenYears {
    baseline
        .years
        .iter()
        .zip(&converted.years)
        .find(|(base, conv)| conv.after_tax_net_worth > base.after_tax_net_worth + NET_WORTH_EPS)
        .map(|(base, _)| BreakevenYears::Years(base.year_index))
        .unwrap_or(BreakevenYears::Never)
}

fn recommend(
    lifetime_tax_savings: f64,
    breakeven_years: BreakevenYears,
    horizon_years: u32,
    strong_breakeven_fraction: f64,
) -> Recommendation {
    if lifetime_tax_savings <= SAVINGS_EPS {
        return Recommendation::NotRecommended;
    }
    match breakeven_years.years() {
        Some(n) if n as f64 <= strong_breakeven_fraction * horizon_years as f64 => {
            Recommendation::Strong
        }
        _ => Recommendation::Moderate,
    }
}

fn summarize(
    recommendation: Recommendation,
    converted_amount: f64,
    conversion_tax_cost: f64,
    lifetime_tax_savings: f64,
    breakeven_years: BreakevenYears,
) -> String {
    if converted_amount <= 0.0 {
        return "There is no Traditional IRA balance to convert, so both projections are the same."
            .to_string();
    }

    let opening = format!(
        "Converting {} now costs {} in additional tax this year",
        format_dollars(converted_amount),
        format_dollars(conversion_tax_cost)
    );
    let breakeven_text = match breakeven_years {
        BreakevenYears::Years(0) => "after-tax wealth is ahead from the first year".to_string(),
        BreakevenYears::Years(1) => "after-tax wealth pulls ahead after 1 year".to_string(),
        BreakevenYears::Years(n) => format!("after-tax wealth pulls ahead after {n} years"),
        BreakevenYears::Never => "after-tax wealth never pulls ahead of not converting".to_string(),
    };

    match recommendation {
        Recommendation::Strong => format!(
            "{opening} and saves an estimated {} in lifetime taxes; {breakeven_text}. A conversion is strongly recommended.",
            format_dollars(lifetime_tax_savings)
        ),
        Recommendation::Moderate => format!(
            "{opening} and saves an estimated {} in lifetime taxes, but {breakeven_text}. A conversion is worth considering.",
            format_dollars(lifetime_tax_savings)
        ),
        Recommendation::NotRecommended => format!(
            "{opening} without reducing lifetime taxes (net change {}); {breakeven_text}. A conversion is not recommended.",
            format_dollars(lifetime_tax_savings)
        ),
    }
}

fn key_factors(
    profile: &HouseholdProfile,
    config: &AnalysisConfig,
    baseline: &ProjectionRun,
    converted: &ProjectionRun,
) -> Vec<String> {
    let mut factors = Vec::new();
    let people = profile.household.people();

    if let Some(outcome) = converted.events.conversion.filter(|c| c.insufficient_liquidity) {
        factors.push(format!(
            "Insufficient liquidity: conversion tax of {} exceeds the {} of taxable assets above the reserve, so {} extra is withdrawn from the Traditional IRA to pay it",
            format_dollars(outcome.conversion_tax),
            format_dollars(outcome.liquidity_available),
            format_dollars(outcome.gross_up_withdrawal)
        ));
    }

    let rmd_pressure = baseline
        .years
        .iter()
        .zip(&converted.years)
        .filter(|(base, _)| base.rmd > 0.0)
        .find(|(base, conv)| base.marginal_rate > conv.marginal_rate);
    if let Some((base, conv)) = rmd_pressure {
        let converted_side = if conv.rmd > 0.0 {
            format!("versus {} after converting", format_rate(conv.marginal_rate))
        } else {
            "versus no RMDs after converting".to_string()
        };
        factors.push(format!(
            "Required minimum distributions push baseline income into the {} bracket from {}, {converted_side}",
            format_rate(base.marginal_rate),
            base.calendar_year,
        ));
    }

    let ss_shift = baseline
        .years
        .iter()
        .zip(&converted.years)
        .filter(|(base, _)| base.social_security > 0.0)
        .find(|(base, conv)| base.ss_taxable_fraction != conv.ss_taxable_fraction);
    if let Some((base, conv)) = ss_shift {
        factors.push(format!(
            "Social Security taxability differs in {}: {} of benefits are taxable without converting versus {} with the conversion",
            base.calendar_year,
            format_rate(base.ss_taxable_fraction),
            format_rate(conv.ss_taxable_fraction)
        ));
    }

    for death in &baseline.events.deaths {
        let pension = &people[death.person_index].pension;
        if death.survivor_index.is_some()
            && pension.amount > 0.0
            && death.pension_continued_pct < 100.0
        {
            factors.push(format!(
                "Survivor pension drops to {}% of person {}'s benefit after their death in {}",
                death.pension_continued_pct,
                death.person_index + 1,
                config.as_of_year + death.year_index
            ));
        }
    }

    if matches!(profile.household, Household::Couple(..)) && config.filing_status.is_none() {
        let single_from = baseline
            .years
            .iter()
            .find(|r| r.filing_status == FilingStatus::Single);
        if let Some(row) = single_from {
            factors.push(format!(
                "The surviving spouse files as single from {}, facing narrower brackets on the remaining Traditional balance",
                row.calendar_year
            ));
        }
    }

    let conversion_year = converted
        .year(0)
        .filter(|r| r.conversion > 0.0 && r.marginal_rate >= CONVERSION_BRACKET_NOTE);
    if let Some(row) = conversion_year {
        factors.push(format!(
            "The conversion is taxed up to the {} bracket in {}",
            format_rate(row.marginal_rate),
            row.calendar_year
        ));
    }

    for (idx, person) in people.iter().enumerate() {
        let roth = person.roth_allocation.expected_return;
        let traditional = person.traditional_allocation.expected_return;
        if (roth - traditional).abs() >= RETURN_GAP_NOTE {
            factors.push(format!(
                "Person {} expects Roth assets to return {} versus {} in the Traditional IRA",
                idx + 1,
                format_rate(roth),
                format_rate(traditional)
            ));
        }
    }

    let horizon = profile.household.horizon_years();
    if horizon > LONG_HORIZON_YEARS {
        factors.push(format!(
            "A {horizon}-year horizon gives converted assets a long time to grow tax-free"
        ));
    } else if horizon < SHORT_HORIZON_YEARS {
        factors.push(format!(
            "A {horizon}-year horizon leaves little time to recover the upfront conversion tax"
        ));
    }

    for run in [baseline, converted] {
        if let Some(year_index) = run.events.depleted_year {
            factors.push(format!(
                "Assets run out in {} in the {} projection",
                config.as_of_year + year_index,
                run.scenario
            ));
        }
    }

    if factors.is_empty() {
        factors.push(
            "No single factor dominates; the outcome follows the bracket difference between converting now and withdrawing later"
                .to_string(),
        );
    }
    factors
}

fn format_rate(rate: f64) -> String {
    let pct = rate * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{}%", pct.round())
    } else {
        format!("{pct:.1}%")
    }
}

pub fn format_dollars(amount: f64) -> String {
    let rounded = amount.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}
