use super::tax_tables::{Bracket, TaxYearTable, ss_taxable_fraction};
use super::types::FilingStatus;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxInputs {
    pub ordinary_income: f64,
    pub gross_social_security: f64,
    pub capital_gains: f64,
    pub filing_status: FilingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxBreakdown {
    pub provisional_income: f64,
    pub ss_taxable_fraction: f64,
    pub taxable_social_security: f64,
    pub taxable_ordinary_income: f64,
    pub taxable_capital_gains: f64,
    pub ordinary_tax: f64,
    pub capital_gains_tax: f64,
    pub marginal_rate: f64,
}

impl TaxBreakdown {
    pub fn total(&self) -> f64 {
        self.ordinary_tax + self.capital_gains_tax
    }
}

pub fn compute_tax(table: &TaxYearTable, inputs: &TaxInputs) -> TaxBreakdown {
    let ordinary = inputs.ordinary_income.max(0.0);
    let gross_ss = inputs.gross_social_security.max(0.0);
    let gains = inputs.capital_gains.max(0.0);
    let status = inputs.filing_status;

    let provisional_income = ordinary + 0.5 * gross_ss;
    let fraction = if gross_ss > 0.0 {
        ss_taxable_fraction(provisional_income, status)
    } else {
        0.0
    };
    let taxable_social_security = gross_ss * fraction;

    let deduction = table.standard_deduction(status).max(0.0);
    let total_taxable = (ordinary + taxable_social_security + gains - deduction).max(0.0);
    let taxable_capital_gains = gains.min(total_taxable);
    let taxable_ordinary_income = (total_taxable - taxable_capital_gains).max(0.0);

    let ordinary_tax = bracket_tax(table.brackets(status), 0.0, taxable_ordinary_income);
    let capital_gains_tax = bracket_tax(
        table.capital_gains_tiers(status),
        taxable_ordinary_income,
        taxable_ordinary_income + taxable_capital_gains,
    );

    TaxBreakdown {
        provisional_income,
        ss_taxable_fraction: fraction,
        taxable_social_security,
        taxable_ordinary_income,
        taxable_capital_gains,
        ordinary_tax: ordinary_tax.max(0.0),
        capital_gains_tax: capital_gains_tax.max(0.0),
        marginal_rate: marginal_rate(table.brackets(status), taxable_ordinary_income),
    }
}

pub fn total_tax(table: &TaxYearTable, inputs: &TaxInputs) -> f64 {
    compute_tax(table, inputs).total()
}

/// Tax on the slice of income between `from` and `to`, bracket by bracket.
fn bracket_tax(brackets: &[Bracket], from: f64, to: f64) -> f64 {
    if to <= from {
        return 0.0;
    }
    let mut tax = 0.0;
    for (idx, bracket) in brackets.iter().enumerate() {
        let upper = brackets
            .get(idx + 1)
            .map(|next| next.lower_bound)
            .unwrap_or(f64::INFINITY);
        let lo = bracket.lower_bound.max(from);
        let hi = upper.min(to);
        if hi > lo {
            tax += (hi - lo) * bracket.rate.clamp(0.0, 1.0);
        }
    }
    tax
}

fn marginal_rate(brackets: &[Bracket], taxable_income: f64) -> f64 {
    brackets
        .iter()
        .rev()
        .find(|b| taxable_income >= b.lower_bound)
        .or_else(|| brackets.first())
        .map(|b| b.rate)
        .unwrap_or(0.0)
}
