//! Federal tax rule tables, versioned by tax year.
//!
//! Everything the engine knows about tax law lives here as data. Adding a new
//! tax year means adding one more `TaxYearTable` to `TaxRuleBook::standard`.

use super::error::TaxRuleError;
use super::types::FilingStatus;

pub const RMD_START_AGE: u32 = 73;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bracket {
    pub lower_bound: f64,
    pub rate: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusSchedule {
    pub brackets: Vec<Bracket>,
    pub standard_deduction: f64,
    pub capital_gains: Vec<Bracket>,
}

impl StatusSchedule {
    pub fn new(
        brackets: &[(f64, f64)],
        standard_deduction: f64,
        capital_gains: &[(f64, f64)],
    ) -> Self {
        let to_brackets = |rows: &[(f64, f64)]| {
            rows.iter()
                .map(|&(lower_bound, rate)| Bracket { lower_bound, rate })
                .collect::<Vec<_>>()
        };
        Self {
            brackets: to_brackets(brackets),
            standard_deduction,
            capital_gains: to_brackets(capital_gains),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaxYearTable {
    pub year: u32,
    single: StatusSchedule,
    joint: StatusSchedule,
}

impl TaxYearTable {
    pub fn new(year: u32, single: StatusSchedule, joint: StatusSchedule) -> Self {
        Self {
            year,
            single,
            joint,
        }
    }

    pub fn schedule(&self, status: FilingStatus) -> &StatusSchedule {
        match status {
            FilingStatus::Single => &self.single,
            FilingStatus::MarriedFilingJointly => &self.joint,
        }
    }

    pub fn brackets(&self, status: FilingStatus) -> &[Bracket] {
        &self.schedule(status).brackets
    }

    pub fn standard_deduction(&self, status: FilingStatus) -> f64 {
        self.schedule(status).standard_deduction
    }

    pub fn capital_gains_tiers(&self, status: FilingStatus) -> &[Bracket] {
        &self.schedule(status).capital_gains
    }
}

const ORDINARY_RATES: [f64; 7] = [0.10, 0.12, 0.22, 0.24, 0.32, 0.35, 0.37];
const CAPITAL_GAINS_RATES: [f64; 3] = [0.0, 0.15, 0.20];

fn schedule_from_thresholds(
    ordinary_thresholds: [f64; 6],
    standard_deduction: f64,
    gains_thresholds: [f64; 2],
) -> StatusSchedule {
    let mut ordinary = vec![(0.0, ORDINARY_RATES[0])];
    for (lower, rate) in ordinary_thresholds.iter().zip(&ORDINARY_RATES[1..]) {
        ordinary.push((*lower, *rate));
    }
    let mut gains = vec![(0.0, CAPITAL_GAINS_RATES[0])];
    for (lower, rate) in gains_thresholds.iter().zip(&CAPITAL_GAINS_RATES[1..]) {
        gains.push((*lower, *rate));
    }
    StatusSchedule::new(&ordinary, standard_deduction, &gains)
}

fn table_2024() -> TaxYearTable {
    TaxYearTable::new(
        2024,
        schedule_from_thresholds(
            [11_600.0, 47_150.0, 100_525.0, 191_950.0, 243_725.0, 609_350.0],
            14_600.0,
            [47_025.0, 518_900.0],
        ),
        schedule_from_thresholds(
            [23_200.0, 94_300.0, 201_050.0, 383_900.0, 487_450.0, 731_200.0],
            29_200.0,
            [94_050.0, 583_750.0],
        ),
    )
}

fn table_2025() -> TaxYearTable {
    TaxYearTable::new(
        2025,
        schedule_from_thresholds(
            [11_925.0, 48_475.0, 103_350.0, 197_300.0, 250_525.0, 626_350.0],
            15_750.0,
            [48_350.0, 533_400.0],
        ),
        schedule_from_thresholds(
            [23_850.0, 96_950.0, 206_700.0, 394_600.0, 501_050.0, 751_600.0],
            31_500.0,
            [96_700.0, 600_050.0],
        ),
    )
}

fn table_2026() -> TaxYearTable {
    TaxYearTable::new(
        2026,
        schedule_from_thresholds(
            [12_400.0, 50_400.0, 105_700.0, 201_775.0, 256_225.0, 640_600.0],
            16_100.0,
            [49_450.0, 545_500.0],
        ),
        schedule_from_thresholds(
            [24_800.0, 100_800.0, 211_400.0, 403_550.0, 512_450.0, 768_700.0],
            32_200.0,
            [98_900.0, 613_700.0],
        ),
    )
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaxRuleBook {
    tables: Vec<TaxYearTable>,
}

impl TaxRuleBook {
    pub fn standard() -> Self {
        Self::with_tables(vec![table_2024(), table_2025(), table_2026()])
    }

    pub fn with_tables(mut tables: Vec<TaxYearTable>) -> Self {
        tables.sort_by_key(|t| t.year);
        Self { tables }
    }

    pub fn years(&self) -> Vec<u32> {
        self.tables.iter().map(|t| t.year).collect()
    }

    pub fn table(&self, year: u32) -> Result<&TaxYearTable, TaxRuleError> {
        self.tables
            .iter()
            .find(|t| t.year == year)
            .ok_or(TaxRuleError::UnsupportedTaxYear { year })
    }

    pub fn brackets_for(&self, status: FilingStatus, year: u32) -> Result<&[Bracket], TaxRuleError> {
        Ok(self.table(year)?.brackets(status))
    }

    pub fn standard_deduction(&self, status: FilingStatus, year: u32) -> Result<f64, TaxRuleError> {
        Ok(self.table(year)?.standard_deduction(status))
    }

    pub fn capital_gains_tiers(
        &self,
        status: FilingStatus,
        year: u32,
    ) -> Result<&[Bracket], TaxRuleError> {
        Ok(self.table(year)?.capital_gains_tiers(status))
    }
}

// IRS Uniform Lifetime Table, ages 73 through 120.
const UNIFORM_LIFETIME_DIVISORS: [f64; 48] = [
    26.5, 25.5, 24.6, 23.7, 22.9, 22.0, 21.1, 20.2, 19.4, 18.5, // 73-82
    17.7, 16.8, 16.0, 15.2, 14.4, 13.7, 12.9, 12.2, 11.5, 10.8, // 83-92
    10.1, 9.5, 8.9, 8.4, 7.8, 7.3, 6.8, 6.4, 6.0, 5.6, // 93-102
    5.2, 4.9, 4.6, 4.3, 4.1, 3.9, 3.7, 3.5, 3.4, 3.3, // 103-112
    3.1, 3.0, 2.9, 2.8, 2.7, 2.5, 2.3, 2.0, // 113-120
];

pub fn rmd_divisor(age: u32) -> Result<f64, TaxRuleError> {
    if age < RMD_START_AGE {
        return Err(TaxRuleError::UnsupportedAge { age });
    }
    let idx = ((age - RMD_START_AGE) as usize).min(UNIFORM_LIFETIME_DIVISORS.len() - 1);
    Ok(UNIFORM_LIFETIME_DIVISORS[idx])
}

// Statutory base amounts; these are not inflation indexed.
const SS_BASE_AMOUNTS_SINGLE: (f64, f64) = (25_000.0, 34_000.0);
const SS_BASE_AMOUNTS_JOINT: (f64, f64) = (32_000.0, 44_000.0);

pub fn ss_taxable_fraction(provisional_income: f64, status: FilingStatus) -> f64 {
    let (first, second) = match status {
        FilingStatus::Single => SS_BASE_AMOUNTS_SINGLE,
        FilingStatus::MarriedFilingJointly => SS_BASE_AMOUNTS_JOINT,
    };
    if provisional_income > second {
        0.85
    } else if provisional_income > first {
        0.5
    } else {
        0.0
    }
}
