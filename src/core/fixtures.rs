use super::types::{
    Allocation, Exclusions, Household, HouseholdIncome, HouseholdProfile, Pension, Person,
    PersonCapital, SocialSecurity,
};

pub fn person(age: u32, longevity: u32) -> Person {
    Person {
        age,
        longevity,
        retirement_year: 2020,
        social_security: SocialSecurity {
            amount: 0.0,
            start_age: 67,
        },
        pension: Pension {
            amount: 0.0,
            has_cola: false,
            survivorship_pct: 0.0,
        },
        capital: PersonCapital::default(),
        traditional_allocation: Allocation {
            stock_pct: 60,
            expected_return: 0.05,
        },
        roth_allocation: Allocation {
            stock_pct: 60,
            expected_return: 0.05,
        },
    }
}

pub fn single_profile(person: Person) -> HouseholdProfile {
    HouseholdProfile {
        household: Household::Single(person),
        income: HouseholdIncome::default(),
        exclusions: Exclusions::default(),
    }
}

pub fn couple_profile(first: Person, second: Person) -> HouseholdProfile {
    HouseholdProfile {
        household: Household::Couple(first, second),
        income: HouseholdIncome::default(),
        exclusions: Exclusions::default(),
    }
}
