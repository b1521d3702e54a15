use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::core::{
    Allocation, AnalysisConfig, ClaimingCurve, EngineError, Exclusions, FilingStatus, Household,
    HouseholdIncome, HouseholdProfile, Inheritance, Pension, Person, PersonCapital,
    SocialSecurity, SpendingPlan, SurvivorshipPolicy, TaxRuleBook, TaxRuleError, ValidationError,
    analyze_with_rules, compare_projections,
};

const DEFAULT_LONGEVITY: i64 = 90;
const DEFAULT_STOCK_PCT: i64 = 60;
const DEFAULT_RETURN: f64 = 0.08;
const MAX_RETURN: f64 = 0.30;
const DEFAULT_SS_START_AGE: i64 = 67;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliSurvivorship {
    BothSpouses,
    FirstPersonOnly,
    SecondPersonOnly,
}

impl From<CliSurvivorship> for SurvivorshipPolicy {
    fn from(value: CliSurvivorship) -> Self {
        match value {
            CliSurvivorship::BothSpouses => SurvivorshipPolicy::BothSpouses,
            CliSurvivorship::FirstPersonOnly => SurvivorshipPolicy::FirstPersonOnly,
            CliSurvivorship::SecondPersonOnly => SurvivorshipPolicy::SecondPersonOnly,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "roth-convert",
    about = "Roth conversion projection and comparison (baseline vs convert now)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[command(flatten)]
        defaults: AnalysisDefaults,
    },
    /// Analyze a request payload stored in a JSON file
    Analyze {
        file: PathBuf,
        #[arg(long, help = "Include both year-by-year projections in the output")]
        projection: bool,
        #[command(flatten)]
        defaults: AnalysisDefaults,
    },
}

/// Analysis settings applied when a request does not override them.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct AnalysisDefaults {
    #[arg(long, default_value_t = 2026, help = "Tax year whose rules are applied")]
    pub as_of_year: u32,
    #[arg(long, default_value_t = 4.0, help = "Taxable account growth in percent")]
    pub taxable_return: f64,
    #[arg(long, default_value_t = 2.0, help = "Pension cost-of-living adjustment in percent")]
    pub pension_cola_rate: f64,
    #[arg(long, help = "Annual household spending funded from the accounts")]
    pub annual_spending: Option<f64>,
    #[arg(long, default_value_t = 0.0, help = "Annual spending growth in percent")]
    pub spending_growth: f64,
    #[arg(long, value_enum, default_value_t = CliSurvivorship::BothSpouses)]
    pub survivorship: CliSurvivorship,
    #[arg(long, help = "Scale Social Security by the full-retirement-age-67 claiming curve")]
    pub claiming_curve: bool,
    #[arg(
        long,
        default_value_t = 50.0,
        help = "Breakeven within this percent of the horizon earns a strong recommendation"
    )]
    pub strong_breakeven_pct: f64,
}

impl Default for AnalysisDefaults {
    fn default() -> Self {
        Self {
            as_of_year: 2026,
            taxable_return: 4.0,
            pension_cola_rate: 2.0,
            annual_spending: None,
            spending_growth: 0.0,
            survivorship: CliSurvivorship::BothSpouses,
            claiming_curve: false,
            strong_breakeven_pct: 50.0,
        }
    }
}

impl AnalysisDefaults {
    fn to_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            as_of_year: self.as_of_year,
            conversion_amount: None,
            taxable_return: self.taxable_return / 100.0,
            pension_cola_rate: self.pension_cola_rate / 100.0,
            spending: self.annual_spending.map(|annual_amount| SpendingPlan {
                annual_amount,
                growth_rate: self.spending_growth / 100.0,
            }),
            claiming_curve: self
                .claiming_curve
                .then(ClaimingCurve::full_retirement_age_67),
            survivorship: self.survivorship.into(),
            filing_status: None,
            strong_breakeven_fraction: self.strong_breakeven_pct / 100.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ApiNumPeople {
    Single,
    Couple,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ApiSurvivorship {
    #[serde(alias = "both")]
    BothSpouses,
    #[serde(alias = "person1")]
    FirstPersonOnly,
    #[serde(alias = "person2")]
    SecondPersonOnly,
}

impl From<ApiSurvivorship> for SurvivorshipPolicy {
    fn from(value: ApiSurvivorship) -> Self {
        match value {
            ApiSurvivorship::BothSpouses => SurvivorshipPolicy::BothSpouses,
            ApiSurvivorship::FirstPersonOnly => SurvivorshipPolicy::FirstPersonOnly,
            ApiSurvivorship::SecondPersonOnly => SurvivorshipPolicy::SecondPersonOnly,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ApiFilingStatus {
    Single,
    #[serde(alias = "mfj")]
    MarriedFilingJointly,
}

impl From<ApiFilingStatus> for FilingStatus {
    fn from(value: ApiFilingStatus) -> Self {
        match value {
            ApiFilingStatus::Single => FilingStatus::Single,
            ApiFilingStatus::MarriedFilingJointly => FilingStatus::MarriedFilingJointly,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
enum ApiClaimingCurve {
    Standard(bool),
    Factors(Vec<f64>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemographicsPayload {
    num_people: Option<ApiNumPeople>,
    age_person1: Option<i64>,
    age_person2: Option<i64>,
    longevity_person1: Option<i64>,
    longevity_person2: Option<i64>,
    retirement_year_person1: Option<i64>,
    retirement_year_person2: Option<i64>,
    taxable_income: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InheritancePayload {
    amount: Option<f64>,
    year: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IncomePayload {
    social_security_person1: Option<f64>,
    social_security_start_age_person1: Option<i64>,
    pension_person1: Option<f64>,
    pension_cola_person1: Option<bool>,
    pension_survivorship_person1: Option<f64>,

    social_security_person2: Option<f64>,
    social_security_start_age_person2: Option<i64>,
    pension_person2: Option<f64>,
    pension_cola_person2: Option<bool>,
    pension_survivorship_person2: Option<f64>,

    rental_income: Option<f64>,
    other_income: Option<f64>,
    inheritances: Vec<InheritancePayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CapitalPayload {
    bank_accounts_person1: Option<f64>,
    brokerage_non_retirement_person1: Option<f64>,
    crypto_person1: Option<f64>,
    precious_metals_person1: Option<f64>,
    bank_accounts_person2: Option<f64>,
    brokerage_non_retirement_person2: Option<f64>,
    crypto_person2: Option<f64>,
    precious_metals_person2: Option<f64>,

    emergency_fund: Option<f64>,
    large_purchases: Option<f64>,

    before_tax_ira_person1: Option<f64>,
    before_tax_ira_person2: Option<f64>,
    roth_person1: Option<f64>,
    roth_person2: Option<f64>,

    allocation_traditional_person1: Option<i64>,
    return_traditional_person1: Option<f64>,
    allocation_traditional_person2: Option<i64>,
    return_traditional_person2: Option<f64>,
    allocation_roth_person1: Option<i64>,
    return_roth_person1: Option<f64>,
    allocation_roth_person2: Option<i64>,
    return_roth_person2: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OptionsPayload {
    as_of_year: Option<i64>,
    conversion_amount: Option<f64>,
    annual_spending: Option<f64>,
    spending_growth: Option<f64>,
    taxable_return: Option<f64>,
    pension_cola_rate: Option<f64>,
    survivorship: Option<ApiSurvivorship>,
    claiming_curve: Option<ApiClaimingCurve>,
    filing_status: Option<ApiFilingStatus>,
    strong_breakeven_fraction: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalyzePayload {
    demographics: DemographicsPayload,
    income: IncomePayload,
    capital: CapitalPayload,
    options: Option<OptionsPayload>,
}

/// One person's fields, gathered from the three payload groups.
#[derive(Debug, Default, Clone, Copy)]
struct PersonFields {
    age: Option<i64>,
    longevity: Option<i64>,
    retirement_year: Option<i64>,
    social_security: Option<f64>,
    social_security_start_age: Option<i64>,
    pension: Option<f64>,
    pension_cola: Option<bool>,
    pension_survivorship: Option<f64>,
    bank_accounts: Option<f64>,
    brokerage_non_retirement: Option<f64>,
    crypto: Option<f64>,
    precious_metals: Option<f64>,
    before_tax_ira: Option<f64>,
    roth: Option<f64>,
    allocation_traditional: Option<i64>,
    return_traditional: Option<f64>,
    allocation_roth: Option<i64>,
    return_roth: Option<f64>,
}

impl PersonFields {
    fn first(payload: &AnalyzePayload) -> Self {
        let (d, i, c) = (&payload.demographics, &payload.income, &payload.capital);
        Self {
            age: d.age_person1,
            longevity: d.longevity_person1,
            retirement_year: d.retirement_year_person1,
            social_security: i.social_security_person1,
            social_security_start_age: i.social_security_start_age_person1,
            pension: i.pension_person1,
            pension_cola: i.pension_cola_person1,
            pension_survivorship: i.pension_survivorship_person1,
            bank_accounts: c.bank_accounts_person1,
            brokerage_non_retirement: c.brokerage_non_retirement_person1,
            crypto: c.crypto_person1,
            precious_metals: c.precious_metals_person1,
            before_tax_ira: c.before_tax_ira_person1,
            roth: c.roth_person1,
            allocation_traditional: c.allocation_traditional_person1,
            return_traditional: c.return_traditional_person1,
            allocation_roth: c.allocation_roth_person1,
            return_roth: c.return_roth_person1,
        }
    }

    fn second(payload: &AnalyzePayload) -> Self {
        let (d, i, c) = (&payload.demographics, &payload.income, &payload.capital);
        Self {
            age: d.age_person2,
            longevity: d.longevity_person2,
            retirement_year: d.retirement_year_person2,
            social_security: i.social_security_person2,
            social_security_start_age: i.social_security_start_age_person2,
            pension: i.pension_person2,
            pension_cola: i.pension_cola_person2,
            pension_survivorship: i.pension_survivorship_person2,
            bank_accounts: c.bank_accounts_person2,
            brokerage_non_retirement: c.brokerage_non_retirement_person2,
            crypto: c.crypto_person2,
            precious_metals: c.precious_metals_person2,
            before_tax_ira: c.before_tax_ira_person2,
            roth: c.roth_person2,
            allocation_traditional: c.allocation_traditional_person2,
            return_traditional: c.return_traditional_person2,
            allocation_roth: c.allocation_roth_person2,
            return_roth: c.return_roth_person2,
        }
    }

    /// Name of the first field that is set, using its person-2 payload key.
    fn first_present_person2_key(&self) -> Option<&'static str> {
        [
            ("age_person2", self.age.is_some()),
            ("longevity_person2", self.longevity.is_some()),
            ("retirement_year_person2", self.retirement_year.is_some()),
            ("social_security_person2", self.social_security.is_some()),
            (
                "social_security_start_age_person2",
                self.social_security_start_age.is_some(),
            ),
            ("pension_person2", self.pension.is_some()),
            ("pension_cola_person2", self.pension_cola.is_some()),
            (
                "pension_survivorship_person2",
                self.pension_survivorship.is_some(),
            ),
            ("bank_accounts_person2", self.bank_accounts.is_some()),
            (
                "brokerage_non_retirement_person2",
                self.brokerage_non_retirement.is_some(),
            ),
            ("crypto_person2", self.crypto.is_some()),
            ("precious_metals_person2", self.precious_metals.is_some()),
            ("before_tax_ira_person2", self.before_tax_ira.is_some()),
            ("roth_person2", self.roth.is_some()),
            (
                "allocation_traditional_person2",
                self.allocation_traditional.is_some(),
            ),
            ("return_traditional_person2", self.return_traditional.is_some()),
            ("allocation_roth_person2", self.allocation_roth.is_some()),
            ("return_roth_person2", self.return_roth.is_some()),
        ]
        .into_iter()
        .find(|(_, present)| *present)
        .map(|(key, _)| key)
    }
}

#[derive(Debug)]
struct ApiRequest {
    profile: HouseholdProfile,
    config: AnalysisConfig,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid request JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn key(name: &str, index: usize) -> String {
    format!("{name}_person{}", index + 1)
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ValidationError> {
    value.ok_or_else(|| ValidationError::new(field, "is required"))
}

fn int_in_range(value: i64, field: &str, lo: i64, hi: i64) -> Result<u32, ValidationError> {
    if !(lo..=hi).contains(&value) {
        return Err(ValidationError::new(
            field,
            format!("must be between {lo} and {hi}"),
        ));
    }
    Ok(value as u32)
}

fn dollars(value: Option<f64>, field: &str) -> Result<f64, ValidationError> {
    let amount = value.unwrap_or(0.0);
    if !amount.is_finite() || amount < 0.0 {
        return Err(ValidationError::new(field, "must be a non-negative amount"));
    }
    Ok(amount)
}

fn allocation(
    pct: Option<i64>,
    rate: Option<f64>,
    pct_field: &str,
    rate_field: &str,
) -> Result<Allocation, ValidationError> {
    let stock_pct = int_in_range(pct.unwrap_or(DEFAULT_STOCK_PCT), pct_field, 0, 100)?;
    let expected_return = rate.unwrap_or(DEFAULT_RETURN);
    if !expected_return.is_finite() || !(0.0..=MAX_RETURN).contains(&expected_return) {
        return Err(ValidationError::new(
            rate_field,
            format!("must be between 0 and {MAX_RETURN}"),
        ));
    }
    Ok(Allocation {
        stock_pct,
        expected_return,
    })
}

fn build_person(fields: PersonFields, index: usize) -> Result<Person, ValidationError> {
    let age = int_in_range(required(fields.age, &key("age", index))?, &key("age", index), 18, 100)?;
    let longevity = int_in_range(
        fields.longevity.unwrap_or(DEFAULT_LONGEVITY),
        &key("longevity", index),
        60,
        120,
    )?;
    let retirement_year = int_in_range(
        required(fields.retirement_year, &key("retirement_year", index))?,
        &key("retirement_year", index),
        1950,
        2100,
    )?;
    let start_age = int_in_range(
        fields
            .social_security_start_age
            .unwrap_or(DEFAULT_SS_START_AGE),
        &key("social_security_start_age", index),
        62,
        70,
    )?;
    let survivorship_pct = fields.pension_survivorship.unwrap_or(0.0);
    if !(0.0..=100.0).contains(&survivorship_pct) {
        return Err(ValidationError::new(
            key("pension_survivorship", index),
            "must be between 0 and 100",
        ));
    }

    Ok(Person {
        age,
        longevity,
        retirement_year,
        social_security: SocialSecurity {
            amount: dollars(fields.social_security, &key("social_security", index))?,
            start_age,
        },
        pension: Pension {
            amount: dollars(fields.pension, &key("pension", index))?,
            has_cola: fields.pension_cola.unwrap_or(false),
            survivorship_pct,
        },
        capital: PersonCapital {
            bank_accounts: dollars(fields.bank_accounts, &key("bank_accounts", index))?,
            brokerage_non_retirement: dollars(
                fields.brokerage_non_retirement,
                &key("brokerage_non_retirement", index),
            )?,
            crypto: dollars(fields.crypto, &key("crypto", index))?,
            precious_metals: dollars(fields.precious_metals, &key("precious_metals", index))?,
            before_tax_ira: dollars(fields.before_tax_ira, &key("before_tax_ira", index))?,
            roth: dollars(fields.roth, &key("roth", index))?,
        },
        traditional_allocation: allocation(
            fields.allocation_traditional,
            fields.return_traditional,
            &key("allocation_traditional", index),
            &key("return_traditional", index),
        )?,
        roth_allocation: allocation(
            fields.allocation_roth,
            fields.return_roth,
            &key("allocation_roth", index),
            &key("return_roth", index),
        )?,
    })
}

fn build_profile(payload: &AnalyzePayload) -> Result<HouseholdProfile, ValidationError> {
    let num_people = required(payload.demographics.num_people, "num_people")?;
    let first = build_person(PersonFields::first(payload), 0)?;
    let second_fields = PersonFields::second(payload);

    let household = match num_people {
        ApiNumPeople::Single => {
            if let Some(field) = second_fields.first_present_person2_key() {
                return Err(ValidationError::new(
                    field,
                    "must be absent when num_people is \"single\"",
                ));
            }
            Household::Single(first)
        }
        ApiNumPeople::Couple => Household::Couple(first, build_person(second_fields, 1)?),
    };

    let mut inheritances = Vec::with_capacity(payload.income.inheritances.len());
    for (idx, item) in payload.income.inheritances.iter().enumerate() {
        let amount_field = format!("inheritances[{idx}].amount");
        let year_field = format!("inheritances[{idx}].year");
        inheritances.push(Inheritance {
            amount: dollars(Some(required(item.amount, &amount_field)?), &amount_field)?,
            year: int_in_range(required(item.year, &year_field)?, &year_field, 2024, 2100)?,
        });
    }

    let profile = HouseholdProfile {
        household,
        income: HouseholdIncome {
            taxable_income: dollars(
                Some(required(payload.demographics.taxable_income, "taxable_income")?),
                "taxable_income",
            )?,
            rental_income: dollars(payload.income.rental_income, "rental_income")?,
            other_income: dollars(payload.income.other_income, "other_income")?,
            inheritances,
        },
        exclusions: Exclusions {
            emergency_fund: dollars(payload.capital.emergency_fund, "emergency_fund")?,
            large_purchases: dollars(payload.capital.large_purchases, "large_purchases")?,
        },
    };
    profile.validate()?;
    Ok(profile)
}

fn build_config(
    defaults: &AnalysisDefaults,
    options: Option<&OptionsPayload>,
) -> Result<AnalysisConfig, ValidationError> {
    let mut config = defaults.to_config();

    if let Some(options) = options {
        if let Some(v) = options.as_of_year {
            config.as_of_year = int_in_range(v, "options.as_of_year", 1900, 2200)?;
        }
        if let Some(v) = options.conversion_amount {
            config.conversion_amount = Some(v);
        }
        if let Some(v) = options.taxable_return {
            config.taxable_return = v;
        }
        if let Some(v) = options.pension_cola_rate {
            config.pension_cola_rate = v;
        }
        if let Some(v) = options.annual_spending {
            let growth_rate = config.spending.map(|plan| plan.growth_rate).unwrap_or(0.0);
            config.spending = Some(SpendingPlan {
                annual_amount: v,
                growth_rate,
            });
        }
        if let Some(v) = options.spending_growth {
            if let Some(plan) = config.spending.as_mut() {
                plan.growth_rate = v;
            }
        }
        if let Some(v) = options.survivorship {
            config.survivorship = v.into();
        }
        if let Some(curve) = &options.claiming_curve {
            config.claiming_curve = match curve {
                ApiClaimingCurve::Standard(true) => Some(ClaimingCurve::full_retirement_age_67()),
                ApiClaimingCurve::Standard(false) => None,
                ApiClaimingCurve::Factors(factors) => {
                    let factors: [f64; 9] = factors.as_slice().try_into().map_err(|_| {
                        ValidationError::new(
                            "options.claiming_curve",
                            "must list 9 factors for claiming ages 62 through 70",
                        )
                    })?;
                    if factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
                        return Err(ValidationError::new(
                            "options.claiming_curve",
                            "factors must be positive",
                        ));
                    }
                    Some(ClaimingCurve { factors })
                }
            };
        }
        if let Some(v) = options.filing_status {
            config.filing_status = Some(v.into());
        }
        if let Some(v) = options.strong_breakeven_fraction {
            config.strong_breakeven_fraction = v;
        }
    }

    config.validate()?;
    Ok(config)
}

fn api_request_from_payload(
    payload: &AnalyzePayload,
    defaults: &AnalysisDefaults,
) -> Result<ApiRequest, ValidationError> {
    Ok(ApiRequest {
        profile: build_profile(payload)?,
        config: build_config(defaults, payload.options.as_ref())?,
    })
}

#[cfg(test)]
fn api_request_from_json(
    json: &str,
    defaults: &AnalysisDefaults,
) -> Result<ApiRequest, ValidationError> {
    let payload = serde_json::from_str::<AnalyzePayload>(json)
        .map_err(|e| ValidationError::new("body", e.to_string()))?;
    api_request_from_payload(&payload, defaults)
}

pub fn analyze_file(
    path: &Path,
    defaults: &AnalysisDefaults,
    projection: bool,
) -> Result<String, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let payload = serde_json::from_str::<AnalyzePayload>(&raw)?;
    let request = api_request_from_payload(&payload, defaults)?;
    let rules = TaxRuleBook::standard();

    let json = if projection {
        let comparison = compare_projections(&request.profile, &request.config, &rules)?;
        serde_json::to_string_pretty(&comparison)?
    } else {
        let result = analyze_with_rules(&request.profile, &request.config, &rules)?;
        serde_json::to_string_pretty(&result)?
    };
    Ok(json)
}

struct ApiState {
    defaults: AnalysisDefaults,
    rules: TaxRuleBook,
}

// Dev servers of the browser frontend.
const ALLOWED_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:3000",
    "http://localhost",
];

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(ALLOWED_ORIGINS.map(HeaderValue::from_static))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}

fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/projection", post(projection_handler))
        .fallback(not_found_handler)
        .layer(cors_layer())
        .with_state(state)
}

pub async fn run_http_server(port: u16, defaults: AnalysisDefaults) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = Arc::new(ApiState {
        defaults,
        rules: TaxRuleBook::standard(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Roth conversion API listening");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "healthy",
            service: "Roth IRA Conversion Analyzer",
        },
    )
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found", None)
}

async fn analyze_handler(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<AnalyzePayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => analyze_handler_impl(&state, &payload, false),
        Err(rejection) => rejected_body(rejection),
    }
}

async fn projection_handler(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<AnalyzePayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => analyze_handler_impl(&state, &payload, true),
        Err(rejection) => rejected_body(rejection),
    }
}

fn rejected_body(rejection: JsonRejection) -> Response {
    warn!(error = %rejection.body_text(), "rejected request body");
    error_response(StatusCode::BAD_REQUEST, &rejection.body_text(), None)
}

fn analyze_handler_impl(state: &ApiState, payload: &AnalyzePayload, projection: bool) -> Response {
    let request = match api_request_from_payload(payload, &state.defaults) {
        Ok(request) => request,
        Err(e) => {
            warn!(field = %e.field, message = %e.message, "invalid analysis request");
            return error_response(
                StatusCode::BAD_REQUEST,
                &e.to_string(),
                Some(e.field.as_str()),
            );
        }
    };

    info!(
        as_of_year = request.config.as_of_year,
        people = request.profile.household.people().len(),
        projection,
        "analysis request"
    );

    let outcome = compare_projections(&request.profile, &request.config, &state.rules);
    match outcome {
        Ok(comparison) if projection => json_response(StatusCode::OK, comparison),
        Ok(comparison) => json_response(StatusCode::OK, comparison.result),
        Err(err) => engine_error_response(&err),
    }
}

fn engine_error_response(err: &EngineError) -> Response {
    match err {
        EngineError::Validation(e) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string(), Some(e.field.as_str()))
        }
        EngineError::TaxRules(TaxRuleError::UnsupportedTaxYear { .. }) => error_response(
            StatusCode::BAD_REQUEST,
            &err.to_string(),
            Some("options.as_of_year"),
        ),
        _ => {
            warn!(error = %err, "analysis failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string(), None)
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str, field: Option<&str>) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
            field: field.map(str::to_string),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BreakevenYears;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_state() -> ApiState {
        ApiState {
            defaults: AnalysisDefaults::default(),
            rules: TaxRuleBook::standard(),
        }
    }

    const SINGLE_JSON: &str = r#"{
      "demographics": {
        "num_people": "single",
        "age_person1": 65,
        "longevity_person1": 90,
        "retirement_year_person1": 2024,
        "taxable_income": 0
      },
      "income": {
        "social_security_person1": 30000,
        "social_security_start_age_person1": 67,
        "pension_person1": 0,
        "pension_cola_person1": false,
        "pension_survivorship_person1": 0,
        "rental_income": 0,
        "other_income": 0,
        "inheritances": []
      },
      "capital": {
        "bank_accounts_person1": 20000,
        "brokerage_non_retirement_person1": 40000,
        "before_tax_ira_person1": 500000,
        "roth_person1": 0,
        "allocation_traditional_person1": 60,
        "return_traditional_person1": 0.06,
        "allocation_roth_person1": 70,
        "return_roth_person1": 0.07
      }
    }"#;

    fn with_json_patch(base: &str, patch: serde_json::Value) -> String {
        let mut value: serde_json::Value = serde_json::from_str(base).expect("base json");
        for (group, fields) in patch.as_object().expect("patch object") {
            let target = value
                .as_object_mut()
                .expect("object")
                .entry(group.clone())
                .or_insert_with(|| serde_json::json!({}));
            for (k, v) in fields.as_object().expect("group object") {
                target
                    .as_object_mut()
                    .expect("group")
                    .insert(k.clone(), v.clone());
            }
        }
        value.to_string()
    }

    #[test]
    fn api_request_from_json_parses_single_payload() {
        let request =
            api_request_from_json(SINGLE_JSON, &AnalysisDefaults::default()).expect("valid");
        let Household::Single(person) = &request.profile.household else {
            panic!("expected single household");
        };

        assert_eq!(person.age, 65);
        assert_eq!(person.longevity, 90);
        assert_eq!(person.retirement_year, 2024);
        assert_eq!(person.social_security.start_age, 67);
        assert_approx(person.social_security.amount, 30_000.0);
        assert_approx(person.capital.taxable_assets(), 60_000.0);
        assert_approx(person.capital.before_tax_ira, 500_000.0);
        assert_eq!(person.roth_allocation.stock_pct, 70);
        assert_approx(person.roth_allocation.expected_return, 0.07);

        assert_eq!(request.config.as_of_year, 2026);
        assert_approx(request.config.taxable_return, 0.04);
        assert_approx(request.config.pension_cola_rate, 0.02);
        assert_eq!(request.config.survivorship, SurvivorshipPolicy::BothSpouses);
        assert!(request.config.spending.is_none());
    }

    #[test]
    fn missing_optional_fields_use_payload_defaults() {
        let json = r#"{
          "demographics": {
            "num_people": "single",
            "age_person1": 60,
            "retirement_year_person1": 2030,
            "taxable_income": 90000
          }
        }"#;
        let request = api_request_from_json(json, &AnalysisDefaults::default()).expect("valid");
        let person = request.profile.household.people()[0].clone();
        assert_eq!(person.longevity, 90);
        assert_eq!(person.traditional_allocation.stock_pct, 60);
        assert_approx(person.traditional_allocation.expected_return, 0.08);
        assert_approx(person.capital.before_tax_ira, 0.0);
        assert_approx(request.profile.income.taxable_income, 90_000.0);
        assert!(request.profile.income.inheritances.is_empty());
    }

    #[test]
    fn couple_payload_builds_both_people_and_exclusions() {
        let json = with_json_patch(
            SINGLE_JSON,
            serde_json::json!({
                "demographics": {
                    "num_people": "couple",
                    "age_person2": 62,
                    "longevity_person2": 95,
                    "retirement_year_person2": 2027
                },
                "income": {
                    "pension_person2": 24000,
                    "pension_cola_person2": true,
                    "pension_survivorship_person2": 75,
                    "inheritances": [{"amount": 150000, "year": 2030}]
                },
                "capital": {
                    "roth_person2": 80000,
                    "emergency_fund": 25000,
                    "large_purchases": 15000
                }
            }),
        );
        let request = api_request_from_json(&json, &AnalysisDefaults::default()).expect("valid");
        let Household::Couple(_, second) = &request.profile.household else {
            panic!("expected couple household");
        };

        assert_eq!(second.age, 62);
        assert_eq!(second.longevity, 95);
        assert!(second.pension.has_cola);
        assert_approx(second.pension.survivorship_pct, 75.0);
        assert_approx(second.capital.roth, 80_000.0);
        assert_approx(request.profile.exclusions.reserve(), 40_000.0);
        assert_eq!(
            request.profile.income.inheritances,
            vec![Inheritance {
                amount: 150_000.0,
                year: 2030
            }]
        );
    }

    #[test]
    fn single_payload_rejects_person2_fields() {
        let json = with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"capital": {"roth_person2": 1000}}),
        );
        let err = api_request_from_json(&json, &AnalysisDefaults::default()).expect_err("invalid");
        assert_eq!(err.field, "roth_person2");
    }

    #[test]
    fn couple_payload_requires_person2_age() {
        let json = with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"demographics": {"num_people": "couple", "retirement_year_person2": 2027}}),
        );
        let err = api_request_from_json(&json, &AnalysisDefaults::default()).expect_err("invalid");
        assert_eq!(err.field, "age_person2");
    }

    #[test]
    fn out_of_range_values_name_their_field() {
        let cases = [
            (serde_json::json!({"capital": {"return_roth_person1": 0.45}}), "return_roth_person1"),
            (
                serde_json::json!({"capital": {"allocation_traditional_person1": 140}}),
                "allocation_traditional_person1",
            ),
            (
                serde_json::json!({"income": {"social_security_start_age_person1": 61}}),
                "social_security_start_age_person1",
            ),
            (
                serde_json::json!({"capital": {"bank_accounts_person1": -5}}),
                "bank_accounts_person1",
            ),
            (
                serde_json::json!({"demographics": {"age_person1": 91}}),
                "longevity_person1",
            ),
            (
                serde_json::json!({"income": {"inheritances": [{"amount": 10, "year": 1999}]}}),
                "inheritances[0].year",
            ),
        ];
        for (patch, field) in cases {
            let json = with_json_patch(SINGLE_JSON, patch);
            let err =
                api_request_from_json(&json, &AnalysisDefaults::default()).expect_err("invalid");
            assert_eq!(err.field, field);
        }
    }

    #[test]
    fn request_options_override_server_defaults() {
        let mut defaults = AnalysisDefaults::default();
        defaults.annual_spending = Some(40_000.0);
        defaults.spending_growth = 3.0;

        let json = with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"options": {
                "as_of_year": 2025,
                "conversion_amount": 100000,
                "taxable_return": 0.05,
                "annual_spending": 55000,
                "survivorship": "first_person_only",
                "claiming_curve": true
            }}),
        );
        let request = api_request_from_json(&json, &defaults).expect("valid");
        let config = request.config;

        assert_eq!(config.as_of_year, 2025);
        assert_eq!(config.conversion_amount, Some(100_000.0));
        assert_approx(config.taxable_return, 0.05);
        assert_approx(config.pension_cola_rate, 0.02);
        let spending = config.spending.expect("spending");
        assert_approx(spending.annual_amount, 55_000.0);
        assert_approx(spending.growth_rate, 0.03);
        assert_eq!(config.survivorship, SurvivorshipPolicy::FirstPersonOnly);
        assert_eq!(
            config.claiming_curve,
            Some(ClaimingCurve::full_retirement_age_67())
        );
    }

    #[test]
    fn claiming_curve_factors_must_cover_every_age() {
        let json = with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"options": {"claiming_curve": [0.7, 0.8, 1.0]}}),
        );
        let err = api_request_from_json(&json, &AnalysisDefaults::default()).expect_err("invalid");
        assert_eq!(err.field, "options.claiming_curve");
    }

    #[test]
    fn analyze_handler_returns_ok_for_valid_payload() {
        let payload: AnalyzePayload = serde_json::from_str(SINGLE_JSON).expect("json");
        let response = analyze_handler_impl(&sample_state(), &payload, false);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .map(|v| v.to_str().expect("ascii")),
            Some("no-store")
        );

        let projection = analyze_handler_impl(&sample_state(), &payload, true);
        assert_eq!(projection.status(), StatusCode::OK);
    }

    #[test]
    fn analyze_handler_maps_errors_to_status_codes() {
        let invalid: AnalyzePayload = serde_json::from_str(&with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"demographics": {"num_people": null}}),
        ))
        .expect("json");
        let response = analyze_handler_impl(&sample_state(), &invalid, false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unsupported: AnalyzePayload = serde_json::from_str(&with_json_patch(
            SINGLE_JSON,
            serde_json::json!({"options": {"as_of_year": 2031}}),
        ))
        .expect("json");
        let response = analyze_handler_impl(&sample_state(), &unsupported, false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn analysis_result_serializes_with_snake_case_fields() {
        let request =
            api_request_from_json(SINGLE_JSON, &AnalysisDefaults::default()).expect("valid");
        let result =
            analyze_with_rules(&request.profile, &request.config, &TaxRuleBook::standard())
                .expect("analysis");
        let value = serde_json::to_value(&result).expect("json");

        for field in [
            "recommendation",
            "summary",
            "conversion_tax_cost",
            "breakeven_years",
            "lifetime_tax_savings",
            "projected_traditional_ira_value",
            "projected_roth_value",
            "key_factors",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        let recommendation = value["recommendation"].as_str().expect("string");
        assert!(["strong", "moderate", "not_recommended"].contains(&recommendation));
        match result.breakeven_years {
            BreakevenYears::Never => assert_eq!(value["breakeven_years"], "never"),
            BreakevenYears::Years(n) => assert_eq!(value["breakeven_years"], n),
        }
    }

    #[test]
    fn error_body_carries_field_only_when_known() {
        let with_field = serde_json::to_value(ErrorResponse {
            error: "invalid age_person1: is required".to_string(),
            field: Some("age_person1".to_string()),
        })
        .expect("json");
        assert_eq!(with_field["field"], "age_person1");

        let without_field = serde_json::to_value(ErrorResponse {
            error: "Not found".to_string(),
            field: None,
        })
        .expect("json");
        assert!(without_field.get("field").is_none());
    }

    #[test]
    fn cli_parses_serve_and_analyze_commands() {
        let cli = Cli::try_parse_from([
            "roth-convert",
            "serve",
            "--port",
            "9000",
            "--as-of-year",
            "2025",
            "--survivorship",
            "second-person-only",
        ])
        .expect("serve args");
        match cli.command {
            Command::Serve { port, defaults } => {
                assert_eq!(port, 9000);
                assert_eq!(defaults.as_of_year, 2025);
                assert_eq!(defaults.survivorship, CliSurvivorship::SecondPersonOnly);
                assert_approx(defaults.taxable_return, 4.0);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["roth-convert", "analyze", "request.json", "--projection"])
            .expect("analyze args");
        match cli.command {
            Command::Analyze {
                file,
                projection,
                defaults,
            } => {
                assert_eq!(file, PathBuf::from("request.json"));
                assert!(projection);
                assert_eq!(defaults, AnalysisDefaults::default());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    async fn send(request: axum::http::Request<axum::body::Body>) -> Response {
        use tower::ServiceExt;

        build_router(Arc::new(sample_state()))
            .oneshot(request)
            .await
            .expect("infallible router")
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let request = axum::http::Request::builder()
            .uri("/api/health")
            .body(axum::body::Body::empty())
            .expect("request");
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            body,
            serde_json::json!({"status": "healthy", "service": "Roth IRA Conversion Analyzer"})
        );
    }

    #[tokio::test]
    async fn preflight_allows_frontend_dev_origins_only() {
        for origin in ALLOWED_ORIGINS {
            let request = axum::http::Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/analyze")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(axum::body::Body::empty())
                .expect("request");
            let response = send(request).await;
            assert_eq!(
                response
                    .headers()
                    .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                    .map(|v| v.to_str().expect("ascii")),
                Some(origin)
            );
        }

        let request = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/analyze")
            .header(header::ORIGIN, "http://evil.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(axum::body::Body::empty())
            .expect("request");
        let response = send(request).await;
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }
}
