use crate::errors::FlowFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Provider-defined status of a consent term.
///
/// The set is closed on the provider side, but unknown strings still
/// round-trip through `Other` so a new status can never break
/// deserialization of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TermStatus {
    WaitingConsent,
    WaitingConsult,
    Success,
    WaitingCreditAnalysis,
    Rejected,
    Failed,
    Other(String),
}

impl TermStatus {
    /// Approved-class statuses both expose an available margin and permit
    /// simulation.
    pub fn is_approved(&self) -> bool {
        matches!(self, TermStatus::Success | TermStatus::WaitingCreditAnalysis)
    }

    /// Statuses the poll loop keeps waiting on.
    pub fn is_pending(&self) -> bool {
        matches!(self, TermStatus::WaitingConsent | TermStatus::WaitingConsult)
    }

    /// Hard-stop statuses.
    pub fn is_terminal_negative(&self) -> bool {
        matches!(self, TermStatus::Rejected | TermStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TermStatus::WaitingConsent => "WAITING_CONSENT",
            TermStatus::WaitingConsult => "WAITING_CONSULT",
            TermStatus::Success => "SUCCESS",
            TermStatus::WaitingCreditAnalysis => "WAITING_CREDIT_ANALYSIS",
            TermStatus::Rejected => "REJECTED",
            TermStatus::Failed => "FAILED",
            TermStatus::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for TermStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "WAITING_CONSENT" => TermStatus::WaitingConsent,
            "WAITING_CONSULT" => TermStatus::WaitingConsult,
            "SUCCESS" => TermStatus::Success,
            "WAITING_CREDIT_ANALYSIS" => TermStatus::WaitingCreditAnalysis,
            "REJECTED" => TermStatus::Rejected,
            "FAILED" => TermStatus::Failed,
            _ => TermStatus::Other(s),
        }
    }
}

impl From<TermStatus> for String {
    fn from(status: TermStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for TermStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deserializes a numeric field the provider sometimes returns as a string.
fn de_lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

/// A provider-side consent term as observed through the listing endpoint.
///
/// Immutable to this system except for the one-time authorize side effect;
/// status transitions are provider-driven and observed via polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentTerm {
    pub id: String,
    pub status: TermStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub available_margin_value: Option<f64>,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub partner_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ConsentTerm {
    pub fn margin(&self) -> f64 {
        self.available_margin_value.unwrap_or(0.0)
    }
}

/// A concrete loan offer computed against an approved term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    #[serde(default)]
    pub installment_count: u32,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub installment_value: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub disbursement_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub operation_amount: Option<f64>,
    #[serde(default)]
    pub config_id: Option<String>,
    #[serde(default)]
    pub consult_id: Option<String>,
}

impl Simulation {
    /// A simulation with neither a disbursement nor an operation amount is
    /// treated as absent, regardless of HTTP success.
    pub fn is_valid(&self) -> bool {
        self.disbursement_amount.unwrap_or(0.0) > 0.0
            || self.operation_amount.unwrap_or(0.0) > 0.0
    }

    /// Amount released to the customer, for CRM write-back.
    pub fn released_amount(&self) -> f64 {
        self.disbursement_amount
            .filter(|v| *v > 0.0)
            .or(self.operation_amount)
            .unwrap_or(0.0)
    }
}

/// Postal address as carried by the CRM opportunity form fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

/// PIX payout details.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixDetails {
    #[serde(default)]
    pub key_type: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Assembled customer data for one flow execution. Once built (from the CRM
/// or from caller-supplied data) it is treated as immutable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    /// 11-digit taxpayer id, the canonical identity key.
    pub cpf: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Normalized to YYYY-MM-DD.
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub mother_name: Option<String>,
    #[serde(default)]
    pub rg: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub pix: Option<PixDetails>,
}

/// Caller-supplied customer data on `POST /flow/run`. When complete (name,
/// phone and birth date all present) the CRM is never queried.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub mother_name: Option<String>,
    #[serde(default)]
    pub rg: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub pix: Option<PixDetails>,
}

impl CustomerInput {
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().map(str::trim).is_some_and(|s| !s.is_empty());
        filled(&self.name) && filled(&self.phone) && filled(&self.birth_date)
    }
}

/// A CRM opportunity row as returned by the pipeline listing.
///
/// `mainmail` is repurposed by the CRM operators to hold the raw CPF, which
/// is why lookups match on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmOpportunity {
    pub id: i64,
    #[serde(default, rename = "fkStage")]
    pub stage: Option<i64>,
    #[serde(default, rename = "fkPipeline")]
    pub pipeline: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mainphone: Option<String>,
    #[serde(default)]
    pub mainmail: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub value: Option<f64>,
    #[serde(default)]
    pub formsdata: HashMap<String, Value>,
    /// The CRM returns tags either as an array or as a comma-joined string.
    #[serde(default)]
    pub tags: Option<Value>,
}

impl CrmOpportunity {
    /// Opaque form-field value as a trimmed string, dropping the CRM's
    /// literal `"null"` placeholder.
    pub fn form_field(&self, key: &str) -> Option<String> {
        self.formsdata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "null")
            .map(str::to_string)
    }

    /// Tags normalized to integers regardless of the wire shape.
    pub fn tag_ids(&self) -> Vec<i64> {
        match &self.tags {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| {
                    v.as_i64()
                        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                })
                .collect(),
            Some(Value::String(joined)) => joined
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One entry of the approved-offer cache, keyed by CPF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub cpf: String,
    pub consent_term_id: String,
    #[serde(default)]
    pub simulation: Option<Simulation>,
    pub customer: CustomerRecord,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /flow/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    pub cpf: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub installments: Option<u32>,
    #[serde(default)]
    pub force_new_term: bool,
    #[serde(default)]
    pub customer: Option<CustomerInput>,
}

/// Normalized result of one flow execution, success or failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<ConsentTerm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<Simulation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TermStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FlowFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl FlowReport {
    pub fn success(
        term: ConsentTerm,
        simulation: Simulation,
        opportunity_id: Option<i64>,
    ) -> Self {
        FlowReport {
            success: true,
            status: Some(term.status.clone()),
            term: Some(term),
            simulation: Some(simulation),
            failure: None,
            failure_reason: None,
            opportunity_id,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        failure: FlowFailure,
        term: Option<ConsentTerm>,
        opportunity_id: Option<i64>,
    ) -> Self {
        FlowReport {
            success: false,
            status: term.as_ref().map(|t| t.status.clone()),
            term,
            simulation: None,
            failure_reason: Some(failure.reason()),
            failure: Some(failure),
            opportunity_id,
            timestamp: Utc::now(),
        }
    }
}

/// Body of `POST /cache`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOfferRequest {
    pub cpf: String,
    pub consent_term_id: String,
    #[serde(default)]
    pub simulation: Option<Simulation>,
    pub customer: CustomerRecord,
}
