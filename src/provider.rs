use crate::config::Config;
use crate::errors::AppError;
use crate::models::{ConsentTerm, Simulation};
use crate::token::TokenCache;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Provider error type emitted when the requested installment value exceeds
/// the customer's margin. Expected during the descending-count attempts.
const ERR_ABOVE_MARGIN: &str = "simulation_installment_value_above_margin";
/// Provider error type emitted when an identical simulation already exists.
const ERR_ALREADY_EXISTS: &str = "simulation_already_exists";

/// Classified outcome of a failed simulation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// Installment value above the available margin; try a shorter count.
    AboveMargin,
    /// The provider already holds this simulation; try a shorter count.
    AlreadyExists,
    /// Anything else; logged and skipped.
    Other(String),
}

/// Signer phone split the way the provider expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermPhone {
    pub country_code: String,
    pub area_code: String,
    pub phone_number: String,
}

/// Payload of `POST /consult`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTermRequest {
    pub document_number: String,
    pub signer_name: String,
    pub signer_email: String,
    pub signer_phone: TermPhone,
    pub birth_date: String,
    pub gender: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTerm {
    id: String,
}

/// Payload of `POST /simulation`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub consult_id: String,
    pub config_id: String,
    pub number_of_installments: u32,
    pub installment_face_value: f64,
}

/// One rate configuration from `GET /simulation/configs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateConfig {
    pub id: String,
    #[serde(default)]
    pub monthly_interest_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RateConfigList {
    #[serde(default)]
    configs: Vec<RateConfig>,
}

#[derive(Debug, Deserialize)]
struct TermPage {
    #[serde(default)]
    data: Vec<ConsentTerm>,
}

/// Extracts the provider's own human-readable description out of an error
/// body, trying the fields the provider is known to use.
pub(crate) fn upstream_detail(body: &Value) -> Option<String> {
    for key in ["title", "detail", "message", "error", "description", "type"] {
        if let Some(text) = body.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    if let Some(text) = body.as_str() {
        return Some(text.to_string());
    }
    None
}

/// Client for the credit provider API. All calls carry a bearer token from
/// the shared token cache.
pub struct ProviderClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl ProviderClient {
    pub fn new(config: &Config, tokens: Arc<TokenCache>) -> Self {
        Self {
            client: Client::new(),
            base_url: config.provider_api_url.clone(),
            tokens,
        }
    }

    /// Submits consult-term creation. The provider's own error description is
    /// surfaced verbatim on failure.
    pub async fn create_term(&self, request: &CreateTermRequest) -> Result<String, AppError> {
        let token = self.tokens.get_valid_token().await?;
        let url = format!("{}/consult", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(request)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Term creation failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let detail = upstream_detail(&body)
                .unwrap_or_else(|| format!("Term creation returned status {}", status));
            tracing::error!("Term creation rejected by provider: {}", detail);
            return Err(AppError::ExternalApiError(detail));
        }

        let created: CreatedTerm = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse term creation response: {}", e))
        })?;

        Ok(created.id)
    }

    /// Authorizes a term. One-time side effect keyed by term id.
    pub async fn authorize_term(&self, term_id: &str) -> Result<(), AppError> {
        let token = self.tokens.get_valid_token().await?;
        let url = format!("{}/consult/{}/authorize", self.base_url, term_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({}))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Authorize failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let detail = upstream_detail(&body)
                .unwrap_or_else(|| format!("Authorize returned status {}", status));
            return Err(AppError::ExternalApiError(detail));
        }

        Ok(())
    }

    /// Lists terms issued in the trailing 30 days, optionally narrowed by a
    /// search key (the CPF).
    pub async fn list_terms(
        &self,
        search: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Vec<ConsentTerm>, AppError> {
        let token = self.tokens.get_valid_token().await?;
        let url = format!("{}/consult", self.base_url);

        let end = Utc::now();
        let start = end - chrono::Duration::days(30);

        let mut query: Vec<(&str, String)> = vec![
            ("startDate", start.to_rfc3339()),
            ("endDate", end.to_rfc3339()),
            ("limit", "100".to_string()),
            ("page", "1".to_string()),
        ];
        if let Some(search) = search {
            query.push(("search", search.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&query)
            .timeout(call_timeout)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Term listing failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let detail = upstream_detail(&body)
                .unwrap_or_else(|| format!("Term listing returned status {}", status));
            return Err(AppError::ExternalApiError(detail));
        }

        let page: TermPage = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse term listing: {}", e))
        })?;

        Ok(page.data)
    }

    /// Live status of one term, resolved through the listing endpoint.
    /// Status polls run on a shorter transport timeout than mutations.
    pub async fn term_status(&self, term_id: &str) -> Result<Option<ConsentTerm>, AppError> {
        let terms = self.list_terms(None, Duration::from_secs(15)).await?;
        Ok(terms.into_iter().find(|t| t.id == term_id))
    }

    /// Available rate configurations for simulations.
    pub async fn simulation_configs(&self) -> Result<Vec<RateConfig>, AppError> {
        let token = self.tokens.get_valid_token().await?;
        let url = format!("{}/simulation/configs", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Config listing failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::ExternalApiError(format!(
                "Config listing returned status {}",
                status
            )));
        }

        let list: RateConfigList = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse config listing: {}", e))
        })?;

        Ok(list.configs)
    }

    /// Submits one simulation attempt. Failures come back classified so the
    /// attempter can decide whether the next installment count is worth
    /// trying.
    pub async fn create_simulation(
        &self,
        request: &SimulationRequest,
    ) -> Result<Simulation, SimulationError> {
        let token = self
            .tokens
            .get_valid_token()
            .await
            .map_err(|e| SimulationError::Other(e.to_string()))?;
        let url = format!("{}/simulation", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(request)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| SimulationError::Other(format!("Simulation request failed: {}", e)))?;

        if !response.status().is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let kind = body.get("type").and_then(Value::as_str).unwrap_or("");
            return Err(match kind {
                ERR_ABOVE_MARGIN => SimulationError::AboveMargin,
                ERR_ALREADY_EXISTS => SimulationError::AlreadyExists,
                _ => SimulationError::Other(
                    upstream_detail(&body).unwrap_or_else(|| "Simulation rejected".to_string()),
                ),
            });
        }

        response
            .json()
            .await
            .map_err(|e| SimulationError::Other(format!("Failed to parse simulation: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upstream_detail_prefers_the_first_known_field() {
        let body = json!({"title": "Margem indisponivel", "detail": "ignored"});
        assert_eq!(upstream_detail(&body).as_deref(), Some("Margem indisponivel"));

        let body = json!({"type": ERR_ABOVE_MARGIN});
        assert_eq!(upstream_detail(&body).as_deref(), Some(ERR_ABOVE_MARGIN));

        assert_eq!(upstream_detail(&json!({})), None);
    }
}
