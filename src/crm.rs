use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Address, CrmOpportunity, CustomerRecord, PixDetails};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Tag applied to opportunities that went through an approved flow.
pub const APPROVED_TAG: i64 = 6;

/// Opaque CRM form-field ids, the single source of truth for the
/// `CustomerRecord <-> formsdata` mapping. The ids are fixed by the CRM
/// tenant configuration.
pub mod fields {
    pub const EMAIL: &str = "9e7f92b0";
    pub const BIRTH_DATE: &str = "0bfc6250";
    pub const MOTHER_NAME: &str = "917456f0";
    pub const RG: &str = "6a93f650";
    pub const POSTAL_CODE: &str = "1836e090";
    pub const STREET: &str = "1dbfcef0";
    pub const NUMBER: &str = "6ac31450";
    pub const NEIGHBORHOOD: &str = "3271f710";
    pub const CITY: &str = "25178280";
    pub const STATE: &str = "f6384400";
    pub const PIX_KEY: &str = "98011220";
    pub const PIX_KEY_TYPE: &str = "769db520";
    pub const PAYMENT_TYPE: &str = "7f6a0eb0";
}

/// Normalized acknowledgement for loosely-typed CRM mutation responses.
///
/// The CRM signals success through several interchangeable shapes
/// (`success`, a returned `id`, `status == "success"`, `result == true`);
/// business logic only ever inspects this adapter's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub ok: bool,
    pub id: Option<i64>,
}

impl Ack {
    pub fn from_response(body: &Value) -> Self {
        let truthy = |v: &Value| v.as_bool() == Some(true) || v.as_str() == Some("true");

        let id = body
            .get("id")
            .or_else(|| body.get("opportunityId"))
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));

        let ok = id.is_some()
            || body.get("success").is_some_and(truthy)
            || body.get("result").is_some_and(truthy)
            || body.get("status").and_then(Value::as_str) == Some("success");

        Ack { ok, id }
    }
}

/// Builds a `CustomerRecord` out of a CRM opportunity, applying the email
/// fallback and the form-field mapping table.
pub fn customer_from_opportunity(opportunity: &CrmOpportunity) -> CustomerRecord {
    let cpf = opportunity.mainmail.clone().unwrap_or_default();
    let email = opportunity
        .form_field(fields::EMAIL)
        .filter(|e| e.contains('@'))
        .unwrap_or_else(|| format!("{}@gmail.com", cpf));

    let address = Address {
        street: opportunity.form_field(fields::STREET),
        number: opportunity.form_field(fields::NUMBER),
        neighborhood: opportunity.form_field(fields::NEIGHBORHOOD),
        city: opportunity.form_field(fields::CITY),
        state: opportunity.form_field(fields::STATE),
        postal_code: opportunity.form_field(fields::POSTAL_CODE),
    };

    CustomerRecord {
        cpf,
        name: opportunity.title.clone().unwrap_or_default(),
        phone: opportunity.mainphone.clone().unwrap_or_default(),
        email: Some(email),
        birth_date: opportunity.form_field(fields::BIRTH_DATE),
        mother_name: opportunity.form_field(fields::MOTHER_NAME),
        rg: opportunity.form_field(fields::RG),
        address: Some(address),
        pix: Some(PixDetails {
            key_type: opportunity.form_field(fields::PIX_KEY_TYPE),
            key: opportunity.form_field(fields::PIX_KEY),
        }),
    }
}

/// Projects a `CustomerRecord` back into the CRM form-field map, emitting
/// only the fields that carry a value.
pub fn forms_data_from_customer(customer: &CustomerRecord) -> Map<String, Value> {
    let mut forms = Map::new();
    let mut put = |key: &str, value: Option<&String>| {
        if let Some(v) = value.map(|s| s.trim()).filter(|s| !s.is_empty()) {
            forms.insert(key.to_string(), Value::String(v.to_string()));
        }
    };

    put(fields::EMAIL, customer.email.as_ref());
    put(fields::BIRTH_DATE, customer.birth_date.as_ref());
    put(fields::MOTHER_NAME, customer.mother_name.as_ref());
    put(fields::RG, customer.rg.as_ref());

    if let Some(address) = &customer.address {
        put(fields::STREET, address.street.as_ref());
        put(fields::NUMBER, address.number.as_ref());
        put(fields::NEIGHBORHOOD, address.neighborhood.as_ref());
        put(fields::CITY, address.city.as_ref());
        put(fields::STATE, address.state.as_ref());
        put(fields::POSTAL_CODE, address.postal_code.as_ref());
    }

    if let Some(pix) = &customer.pix {
        put(fields::PIX_KEY, pix.key.as_ref());
        put(fields::PIX_KEY_TYPE, pix.key_type.as_ref());
    }

    forms
}

/// Client for the CRM integration API. Authenticated by a static API key
/// embedded in each request body.
#[derive(Clone)]
pub struct CrmClient {
    client: Client,
    base_url: String,
    api_key: String,
    queue_id: i64,
    lookup_pipelines: Vec<i64>,
}

impl CrmClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.crm_api_url.clone(),
            api_key: config.crm_api_key.clone(),
            queue_id: config.crm_queue_id,
            lookup_pipelines: config.crm_lookup_pipelines.clone(),
        }
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, AppError> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("CRM request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "CRM {} returned status {}: {}",
                endpoint, status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Failed to parse CRM response: {}", e)))
    }

    /// Lists every opportunity of one pipeline.
    pub async fn list_pipeline(&self, pipeline_id: i64) -> Result<Vec<CrmOpportunity>, AppError> {
        let body = json!({
            "queueId": self.queue_id,
            "apiKey": self.api_key,
            "pipelineId": pipeline_id,
        });

        let response = self.post("findOpportunities", body).await?;
        match serde_json::from_value(response) {
            Ok(list) => Ok(list),
            Err(e) => Err(AppError::ExternalApiError(format!(
                "Unexpected CRM pipeline listing shape: {}",
                e
            ))),
        }
    }

    /// Looks an opportunity up by CPF across the configured pipelines.
    /// Placement is not guaranteed, so each pipeline is scanned in order;
    /// a failing pipeline is logged and skipped.
    pub async fn find_opportunity_by_cpf(
        &self,
        cpf: &str,
    ) -> Result<Option<CrmOpportunity>, AppError> {
        for pipeline in &self.lookup_pipelines {
            tracing::debug!("[{}] Scanning CRM pipeline {}", cpf, pipeline);
            match self.list_pipeline(*pipeline).await {
                Ok(opportunities) => {
                    if let Some(found) = opportunities
                        .into_iter()
                        .find(|o| o.mainmail.as_deref() == Some(cpf))
                    {
                        tracing::info!(
                            "[{}] Opportunity {} found in pipeline {}",
                            cpf,
                            found.id,
                            pipeline
                        );
                        return Ok(Some(found));
                    }
                }
                Err(e) => {
                    tracing::warn!("[{}] Pipeline {} lookup failed: {}", cpf, pipeline, e);
                    continue;
                }
            }
        }

        tracing::info!("[{}] No opportunity found in pipelines {:?}", cpf, self.lookup_pipelines);
        Ok(None)
    }

    /// Fetches one opportunity by id, scanning the same pipelines the CPF
    /// lookup uses.
    pub async fn find_opportunity_by_id(
        &self,
        opportunity_id: i64,
    ) -> Result<Option<CrmOpportunity>, AppError> {
        for pipeline in &self.lookup_pipelines {
            match self.list_pipeline(*pipeline).await {
                Ok(opportunities) => {
                    if let Some(found) = opportunities.into_iter().find(|o| o.id == opportunity_id)
                    {
                        return Ok(Some(found));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Pipeline {} lookup for opportunity {} failed: {}",
                        pipeline,
                        opportunity_id,
                        e
                    );
                    continue;
                }
            }
        }

        Ok(None)
    }

    /// Creates an opportunity. `extra` is merged over the authenticated base
    /// payload.
    pub async fn create_opportunity(&self, extra: Map<String, Value>) -> Result<Ack, AppError> {
        let mut body = Map::new();
        body.insert("queueId".to_string(), json!(self.queue_id));
        body.insert("apiKey".to_string(), json!(self.api_key));
        body.extend(extra);

        let response = self.post("createOpportunity", Value::Object(body)).await?;
        Ok(Ack::from_response(&response))
    }

    /// Updates an opportunity's direct fields and/or form data.
    pub async fn update_opportunity(
        &self,
        opportunity_id: i64,
        extra: Map<String, Value>,
    ) -> Result<Ack, AppError> {
        let mut body = Map::new();
        body.insert("queueId".to_string(), json!(self.queue_id));
        body.insert("apiKey".to_string(), json!(self.api_key));
        body.insert("id".to_string(), json!(opportunity_id));
        body.extend(extra);

        let response = self.post("updateOpportunity", Value::Object(body)).await?;
        Ok(Ack::from_response(&response))
    }

    /// Writes a partial form-field update.
    pub async fn update_forms_data(
        &self,
        opportunity_id: i64,
        forms: Map<String, Value>,
    ) -> Result<Ack, AppError> {
        let mut extra = Map::new();
        extra.insert("formsdata".to_string(), Value::Object(forms));
        self.update_opportunity(opportunity_id, extra).await
    }

    /// Advances an opportunity to another pipeline stage.
    pub async fn change_stage(
        &self,
        opportunity_id: i64,
        dest_stage_id: i64,
    ) -> Result<Ack, AppError> {
        let body = json!({
            "queueId": self.queue_id,
            "apiKey": self.api_key,
            "id": opportunity_id,
            "destStageId": dest_stage_id,
        });

        let response = self.post("changeStage", body).await?;
        Ok(Ack::from_response(&response))
    }
}
