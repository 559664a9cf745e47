/// End-to-end flow coordinator tests with mocked provider and CRM APIs.
use consig_flow_api::cache::OfferCache;
use consig_flow_api::config::Config;
use consig_flow_api::errors::FlowFailure;
use consig_flow_api::flow::FlowEngine;
use consig_flow_api::models::{CustomerInput, FlowRequest, TermStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CPF: &str = "12345678901";

fn test_config(provider_url: &str, crm_url: &str, cache_file: PathBuf) -> Config {
    Config {
        port: 0,
        provider_auth_url: format!("{}/oauth/token", provider_url),
        provider_api_url: provider_url.to_string(),
        provider_username: "user@test.com".to_string(),
        provider_password: "secret".to_string(),
        provider_client_id: "client-id".to_string(),
        provider_audience: "https://provider.test".to_string(),
        crm_api_url: crm_url.to_string(),
        crm_api_key: "crm-key".to_string(),
        crm_queue_id: 25,
        crm_lookup_pipelines: vec![1, 3, 4],
        crm_approved_pipeline: 4,
        crm_approved_stage: 21,
        cache_file,
        poll_interval: Duration::from_millis(50),
        poll_timeout: Duration::from_millis(500),
        status_call_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(30),
        authorize_settle_delay: Duration::from_millis(10),
        crm_verify_delay: Duration::from_millis(10),
        batch_fan_out: 2,
    }
}

fn engine_with(
    provider: &MockServer,
    crm: &MockServer,
    dir: &tempfile::TempDir,
) -> (Arc<FlowEngine>, Arc<OfferCache>) {
    let config = test_config(&provider.uri(), &crm.uri(), dir.path().join("offers.json"));
    let cache = Arc::new(OfferCache::new(config.cache_file.clone()));
    (Arc::new(FlowEngine::new(config, cache.clone())), cache)
}

fn complete_customer() -> CustomerInput {
    CustomerInput {
        name: Some("Maria Souza".to_string()),
        phone: Some("11987654321".to_string()),
        email: Some("maria@test.com".to_string()),
        birth_date: Some("1990-02-01".to_string()),
        ..Default::default()
    }
}

fn term_json(id: &str, status: &str, margin: Option<f64>, description: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "status": status,
        "description": description,
        "availableMarginValue": margin,
        "documentNumber": CPF,
        "partnerId": "partner-1",
        "name": "Maria Souza"
    })
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-1",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn mount_simulation_success(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/simulation/configs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "configs": [{"id": "cfg-1"}]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/simulation"))
        .and(body_partial_json(serde_json::json!({
            "numberOfInstallments": 24
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "installmentCount": 24,
            "installmentValue": 250.0,
            "disbursementAmount": 4800.0,
            "operationAmount": 5000.0,
            "configId": "cfg-1",
            "consultId": "term-1"
        })))
        .mount(server)
        .await;
}

/// Pre-supplied complete customer data, term approved on the second poll,
/// 24-month simulation accepted, entry cached.
#[tokio::test]
async fn end_to_end_with_presupplied_customer() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    // Existing-term search finds nothing.
    Mock::given(method("GET"))
        .and(path("/consult"))
        .and(query_param("search", CPF))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult"))
        .and(body_partial_json(serde_json::json!({
            "documentNumber": CPF,
            "signerName": "Maria Souza",
            "birthDate": "1990-02-01"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "term-1"})),
        )
        .expect(1)
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult/term-1/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&provider)
        .await;

    // First poll still pending, second approved with margin.
    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-1", "WAITING_CONSULT", None, None)]
        })))
        .up_to_n_times(1)
        .mount(&provider)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-1", "SUCCESS", Some(5000.0), None)]
        })))
        .mount(&provider)
        .await;

    mount_simulation_success(&provider).await;

    let (engine, cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            customer: Some(complete_customer()),
            ..Default::default()
        })
        .await;

    assert!(report.success, "expected success, got {:?}", report.failure_reason);
    assert_eq!(report.status, Some(TermStatus::Success));
    let simulation = report.simulation.expect("simulation expected");
    assert_eq!(simulation.installment_count, 24);
    assert_eq!(simulation.disbursement_amount, Some(4800.0));

    // The CRM is never consulted when complete customer data is supplied.
    assert!(crm.received_requests().await.unwrap().is_empty());

    let entry = cache.read(CPF).await.expect("cache entry expected");
    assert_eq!(entry.consent_term_id, "term-1");
    assert_eq!(
        entry.simulation.as_ref().and_then(|s| s.disbursement_amount),
        Some(4800.0)
    );
    assert_eq!(entry.customer.name, "Maria Souza");
}

/// An existing terminal-rejected term short-circuits the flow: no term is
/// ever created and the provider description is surfaced verbatim.
#[tokio::test]
async fn existing_rejected_term_short_circuits() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    let description = "Cliente nao possui margem disponivel";
    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-0", "REJECTED", None, Some(description))]
        })))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
        .expect(0)
        .mount(&provider)
        .await;

    let (engine, cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            customer: Some(complete_customer()),
            ..Default::default()
        })
        .await;

    assert!(!report.success);
    assert_eq!(
        report.failure,
        Some(FlowFailure::TermRejected(description.to_string()))
    );
    assert_eq!(report.failure_reason.as_deref(), Some(description));
    // Short-circuited before anything worth caching happened.
    assert!(cache.read(CPF).await.is_none());
}

/// A poll loop that exhausts its budget yields an outcome distinguishable by
/// tag from a rejection.
#[tokio::test]
async fn poll_timeout_is_distinct_from_rejection() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .and(query_param("search", CPF))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "term-1"})),
        )
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult/term-1/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&provider)
        .await;

    // The term never leaves WAITING_CONSULT.
    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-1", "WAITING_CONSULT", None, None)]
        })))
        .mount(&provider)
        .await;

    let (engine, _cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            customer: Some(complete_customer()),
            ..Default::default()
        })
        .await;

    assert!(!report.success);
    assert!(matches!(report.failure, Some(FlowFailure::PollTimeout)));
    assert!(!matches!(report.failure, Some(FlowFailure::TermRejected(_))));
    assert_eq!(report.status, Some(TermStatus::WaitingConsult));
}

/// An approved term whose every installment count yields an invalid
/// simulation reports the dedicated simulation failure, and the customer
/// data is still cached.
#[tokio::test]
async fn approved_term_without_simulation_is_a_distinct_failure() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    // Existing approved term is reused; no creation, no polling.
    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-7", "SUCCESS", Some(5000.0), None)]
        })))
        .mount(&provider)
        .await;

    Mock::given(method("GET"))
        .and(path("/simulation/configs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "configs": [{"id": "cfg-1"}]
        })))
        .mount(&provider)
        .await;

    // Every count returns an HTTP-success simulation with no value in it.
    Mock::given(method("POST"))
        .and(path("/simulation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "installmentCount": 0,
            "disbursementAmount": 0.0,
            "operationAmount": 0.0
        })))
        .expect(3)
        .mount(&provider)
        .await;

    let (engine, cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            customer: Some(complete_customer()),
            ..Default::default()
        })
        .await;

    assert!(!report.success);
    assert_eq!(report.failure, Some(FlowFailure::SimulationUnavailable));
    assert_eq!(
        report.failure_reason.as_deref(),
        Some("Could not create a simulation at any installment count")
    );

    // Customer data preserved even without a simulation.
    let entry = cache.read(CPF).await.expect("cache entry expected");
    assert_eq!(entry.consent_term_id, "term-7");
    assert!(entry.simulation.is_none());
}

/// Without pre-supplied data the CRM is the customer source; its absence is
/// a distinct not-found failure and the provider is never contacted.
#[tokio::test]
async fn missing_crm_opportunity_fails_before_the_provider() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/findOpportunities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(3)
        .mount(&crm)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(0)
        .mount(&provider)
        .await;

    let (engine, _cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            ..Default::default()
        })
        .await;

    assert!(!report.success);
    assert_eq!(report.failure, Some(FlowFailure::NotFoundInCrm));
}

/// CRM-sourced customer data flows into term creation: the stored birth
/// date is normalized and the form email is used.
#[tokio::test]
async fn crm_sourced_customer_reaches_the_provider_normalized() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    Mock::given(method("POST"))
        .and(path("/findOpportunities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
            "id": 7,
            "fkStage": 4,
            "fkPipeline": 1,
            "title": "Maria Souza",
            "mainphone": "11987654321",
            "mainmail": CPF,
            "formsdata": {
                "0bfc6250": "01/02/1990",
                "9e7f92b0": "maria@test.com"
            }
        }])))
        .mount(&crm)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .and(query_param("search", CPF))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult"))
        .and(body_partial_json(serde_json::json!({
            "birthDate": "1990-02-01",
            "signerEmail": "maria@test.com",
            "signerPhone": {
                "countryCode": "55",
                "areaCode": "11",
                "phoneNumber": "987654321"
            }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "term-1"})),
        )
        .expect(1)
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult/term-1/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&provider)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-1", "SUCCESS", Some(5000.0), None)]
        })))
        .mount(&provider)
        .await;

    mount_simulation_success(&provider).await;

    let (engine, cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            ..Default::default()
        })
        .await;

    assert!(report.success, "expected success, got {:?}", report.failure_reason);
    assert_eq!(report.opportunity_id, Some(7));

    let entry = cache.read(CPF).await.expect("cache entry expected");
    assert_eq!(entry.customer.name, "Maria Souza");
    assert_eq!(entry.customer.email.as_deref(), Some("maria@test.com"));
}

/// An existing pending-consent term that cannot be authorized yields the
/// awaiting-consent failure instead of creating a duplicate term.
#[tokio::test]
async fn unauthorizable_pending_term_reports_awaiting_consent() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-3", "WAITING_CONSENT", None, None)]
        })))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult/term-3/authorize"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "title": "consent pending"
        })))
        .mount(&provider)
        .await;

    // No duplicate term creation.
    Mock::given(method("POST"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
        .expect(0)
        .mount(&provider)
        .await;

    let (engine, _cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            customer: Some(complete_customer()),
            ..Default::default()
        })
        .await;

    assert!(!report.success);
    assert_eq!(report.failure, Some(FlowFailure::AwaitingConsent));
}

/// A rejection specifically over a birth-date mismatch triggers one CRM
/// correction and a fresh term instead of a short-circuit.
#[tokio::test]
async fn birth_date_mismatch_corrects_crm_and_recreates_the_term() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_token(&provider).await;

    // CRM stores the birth date in a shape the provider rejected.
    Mock::given(method("POST"))
        .and(path("/findOpportunities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
            "id": 7,
            "title": "Maria Souza",
            "mainphone": "11987654321",
            "mainmail": CPF,
            "formsdata": { "0bfc6250": "01021990" }
        }])))
        .mount(&crm)
        .await;

    Mock::given(method("POST"))
        .and(path("/updateOpportunity"))
        .and(body_partial_json(serde_json::json!({
            "id": 7,
            "formsdata": { "0bfc6250": "01/02/1990" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true
        })))
        .expect(1)
        .mount(&crm)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .and(query_param("search", CPF))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json(
                "term-old",
                "REJECTED",
                None,
                Some("Data de nascimento nao confere")
            )]
        })))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "term-new"})),
        )
        .expect(1)
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/consult/term-new/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&provider)
        .await;

    Mock::given(method("GET"))
        .and(path("/consult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [term_json("term-new", "SUCCESS", Some(5000.0), None)]
        })))
        .mount(&provider)
        .await;

    mount_simulation_success(&provider).await;

    let (engine, _cache) = engine_with(&provider, &crm, &dir);
    let report = engine
        .execute(FlowRequest {
            cpf: CPF.to_string(),
            ..Default::default()
        })
        .await;

    assert!(report.success, "expected success, got {:?}", report.failure_reason);
    assert_eq!(
        report.term.as_ref().map(|t| t.id.as_str()),
        Some("term-new")
    );
}

/// CRM write-back creates the opportunity when absent, advances the stage
/// and verifies it took effect.
#[tokio::test]
async fn crm_sync_creates_opportunity_and_confirms_stage() {
    let provider = MockServer::start().await;
    let crm = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // Initial lookup misses across all three pipelines; the verification
    // read afterwards finds the created opportunity at the target stage.
    Mock::given(method("POST"))
        .and(path("/findOpportunities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .up_to_n_times(3)
        .mount(&crm)
        .await;

    Mock::given(method("POST"))
        .and(path("/findOpportunities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
            "id": 99,
            "fkStage": 21,
            "fkPipeline": 4,
            "mainmail": CPF
        }])))
        .mount(&crm)
        .await;

    Mock::given(method("POST"))
        .and(path("/createOpportunity"))
        .and(body_partial_json(serde_json::json!({
            "fkPipeline": 4,
            "fkStage": 21,
            "mainmail": CPF,
            "tags": [6]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 99})))
        .expect(1)
        .mount(&crm)
        .await;

    Mock::given(method("POST"))
        .and(path("/changeStage"))
        .and(body_partial_json(serde_json::json!({
            "id": 99,
            "destStageId": 21
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true
        })))
        .expect(1)
        .mount(&crm)
        .await;

    let (engine, cache) = engine_with(&provider, &crm, &dir);

    let entry = cache
        .upsert(
            CPF,
            "term-1",
            Some(consig_flow_api::models::Simulation {
                installment_count: 24,
                installment_value: Some(250.0),
                disbursement_amount: Some(4800.0),
                operation_amount: Some(5000.0),
                config_id: Some("cfg-1".to_string()),
                consult_id: Some("term-1".to_string()),
            }),
            CustomerRecordFixture::build(),
        )
        .await
        .unwrap();

    let sync = engine.sync_to_crm(&entry).await;

    assert!(sync.ok);
    assert_eq!(sync.opportunity_id, Some(99));
    assert_eq!(sync.action, "created");
    assert!(sync.stage_confirmed);
}

struct CustomerRecordFixture;

impl CustomerRecordFixture {
    fn build() -> consig_flow_api::models::CustomerRecord {
        consig_flow_api::models::CustomerRecord {
            cpf: CPF.to_string(),
            name: "Maria Souza".to_string(),
            phone: "11987654321".to_string(),
            email: Some("maria@test.com".to_string()),
            birth_date: Some("1990-02-01".to_string()),
            ..Default::default()
        }
    }
}
