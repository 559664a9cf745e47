use crate::cache::OfferCache;
use crate::config::Config;
use crate::crm::{self, CrmClient, APPROVED_TAG};
use crate::errors::FlowFailure;
use crate::models::{
    CacheEntry, ConsentTerm, CrmOpportunity, CustomerRecord, FlowReport, FlowRequest, TermStatus,
};
use crate::provider::ProviderClient;
use crate::simulation::SimulationAttempter;
use crate::term::{self, TermManager, TermOutcome};
use crate::token::TokenCache;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Result of the best-effort CRM write-back. Never escalates into the
/// primary flow verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub ok: bool,
    pub opportunity_id: Option<i64>,
    pub action: &'static str,
    pub stage_confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Composes the token cache, CRM gateway, term lifecycle, simulation
/// attempter and offer cache into the end-to-end per-CPF decision procedure.
pub struct FlowEngine {
    config: Config,
    crm: CrmClient,
    terms: TermManager,
    simulations: SimulationAttempter,
    cache: Arc<OfferCache>,
}

/// Customer data plus where it came from; the corrective birth-date path
/// only applies to CRM-sourced customers.
struct AssembledCustomer {
    customer: CustomerRecord,
    opportunity: Option<CrmOpportunity>,
    from_crm: bool,
}

impl FlowEngine {
    pub fn new(config: Config, cache: Arc<OfferCache>) -> Self {
        let tokens = Arc::new(TokenCache::new(&config));
        let provider = Arc::new(ProviderClient::new(&config, tokens));

        Self {
            crm: CrmClient::new(&config),
            terms: TermManager::new(
                provider.clone(),
                config.poll_interval,
                config.poll_timeout,
                config.status_call_timeout,
            ),
            simulations: SimulationAttempter::new(provider),
            cache,
            config,
        }
    }

    pub fn crm(&self) -> &CrmClient {
        &self.crm
    }

    /// Runs the full decision procedure for one CPF and returns one
    /// normalized report, success or failure.
    pub async fn execute(&self, request: FlowRequest) -> FlowReport {
        let cpf = term::normalize_digits(&request.cpf);
        tracing::info!(
            "[{}] Starting flow (amount: {:?}, installments: {:?}, force new term: {})",
            cpf,
            request.amount,
            request.installments,
            request.force_new_term
        );

        // 1. Assemble customer data - caller-supplied wins outright when
        // complete; otherwise the CRM is the source.
        let assembled = match self.assemble_customer(&cpf, &request).await {
            Ok(assembled) => assembled,
            Err(failure) => return FlowReport::failure(failure, None, None),
        };
        let opportunity_id = assembled.opportunity.as_ref().map(|o| o.id);

        // 2. Existing usable term, unless a fresh one was forced.
        let mut force_new = request.force_new_term;
        let mut existing = if force_new {
            tracing::info!("[{}] Force-new-term set - skipping existing-term lookup", cpf);
            None
        } else {
            self.terms.find_existing_term(&cpf).await
        };

        // Rejection over a birth-date mismatch gets one corrective CRM
        // update and a fresh term; every other terminal rejection is final.
        if let Some(found) = &existing {
            if found.status == TermStatus::Rejected
                && found
                    .description
                    .as_deref()
                    .is_some_and(|d| d.contains(term::BIRTH_DATE_MISMATCH))
                && assembled.from_crm
            {
                tracing::warn!(
                    "[{}] Existing term rejected over birth-date mismatch - correcting CRM and recreating",
                    cpf
                );
                self.correct_birth_date(&assembled).await;
                force_new = true;
                existing = None;
            } else if found.status.is_terminal_negative() {
                let description = found.description.clone().unwrap_or_else(|| {
                    match found.status {
                        TermStatus::Failed => "Term failed".to_string(),
                        _ => "Term rejected by analysis".to_string(),
                    }
                });
                tracing::warn!("[{}] Existing term {} is terminal: {}", cpf, found.id, description);
                let failure = match found.status {
                    TermStatus::Failed => FlowFailure::TermFailed(description),
                    _ => FlowFailure::TermRejected(description),
                };
                return FlowReport::failure(failure, existing, opportunity_id);
            }
        }

        // 3. Reuse, authorize or create.
        let active_term = match existing {
            Some(found) if !force_new => {
                if found.status == TermStatus::WaitingConsent {
                    match self.authorize_pending(&cpf, found).await {
                        Ok(refreshed) => refreshed,
                        Err(report_term) => {
                            return FlowReport::failure(
                                FlowFailure::AwaitingConsent,
                                Some(report_term),
                                opportunity_id,
                            )
                        }
                    }
                } else {
                    tracing::info!("[{}] Reusing existing term {}", cpf, found.id);
                    found
                }
            }
            _ => match self.terms.create_and_authorize(&assembled.customer).await {
                Ok(created) => created,
                Err(failure) => return FlowReport::failure(failure, None, opportunity_id),
            },
        };

        // 4. Poll to a terminal status when still pending.
        let outcome = if active_term.status.is_pending() {
            let poll = self.terms.poll_until_terminal(&cpf, &active_term.id).await;
            let latest = poll.latest.unwrap_or(active_term);
            TermOutcome::classify(latest, poll.timed_out)
        } else {
            TermOutcome::classify(active_term, false)
        };

        let latest = outcome.term().clone();

        if let TermOutcome::TimedOut(_) = &outcome {
            return FlowReport::failure(FlowFailure::PollTimeout, Some(latest), opportunity_id);
        }

        // 5. Simulate on approved-class terms with margin.
        let simulation = if matches!(outcome, TermOutcome::Approved(_)) {
            self.simulations
                .attempt(&latest, request.amount, request.installments)
                .await
        } else {
            None
        };

        // 6. Persist unconditionally - the verdict is never blocked on
        // caching.
        if let Err(e) = self
            .cache
            .upsert(&cpf, &latest.id, simulation.clone(), assembled.customer.clone())
            .await
        {
            tracing::error!("[{}] Cache persist failed (continuing): {}", cpf, e);
        }

        // 7. Final verdict.
        match outcome {
            TermOutcome::Approved(term) => match simulation {
                Some(simulation) => {
                    tracing::info!(
                        "[{}] Flow succeeded: term {} with {}-installment simulation",
                        cpf,
                        term.id,
                        simulation.installment_count
                    );
                    FlowReport::success(term, simulation, opportunity_id)
                }
                None => FlowReport::failure(
                    FlowFailure::SimulationUnavailable,
                    Some(term),
                    opportunity_id,
                ),
            },
            TermOutcome::Rejected(term) => {
                let description = term
                    .description
                    .clone()
                    .unwrap_or_else(|| "Term rejected by analysis".to_string());
                FlowReport::failure(
                    FlowFailure::TermRejected(description),
                    Some(term),
                    opportunity_id,
                )
            }
            TermOutcome::Failed(term) => {
                let description = term
                    .description
                    .clone()
                    .unwrap_or_else(|| "Term failed".to_string());
                FlowReport::failure(
                    FlowFailure::TermFailed(description),
                    Some(term),
                    opportunity_id,
                )
            }
            TermOutcome::AwaitingConsent(term) => FlowReport::failure(
                FlowFailure::AwaitingConsent,
                Some(term),
                opportunity_id,
            ),
            TermOutcome::TimedOut(term) => {
                FlowReport::failure(FlowFailure::PollTimeout, Some(term), opportunity_id)
            }
        }
    }

    async fn assemble_customer(
        &self,
        cpf: &str,
        request: &FlowRequest,
    ) -> Result<AssembledCustomer, FlowFailure> {
        if let Some(input) = request.customer.as_ref().filter(|c| c.is_complete()) {
            tracing::info!("[{}] Complete customer data supplied - skipping CRM lookup", cpf);
            let customer = CustomerRecord {
                cpf: cpf.to_string(),
                name: input.name.clone().unwrap_or_default(),
                phone: input.phone.clone().unwrap_or_default(),
                email: Some(term::fallback_email(input.email.as_deref(), cpf)),
                birth_date: input.birth_date.clone(),
                mother_name: input.mother_name.clone(),
                rg: input.rg.clone(),
                address: input.address.clone(),
                pix: input.pix.clone(),
            };
            return Ok(AssembledCustomer {
                customer,
                opportunity: None,
                from_crm: false,
            });
        }

        let opportunity = self
            .crm
            .find_opportunity_by_cpf(cpf)
            .await
            .map_err(|e| FlowFailure::Upstream(e.to_string()))?
            .ok_or(FlowFailure::NotFoundInCrm)?;

        let mut missing = Vec::new();
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        if blank(&opportunity.mainmail) {
            missing.push("cpf".to_string());
        }
        if blank(&opportunity.mainphone) {
            missing.push("phone".to_string());
        }
        if !missing.is_empty() {
            return Err(FlowFailure::MissingRequiredFields(missing));
        }

        let customer = crm::customer_from_opportunity(&opportunity);
        Ok(AssembledCustomer {
            customer,
            opportunity: Some(opportunity),
            from_crm: true,
        })
    }

    /// One corrective pass over the CRM birth-date field after a mismatch
    /// rejection. Failures are logged; the flow recreates the term either
    /// way.
    async fn correct_birth_date(&self, assembled: &AssembledCustomer) {
        let Some(opportunity) = &assembled.opportunity else {
            return;
        };
        let Some(raw) = assembled.customer.birth_date.as_deref() else {
            return;
        };

        let iso = term::normalize_birth_date(raw);
        let Some((year, rest)) = iso.split_once('-') else {
            return;
        };
        let Some((month, day)) = rest.split_once('-') else {
            return;
        };
        // The CRM stores birth dates the way operators type them.
        let crm_format = format!("{}/{}/{}", day, month, year);

        if crm_format == raw {
            return;
        }

        tracing::info!(
            "[{}] Correcting CRM birth date: {} -> {}",
            assembled.customer.cpf,
            raw,
            crm_format
        );

        let mut forms = Map::new();
        forms.insert(crm::fields::BIRTH_DATE.to_string(), Value::String(crm_format));
        match self.crm.update_forms_data(opportunity.id, forms).await {
            Ok(ack) if ack.ok => {
                tokio::time::sleep(self.config.crm_verify_delay).await;
            }
            Ok(_) => tracing::warn!(
                "[{}] CRM did not acknowledge the birth-date correction",
                assembled.customer.cpf
            ),
            Err(e) => tracing::warn!(
                "[{}] Birth-date correction failed: {}",
                assembled.customer.cpf,
                e
            ),
        }
    }

    /// Authorizes an existing pending-consent term and re-reads it after a
    /// short settle delay.
    async fn authorize_pending(
        &self,
        cpf: &str,
        found: ConsentTerm,
    ) -> Result<ConsentTerm, ConsentTerm> {
        tracing::info!("[{}] Authorizing existing term {}", cpf, found.id);
        if let Err(e) = self.terms.authorize_existing(&found.id).await {
            tracing::error!("[{}] Could not authorize existing term: {}", cpf, e);
            return Err(found);
        }

        tokio::time::sleep(self.config.authorize_settle_delay).await;

        match self.terms.term_status(&found.id).await {
            Ok(Some(refreshed)) => {
                tracing::info!(
                    "[{}] Term {} after authorization: {}",
                    cpf,
                    refreshed.id,
                    refreshed.status
                );
                Ok(refreshed)
            }
            _ => Ok(found),
        }
    }

    /// Step 8: best-effort CRM write-back. Finds or creates the opportunity,
    /// writes the released amount and customer fields, advances it to the
    /// post-approval stage, and verifies the stage change took effect after
    /// a short delay, retrying the stage call once. Never changes the
    /// primary flow verdict.
    pub async fn sync_to_crm(&self, entry: &CacheEntry) -> SyncReport {
        let cpf = entry.cpf.as_str();
        let released = entry
            .simulation
            .as_ref()
            .map(|s| s.released_amount())
            .unwrap_or(0.0);

        let description = format!("Payroll loan - released amount: R$ {:.2}", released);
        let forms = crm::forms_data_from_customer(&entry.customer);

        let existing = match self.crm.find_opportunity_by_cpf(cpf).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!("[{}] CRM sync lookup failed: {}", cpf, e);
                return SyncReport {
                    ok: false,
                    opportunity_id: None,
                    action: "none",
                    stage_confirmed: false,
                    error: Some(e.to_string()),
                };
            }
        };

        let (opportunity_id, action) = match existing {
            Some(opportunity) => {
                let mut tags = opportunity.tag_ids();
                if !tags.contains(&APPROVED_TAG) {
                    tags.push(APPROVED_TAG);
                }

                let mut extra = Map::new();
                extra.insert(
                    "title".to_string(),
                    json!(if entry.customer.name.is_empty() {
                        format!("Customer {}", cpf)
                    } else {
                        entry.customer.name.clone()
                    }),
                );
                extra.insert("mainphone".to_string(), json!(entry.customer.phone));
                extra.insert("mainmail".to_string(), json!(cpf));
                extra.insert("value".to_string(), json!(released));
                extra.insert("description".to_string(), json!(description));
                extra.insert("formsdata".to_string(), Value::Object(forms));
                extra.insert("tags".to_string(), json!(tags));

                match self.crm.update_opportunity(opportunity.id, extra).await {
                    Ok(ack) if ack.ok => {}
                    Ok(_) => tracing::warn!(
                        "[{}] CRM update not acknowledged - continuing with existing id",
                        cpf
                    ),
                    Err(e) => tracing::warn!(
                        "[{}] CRM update failed - continuing with existing id: {}",
                        cpf,
                        e
                    ),
                }
                (opportunity.id, "updated")
            }
            None => {
                let mut extra = Map::new();
                extra.insert("fkPipeline".to_string(), json!(self.config.crm_approved_pipeline));
                extra.insert("fkStage".to_string(), json!(self.config.crm_approved_stage));
                extra.insert("responsableid".to_string(), json!(0));
                extra.insert(
                    "title".to_string(),
                    json!(if entry.customer.name.is_empty() {
                        format!("Customer {}", cpf)
                    } else {
                        entry.customer.name.clone()
                    }),
                );
                extra.insert("mainphone".to_string(), json!(entry.customer.phone));
                extra.insert("mainmail".to_string(), json!(cpf));
                extra.insert("value".to_string(), json!(released));
                extra.insert("description".to_string(), json!(description));
                extra.insert("formsdata".to_string(), Value::Object(forms));
                extra.insert("tags".to_string(), json!([APPROVED_TAG]));

                match self.crm.create_opportunity(extra).await {
                    Ok(ack) => match ack.id {
                        Some(id) => (id, "created"),
                        None => {
                            tracing::error!("[{}] CRM create returned no opportunity id", cpf);
                            return SyncReport {
                                ok: false,
                                opportunity_id: None,
                                action: "none",
                                stage_confirmed: false,
                                error: Some("CRM create returned no opportunity id".to_string()),
                            };
                        }
                    },
                    Err(e) => {
                        tracing::error!("[{}] CRM create failed: {}", cpf, e);
                        return SyncReport {
                            ok: false,
                            opportunity_id: None,
                            action: "none",
                            stage_confirmed: false,
                            error: Some(e.to_string()),
                        };
                    }
                }
            }
        };

        // Stage advance, with one retry on a refused or failed call.
        let stage = self.config.crm_approved_stage;
        let moved = match self.crm.change_stage(opportunity_id, stage).await {
            Ok(ack) if ack.ok => true,
            other => {
                if let Err(e) = other {
                    tracing::warn!("[{}] Stage change failed: {} - retrying once", cpf, e);
                } else {
                    tracing::warn!("[{}] Stage change not acknowledged - retrying once", cpf);
                }
                tokio::time::sleep(self.config.crm_verify_delay).await;
                matches!(
                    self.crm.change_stage(opportunity_id, stage).await,
                    Ok(ack) if ack.ok
                )
            }
        };
        if !moved {
            tracing::error!("[{}] Stage change refused twice", cpf);
        }

        // Verify the stage actually changed by re-reading after a settle
        // delay.
        tokio::time::sleep(self.config.crm_verify_delay).await;
        let stage_confirmed = match self.crm.find_opportunity_by_cpf(cpf).await {
            Ok(Some(read_back)) => read_back.stage == Some(stage),
            _ => false,
        };
        if stage_confirmed {
            tracing::info!("[{}] Opportunity {} confirmed at stage {}", cpf, opportunity_id, stage);
        } else {
            tracing::warn!(
                "[{}] Opportunity {} not confirmed at stage {}",
                cpf,
                opportunity_id,
                stage
            );
        }

        SyncReport {
            ok: true,
            opportunity_id: Some(opportunity_id),
            action,
            stage_confirmed,
            error: None,
        }
    }
}
