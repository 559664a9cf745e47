use crate::errors::AppError;
use crate::models::{ConsentTerm, Simulation};
use crate::provider::{ProviderClient, RateConfig, SimulationError, SimulationRequest};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Installment counts tried by default, longest term first.
pub const DEFAULT_INSTALLMENT_COUNTS: [u32; 3] = [24, 12, 6];

/// Attempts loan simulations across a priority-ordered list of installment
/// counts against an approved term.
pub struct SimulationAttempter {
    provider: Arc<ProviderClient>,
    /// Rate configurations change rarely; one short-TTL cache entry avoids
    /// refetching them for every attempt sequence.
    configs: Cache<&'static str, Vec<RateConfig>>,
}

impl SimulationAttempter {
    pub fn new(provider: Arc<ProviderClient>) -> Self {
        Self {
            provider,
            configs: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(1)
                .build(),
        }
    }

    async fn rate_configs(&self) -> Result<Vec<RateConfig>, AppError> {
        let provider = self.provider.clone();
        self.configs
            .try_get_with("configs", async move { provider.simulation_configs().await })
            .await
            .map_err(|e: Arc<AppError>| (*e).clone())
    }

    /// Runs the attempt sequence and returns the best simulation found, or
    /// `None` when every count failed or produced an invalid simulation.
    ///
    /// The longest count wins outright: a valid simulation there is accepted
    /// immediately. A valid simulation at a shorter count is held as a
    /// fallback and never overwritten by an even shorter one. Per-attempt
    /// failures are non-fatal to the sequence; margin-exceeded and
    /// already-exists are the expected fall-through cases.
    pub async fn attempt(
        &self,
        term: &ConsentTerm,
        requested_amount: Option<f64>,
        requested_count: Option<u32>,
    ) -> Option<Simulation> {
        let cpf = term.document_number.as_deref().unwrap_or("N/A");
        let margin = term.margin();

        if !term.status.is_approved() || margin <= 0.0 {
            tracing::info!("[{}] Term {} not eligible for simulation", cpf, term.id);
            return None;
        }

        let configs = match self.rate_configs().await {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => {
                tracing::warn!("[{}] No rate configurations available", cpf);
                return None;
            }
            Err(e) => {
                tracing::warn!("[{}] Rate configuration lookup failed: {}", cpf, e);
                return None;
            }
        };
        let config_id = configs[0].id.clone();

        let counts: Vec<u32> = match requested_count {
            Some(count) => vec![count],
            None => DEFAULT_INSTALLMENT_COUNTS.to_vec(),
        };
        let longest = counts[0];
        let amount = requested_amount.unwrap_or(margin);

        let mut fallback: Option<Simulation> = None;

        for count in counts {
            tracing::info!("[{}] Trying simulation at {} installments", cpf, count);

            let request = SimulationRequest {
                consult_id: term.id.clone(),
                config_id: config_id.clone(),
                number_of_installments: count,
                installment_face_value: amount,
            };

            match self.provider.create_simulation(&request).await {
                Ok(mut simulation) if simulation.is_valid() => {
                    if simulation.installment_count == 0 {
                        simulation.installment_count = count;
                    }
                    if count == longest {
                        tracing::info!(
                            "[{}] Simulation accepted at the longest count ({})",
                            cpf,
                            count
                        );
                        return Some(simulation);
                    }
                    if fallback.is_none() {
                        tracing::info!("[{}] Holding {}-installment simulation as fallback", cpf, count);
                        fallback = Some(simulation);
                    } else {
                        tracing::debug!(
                            "[{}] Fallback already held - not overwriting with {} installments",
                            cpf,
                            count
                        );
                    }
                }
                Ok(_) => {
                    tracing::warn!(
                        "[{}] Simulation at {} installments has no disbursement or operation amount - skipping",
                        cpf,
                        count
                    );
                }
                Err(SimulationError::AboveMargin) => {
                    tracing::info!(
                        "[{}] Margin exceeds installment value at {} installments - trying next",
                        cpf,
                        count
                    );
                }
                Err(SimulationError::AlreadyExists) => {
                    tracing::info!(
                        "[{}] Simulation already exists at {} installments - trying next",
                        cpf,
                        count
                    );
                }
                Err(SimulationError::Other(detail)) => {
                    tracing::warn!(
                        "[{}] Simulation at {} installments failed: {} - trying next",
                        cpf,
                        count,
                        detail
                    );
                }
            }
        }

        if fallback.is_none() {
            tracing::warn!("[{}] No installment count produced a valid simulation", cpf);
        }
        fallback
    }
}
