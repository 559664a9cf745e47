use crate::errors::{AppError, FlowFailure};
use crate::models::{ConsentTerm, CustomerRecord, TermStatus};
use crate::provider::{CreateTermRequest, ProviderClient, TermPhone};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Verbatim description the provider attaches to terms rejected over a
/// birth-date mismatch. Matching on it drives the one corrective retry.
pub const BIRTH_DATE_MISMATCH: &str = "Data de nascimento nao confere";

/// Terminal classification of a consent term once the lifecycle has run.
/// `TimedOut` is the distinguished abandoned outcome: not terminal on the
/// provider side, but terminal for this flow execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TermOutcome {
    Approved(ConsentTerm),
    Rejected(ConsentTerm),
    Failed(ConsentTerm),
    AwaitingConsent(ConsentTerm),
    TimedOut(ConsentTerm),
}

impl TermOutcome {
    pub fn classify(term: ConsentTerm, timed_out: bool) -> Self {
        if timed_out && term.status.is_pending() {
            return TermOutcome::TimedOut(term);
        }
        match term.status {
            TermStatus::Rejected => TermOutcome::Rejected(term),
            TermStatus::Failed => TermOutcome::Failed(term),
            TermStatus::WaitingConsent => TermOutcome::AwaitingConsent(term),
            _ if term.status.is_approved() => TermOutcome::Approved(term),
            _ => TermOutcome::TimedOut(term),
        }
    }

    pub fn term(&self) -> &ConsentTerm {
        match self {
            TermOutcome::Approved(t)
            | TermOutcome::Rejected(t)
            | TermOutcome::Failed(t)
            | TermOutcome::AwaitingConsent(t)
            | TermOutcome::TimedOut(t) => t,
        }
    }
}

/// Result of one poll loop: the last observed snapshot plus whether the
/// budget ran out. Each poll tick produces a fresh immutable snapshot; only
/// the final one is returned.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub latest: Option<ConsentTerm>,
    pub timed_out: bool,
}

/// Keeps only letters and single spaces; the provider rejects punctuation in
/// signer names.
pub fn sanitize_name(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Digits only.
pub fn normalize_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalizes a birth date into `YYYY-MM-DD`, accepting the formats CRM
/// operators actually type: `DD/MM/YYYY`, `DD.MM.YYYY`, `DD MM YYYY` and a
/// bare 8-digit `DDMMYYYY`. Unrecognized input falls back to `1990-01-01`.
pub fn normalize_birth_date(raw: &str) -> String {
    const DEFAULT: &str = "1990-01-01";

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT.to_string();
    }

    let iso = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
    if iso.is_match(trimmed) {
        return trimmed.to_string();
    }

    for separator in ['/', '.', ' '] {
        if trimmed.contains(separator) {
            let parts: Vec<&str> = trimmed
                .split(separator)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() == 3 && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())) {
                let (day, month, year) = (parts[0], parts[1], parts[2]);
                if year.len() == 4 && day.len() <= 2 && month.len() <= 2 {
                    return format!("{}-{:0>2}-{:0>2}", year, month, day);
                }
            }
            break;
        }
    }

    let digits = normalize_digits(trimmed);
    if digits.len() == 8 {
        let (day, month, year) = (&digits[0..2], &digits[2..4], &digits[4..8]);
        if chrono::NaiveDate::from_ymd_opt(
            year.parse().unwrap_or(0),
            month.parse().unwrap_or(0),
            day.parse().unwrap_or(0),
        )
        .is_some()
        {
            return format!("{}-{}-{}", year, month, day);
        }
    }

    tracing::warn!("Unrecognized birth date \"{}\" - using default", raw);
    DEFAULT.to_string()
}

/// Splits a Brazilian phone into the country/area/local parts the provider
/// expects. Returns `None` below 10 digits. An 8-digit local number is padded
/// with the leading mobile 9 the provider requires.
pub fn split_phone(raw: &str) -> Option<TermPhone> {
    let digits = normalize_digits(raw);
    if digits.len() < 10 {
        return None;
    }

    let (area_code, mut number) = if digits.starts_with("55") && digits.len() >= 12 {
        (digits[2..4].to_string(), digits[4..].to_string())
    } else {
        (digits[0..2].to_string(), digits[2..].to_string())
    };

    if number.len() == 8 {
        number = format!("9{}", number);
    }

    Some(TermPhone {
        country_code: "55".to_string(),
        area_code,
        phone_number: number,
    })
}

/// Validates and normalizes a Brazilian phone through libphonenumber,
/// returning E.164 on success. Used as a pre-pass so well-formed numbers
/// reach `split_phone` in a canonical shape.
pub fn validate_br_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 8 {
        return (false, "Phone too short".to_string());
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                (true, formatted)
            } else {
                (false, "Invalid Brazilian phone number".to_string())
            }
        }
        Err(e) => (false, format!("Parse error: {:?}", e)),
    }
}

/// Applies the `{cpf}@gmail.com` fallback whenever the supplied email is
/// absent or malformed.
pub fn fallback_email(email: Option<&str>, cpf: &str) -> String {
    let email_shape = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();

    match email.map(str::trim) {
        Some(e) if !e.is_empty() && e != "null" && email_shape.is_match(e) => e.to_string(),
        _ => {
            let generated = format!("{}@gmail.com", cpf);
            tracing::debug!("[{}] No usable email - using {}", cpf, generated);
            generated
        }
    }
}

/// Drives a consent term from creation through authorization to a terminal
/// status observation.
pub struct TermManager {
    provider: Arc<ProviderClient>,
    poll_interval: Duration,
    poll_timeout: Duration,
    status_call_timeout: Duration,
}

impl TermManager {
    pub fn new(
        provider: Arc<ProviderClient>,
        poll_interval: Duration,
        poll_timeout: Duration,
        status_call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            poll_interval,
            poll_timeout,
            status_call_timeout,
        }
    }

    /// Most recent term issued for this CPF in the trailing 30 days, if any.
    ///
    /// A `WAITING_CONSULT` hit is re-queried once before returning: the
    /// provider may have transitioned it since the listing was produced, and
    /// creating a redundant term while one is genuinely pending wastes the
    /// customer's consent. Lookup failures never block the flow; they are
    /// logged and treated as "no existing term".
    pub async fn find_existing_term(&self, cpf: &str) -> Option<ConsentTerm> {
        let clean_cpf = normalize_digits(cpf);

        let terms = match self
            .provider
            .list_terms(Some(&clean_cpf), Duration::from_secs(30))
            .await
        {
            Ok(terms) => terms,
            Err(e) => {
                tracing::warn!("[{}] Existing-term lookup failed: {} - creating new", cpf, e);
                return None;
            }
        };

        // The listing arrives most-recent-first; exact document match only.
        let recent = terms.into_iter().find(|t| {
            t.document_number
                .as_deref()
                .map(normalize_digits)
                .is_some_and(|d| d == clean_cpf)
        })?;

        tracing::info!(
            "[{}] Existing term {} found (status {})",
            cpf,
            recent.id,
            recent.status
        );

        if recent.status == TermStatus::WaitingConsult {
            match self.provider.term_status(&recent.id).await {
                Ok(Some(live)) => {
                    tracing::info!("[{}] Re-queried pending term: status {}", cpf, live.status);
                    return Some(live);
                }
                Ok(None) => return Some(recent),
                Err(e) => {
                    tracing::warn!("[{}] Status re-query failed: {}", cpf, e);
                    return Some(recent);
                }
            }
        }

        Some(recent)
    }

    /// Creates a consent term for the customer and immediately authorizes
    /// it. Authorization failures are logged but do not abort: an authorized
    /// term may still progress on the provider side.
    pub async fn create_and_authorize(
        &self,
        customer: &CustomerRecord,
    ) -> Result<ConsentTerm, FlowFailure> {
        let cpf = normalize_digits(&customer.cpf);

        let name = sanitize_name(&customer.name);
        if name.is_empty() {
            return Err(FlowFailure::MissingRequiredFields(vec!["name".to_string()]));
        }

        // Well-formed numbers go through libphonenumber first so the digit
        // split sees a canonical +55 shape.
        let (phone_ok, normalized) = validate_br_phone(&customer.phone);
        let phone_source = if phone_ok { normalized } else { customer.phone.clone() };
        let phone = split_phone(&phone_source)
            .ok_or_else(|| FlowFailure::MissingRequiredFields(vec!["phone".to_string()]))?;

        let request = CreateTermRequest {
            document_number: cpf.clone(),
            signer_name: name,
            signer_email: fallback_email(customer.email.as_deref(), &cpf),
            signer_phone: phone,
            birth_date: normalize_birth_date(customer.birth_date.as_deref().unwrap_or("")),
            gender: "male".to_string(),
        };

        tracing::info!("[{}] Requesting consent term", cpf);
        let term_id = self.provider.create_term(&request).await.map_err(|e| {
            match e {
                AppError::AuthenticationFailed(detail) => FlowFailure::Authentication(detail),
                other => FlowFailure::Upstream(other.to_string()),
            }
        })?;
        tracing::info!("[{}] Term {} created", cpf, term_id);

        match self.provider.authorize_term(&term_id).await {
            Ok(()) => tracing::info!("[{}] Term {} authorized", cpf, term_id),
            Err(e) => {
                tracing::warn!(
                    "[{}] Authorize failed for term {} - continuing, term may self-progress: {}",
                    cpf,
                    term_id,
                    e
                );
            }
        }

        Ok(ConsentTerm {
            id: term_id,
            status: TermStatus::WaitingConsult,
            description: None,
            available_margin_value: None,
            document_number: Some(cpf),
            partner_id: None,
            name: Some(customer.name.clone()),
        })
    }

    /// Authorizes an existing pending-consent term.
    pub async fn authorize_existing(&self, term_id: &str) -> Result<(), AppError> {
        self.provider.authorize_term(term_id).await
    }

    /// Live status of one term.
    pub async fn term_status(&self, term_id: &str) -> Result<Option<ConsentTerm>, AppError> {
        self.provider.term_status(term_id).await
    }

    /// Polls the term at a fixed interval until it leaves the pending
    /// statuses or the budget elapses. Poll failures are tolerated and the
    /// loop continues; a single status call exceeding its hard sub-timeout
    /// aborts the poll early.
    pub async fn poll_until_terminal(&self, cpf: &str, term_id: &str) -> PollOutcome {
        let deadline = Instant::now() + self.poll_timeout;
        let mut latest: Option<ConsentTerm> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match tokio::time::timeout(self.status_call_timeout, self.provider.term_status(term_id))
                .await
            {
                Err(_) => {
                    tracing::warn!(
                        "[{}] Status call exceeded {:?} on attempt {} - aborting poll",
                        cpf,
                        self.status_call_timeout,
                        attempt
                    );
                    return PollOutcome {
                        latest,
                        timed_out: true,
                    };
                }
                Ok(Ok(Some(snapshot))) => {
                    tracing::info!(
                        "[{}] Poll {}: term {} status {}",
                        cpf,
                        attempt,
                        term_id,
                        snapshot.status
                    );
                    let pending = snapshot.status.is_pending();
                    latest = Some(snapshot);
                    if !pending {
                        return PollOutcome {
                            latest,
                            timed_out: false,
                        };
                    }
                }
                Ok(Ok(None)) => {
                    tracing::warn!("[{}] Poll {}: term {} not listed yet", cpf, attempt, term_id);
                }
                Ok(Err(e)) => {
                    tracing::warn!("[{}] Poll {} failed: {}", cpf, attempt, e);
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                tracing::warn!(
                    "[{}] Poll budget {:?} exhausted after {} attempts",
                    cpf,
                    self.poll_timeout,
                    attempt
                );
                return PollOutcome {
                    latest,
                    timed_out: true,
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn birth_dates_normalize_to_iso() {
        assert_eq!(normalize_birth_date("1990-02-01"), "1990-02-01");
        assert_eq!(normalize_birth_date("01/02/1990"), "1990-02-01");
        assert_eq!(normalize_birth_date("1/2/1990"), "1990-02-01");
        assert_eq!(normalize_birth_date("01.02.1990"), "1990-02-01");
        assert_eq!(normalize_birth_date("01 02 1990"), "1990-02-01");
        assert_eq!(normalize_birth_date("01021990"), "1990-02-01");
        assert_eq!(normalize_birth_date(""), "1990-01-01");
        assert_eq!(normalize_birth_date("yesterday"), "1990-01-01");
        // 8 digits that do not form a real date fall back too
        assert_eq!(normalize_birth_date("99999999"), "1990-01-01");
    }

    #[test]
    fn phones_split_into_provider_parts() {
        let phone = split_phone("5511981565248").unwrap();
        assert_eq!(phone.area_code, "11");
        assert_eq!(phone.phone_number, "981565248");

        let phone = split_phone("11981565248").unwrap();
        assert_eq!(phone.area_code, "11");
        assert_eq!(phone.phone_number, "981565248");

        // 8-digit local numbers get the mobile 9 prefix
        let phone = split_phone("1181565248").unwrap();
        assert_eq!(phone.area_code, "11");
        assert_eq!(phone.phone_number, "981565248");

        assert!(split_phone("11987").is_none());
        assert!(split_phone("").is_none());
    }

    #[test]
    fn names_keep_letters_only() {
        assert_eq!(sanitize_name("Maria  da Silva!"), "Maria da Silva");
        assert_eq!(sanitize_name("José D'Ávila (2)"), "José D Ávila");
        assert_eq!(sanitize_name("123"), "");
    }

    #[test]
    fn email_fallback_covers_malformed_input() {
        assert_eq!(
            fallback_email(Some("maria@test.com"), "12345678901"),
            "maria@test.com"
        );
        assert_eq!(
            fallback_email(Some("not-an-email"), "12345678901"),
            "12345678901@gmail.com"
        );
        assert_eq!(
            fallback_email(Some("null"), "12345678901"),
            "12345678901@gmail.com"
        );
        assert_eq!(fallback_email(None, "12345678901"), "12345678901@gmail.com");
    }

    #[test]
    fn outcome_classification_is_tag_distinct() {
        let term = ConsentTerm {
            id: "t-1".to_string(),
            status: TermStatus::WaitingConsult,
            description: None,
            available_margin_value: None,
            document_number: None,
            partner_id: None,
            name: None,
        };

        let timed_out = TermOutcome::classify(term.clone(), true);
        assert!(matches!(timed_out, TermOutcome::TimedOut(_)));

        let rejected = TermOutcome::classify(
            ConsentTerm {
                status: TermStatus::Rejected,
                ..term.clone()
            },
            false,
        );
        assert!(matches!(rejected, TermOutcome::Rejected(_)));
        assert_ne!(timed_out, rejected);

        let approved = TermOutcome::classify(
            ConsentTerm {
                status: TermStatus::WaitingCreditAnalysis,
                ..term
            },
            false,
        );
        assert!(matches!(approved, TermOutcome::Approved(_)));
    }
}
