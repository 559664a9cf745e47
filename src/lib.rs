//! Payroll-Loan Origination Flow API Library
//!
//! Orchestrates a multi-party loan-origination workflow: customer records
//! held in a third-party CRM are reconciled with a credit-line digital
//! signature and simulation provider, driving a CPF through consent-term
//! issuance, authorization, asynchronous status polling and loan simulation.
//! Approved offers are persisted to a flat per-CPF cache and written back
//! into the CRM pipeline.
//!
//! # Modules
//!
//! - `batch`: fan-out-capped batch runs over CRM pipelines.
//! - `cache`: file-backed approved-offer cache.
//! - `config`: configuration management.
//! - `crm`: CRM gateway, field mapping and response normalization.
//! - `errors`: error handling types and the flow failure taxonomy.
//! - `flow`: end-to-end flow coordinator.
//! - `handlers`: HTTP request handlers.
//! - `models`: core data models.
//! - `provider`: credit-provider API client.
//! - `simulation`: priority-ordered simulation attempter.
//! - `term`: consent-term lifecycle manager and normalizers.
//! - `token`: provider token cache with single-flight renewal.

pub mod batch;
pub mod cache;
pub mod config;
pub mod crm;
pub mod errors;
pub mod flow;
pub mod handlers;
pub mod models;
pub mod provider;
pub mod simulation;
pub mod term;
pub mod token;
