// ABOUTME: Admission control for executions, independent of the connection pool
//
// Callers obtain an AdmissionPermit for a tenant before acquiring a connection,
// so nobody holds a scarce remote session while queued for admission.

pub mod config;
pub mod controller;

pub use config::AdmissionConfig;
pub use controller::{
    AdmissionController, AdmissionError, AdmissionPermit, AdmissionStats, TenantId, TenantStats,
};
