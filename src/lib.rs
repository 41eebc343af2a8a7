// ABOUTME: Library crate for ptygate exposing the pool, executor, admission and gateway APIs
// ABOUTME: The binary in main.rs is a thin CLI over ExecutionGateway

#![allow(missing_docs)]

pub mod admission;
pub mod config;
pub mod executor;
pub mod gateway;
pub mod invocation;
pub mod pool;
pub mod provisioning;
pub mod remote;
pub mod validation;

pub use admission::{AdmissionController, AdmissionPermit, TenantId};
pub use executor::{ExecutionEvent, RemoteStreamExecutor};
pub use gateway::{ExecutionGateway, ExecutionStream, GatewayError};
pub use pool::{ConnectionPool, PooledConnection};
