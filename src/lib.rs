//! Talos CCM - cloud controller manager for Kubernetes clusters on Talos nodes
//!
//! The kubelet on a Talos node registers itself with the uninitialized cloud
//! taint and waits for a cloud provider to finish node setup. This crate
//! completes that setup: it fetches platform metadata from each node over the
//! machine API, derives labels, annotations, taints and addresses through a
//! user-configured transformation pipeline, approves kubelet serving
//! certificate requests, and (optionally) assigns pod CIDRs to nodes from the
//! cluster CIDR pools.
//!
//! # Modules
//!
//! - [`cloud`] - provider constants and the controller entry point
//! - [`config`] - cloud configuration file handling
//! - [`csr`] - kubelet serving certificate approval controller
//! - [`error`] - error types
//! - [`instances`] - per-node metadata reconciliation and address resolution
//! - [`metrics`] - Prometheus metrics and the exporter endpoint
//! - [`netutil`] - IP classification and dual-stack ordering helpers
//! - [`nodeipam`] - pod CIDR allocation controller
//! - [`nodeutil`] - node object helpers (taints, annotations, CIDR patches)
//! - [`platform`] - machine API client with retry and reconnect
//! - [`selector`] - node selector matching engine
//! - [`transformer`] - rule-driven node specification transformer

#![deny(missing_docs)]

pub mod cloud;
pub mod config;
pub mod csr;
pub mod error;
pub mod instances;
pub mod metrics;
pub mod netutil;
pub mod nodeipam;
pub mod nodeutil;
pub mod platform;
pub mod selector;
pub mod transformer;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
