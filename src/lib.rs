//! OCI CSI Plugin Core
//!
//! Controller and node services for Oracle Cloud Infrastructure storage:
//! block volumes (iSCSI, paravirtualized, UHP multipath), shared file
//! systems (file system + mount target + export) and Lustre.
//!
//! The CSI surface is expressed as plain request/response structs and async
//! service traits in [`csi`]; the gRPC transport binds to those traits from
//! outside this crate. Cloud control-plane access goes through the
//! capability ports in [`cloud`], host device and mount manipulation through
//! [`disk`], and Kubernetes node lookup through [`k8s`]. Every seam is a
//! trait so the services are testable with hand-rolled fakes.
//!
//! # Modules
//!
//! - [`controller`]: volume provisioning, attachment and snapshot services
//! - [`node`]: staging, publishing and expansion on the host
//! - [`cloud`]: control-plane capability ports, polling, error classification
//! - [`disk`]: iscsiadm, multipath and mount plumbing
//! - [`lnet`]: LNet bring-up for Lustre clients
//! - [`util`]: volume handles, parameter extraction, the volume lock registry

pub mod cloud;
pub mod config;
pub mod controller;
pub mod csi;
pub mod disk;
pub mod error;
pub mod k8s;
pub mod lnet;
pub mod metrics;
pub mod node;
pub mod util;

pub use config::Config;
pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
