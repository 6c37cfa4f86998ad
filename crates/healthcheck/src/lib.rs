//! Health probes for lab devices.
//!
//! This crate provides the probe side of labguard:
//! - ICMP reachability through the system `ping` utility
//! - TCP service-port checks
//! - HTTP/HTTPS checks with an expected status code
//! - DNS resolution, optionally through the device itself
//! - SSH command probes and SSH performance sampling
//!
//! Every probe implements [`HealthChecker`]; [`CheckRunner`] wraps any of
//! them with a hard deadline and turns the outcome into a [`CheckResult`].
//! Expected failures (unreachable, refused, authentication) are results
//! with `success == false`, never errors.
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{CheckRunner, TcpChecker};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let checker = TcpChecker::new("192.168.1.100:22".parse()?, Duration::from_secs(2));
//! let result = CheckRunner::new()
//!     .run("lab1/pc-01", &checker, Duration::from_secs(2))
//!     .await?;
//! println!("{} healthy={}", result.kind, result.success);
//! # Ok(())
//! # }
//! ```

pub mod checkers;
pub mod runner;
pub mod session;
pub mod types;

pub use checkers::{
    CheckError, CommandChecker, DnsChecker, HealthChecker, HttpChecker, PerformanceChecker,
    PingChecker, RemoteProbe, TcpChecker,
};
pub use runner::CheckRunner;
pub use session::{
    CommandOutput, CredentialResolver, Credentials, OpenSshTransport, RemoteSession,
    RemoteTransport, SessionError, SessionTarget, StaticCredentials,
};
pub use types::{CheckKind, CheckResult, PerformanceSample, ProbeOutcome};
