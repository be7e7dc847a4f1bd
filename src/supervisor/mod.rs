//! Lifecycle supervision of the management interface
//!
//! The [`Supervisor`] runs listener generations; the [`watchdog`] probes
//! them and the [`worker`] monitor reports crashes. Everything that needs
//! to restart a generation goes through
//! [`SupervisorContext::request_restart`].

pub mod context;
mod generation;
mod run;
mod signal;
pub mod tls;
pub mod watchdog;
pub mod worker;

pub use context::{ChallengeRecord, RestartSource, SupervisorContext, RESTART_GRACE};
pub use generation::ListenerGeneration;
pub use run::{run_debug_server, run_server, Supervisor, SupervisorState};
pub use signal::Flag;
pub use tls::{CertificatePair, CryptoProvider, OpensslProvider, TlsProvisioner};
pub use watchdog::{HttpProber, ProbeOutcome, Prober};
pub use worker::{WorkerProcess, WorkerSpec};
