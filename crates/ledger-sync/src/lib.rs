//! Live synchronization of owner-scoped ledger records.
//!
//! Each [`SyncSession`] keeps an in-memory list of one entity kind consistent with the
//! remote row store. It prefers a push subscription from the [`change_feed`] and falls
//! back, permanently, to interval polling when the channel cannot be trusted.

pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod fetch;
pub mod identity;
pub mod mutation;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;

pub use channel::{ChannelLease, ChannelSignal, SubscriptionChannel};
pub use config::SyncConfig;
pub use diagnostics::{
    gather, DiagnosticEvent, Diagnostics, FanoutDiagnostics, RecordingDiagnostics,
    SessionLabel, SyncMetrics, TracingDiagnostics,
};
pub use error::{SyncError, SyncResult, WriteOp};
pub use event::{ChangeEvent, ChangeOperation, RowKey};
pub use fetch::{FetchOutcome, FetchTrigger, Notice, Refresher};
pub use identity::OwnerBoundSession;
pub use mutation::MutationCoordinator;
pub use probe::{
    ConnectionProbe, HostEnvironment, RuntimeEnvironment, StaticEnvironment, StorageCheck,
    Viability, KNOWN_BAD_SIGNATURES,
};
pub use scheduler::PollingScheduler;
pub use session::{LedgerSessions, SessionFactory, SessionSpec, SyncSession};
pub use state::{ConnectionState, ConnectionStateMachine, FallbackReason, Transition};
pub use store::{DataStore, FetchApply, FetchTicket};
