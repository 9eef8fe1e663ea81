/// Dropwatch - client engine for a drop/reversal analysis backend
///
/// The backend does the pattern detection; this library keeps the client side
/// consistent:
/// - Candle Store: ordered, deduplicated, bounded OHLC buffer fed by bulk
///   fetches, polling refreshes and pushed ticks
/// - Signal Log: bounded newest-first log of analysis signals, with in-flight
///   reversals updated in place
/// - Polling Refresher: interval re-fetch of the latest day while live push is off
/// - Hub client: reconnecting push connection delivering typed signals
/// - Session: owns all of the above and handles their events one at a time
pub mod api;
pub mod candle;
pub mod error;
pub mod hub;
pub mod params;
pub mod refresher;
pub mod session;
pub mod signal;
pub mod signal_log;
pub mod store;
pub mod symbols;

// Re-export commonly used types for convenience
pub use api::{AnalysisApi, AnalysisBackend, ApiConfig};
pub use candle::Candle;
pub use error::{DropwatchError, Severity};
pub use hub::{ConnectionStatus, HubClient, HubConfig, HubConnector, HubEvent, HubHandle};
pub use params::{AnalysisParameters, TimeFrame, TimeRange};
pub use session::{Session, SessionCommand, SessionConfig, SessionHandle, SessionUpdate};
pub use signal::SignalMessage;
pub use signal_log::{IngestOutcome, LogEntry, SignalLog};
pub use store::CandleStore;
pub use symbols::SymbolCache;
