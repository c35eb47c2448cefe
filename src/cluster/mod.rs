//! Remote environments that run duplicates of inner tasks.
//!
//! The engine only sees [`TaskInvoker`]s. [`ClusterConnection`] implements it
//! over a framed stream, and [`ClusterServer`] is the other end.

mod client;
pub mod protocol;
mod server;

use crate::codec::Snapshot;
use crate::environment::EnvironmentProperties;
use crate::error::ClusterError;

pub use self::client::ClusterConnection;
pub use self::protocol::RemoteOutcome;
pub use self::server::ClusterServer;

pub type ConnectionLostListener = Box<dyn Fn(&str) + Send + Sync>;

/// Capability to run inner task duplicates in a remote environment.
pub trait TaskInvoker: Send + Sync {
    /// Name of the remote environment.
    fn name(&self) -> &str;

    /// Properties the remote published, matched against environment
    /// selectors.
    fn environment(&self) -> &EnvironmentProperties;

    fn is_connected(&self) -> bool;

    /// Asks how many of `requested` concurrent duplicates the remote takes.
    fn negotiate_duplicates(&self, requested: usize) -> Result<usize, ClusterError>;

    /// Runs the duplicate `index` of the inner task described by `factory`
    /// and blocks for its outcome.
    fn invoke(&self, factory: &Snapshot, index: usize) -> Result<RemoteOutcome, ClusterError>;

    /// Registers a listener called once when the connection is lost.
    fn on_connection_lost(&self, listener: ConnectionLostListener);

    /// Cancels every call in flight.
    fn cancel_all(&self);
}
