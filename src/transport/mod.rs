//! Client-side transport: connectors, request correlation and pooling.

pub mod connection;
pub mod connector;
pub mod correlator;
pub mod pool;

pub use connection::Connection;
pub use connector::{Connector, TcpConnector, TransportStream};
pub use correlator::Correlator;
pub use pool::{ConnectionPool, Lease, MaintenanceReport, PoolSettings, PoolStats};
