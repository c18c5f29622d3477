mod ftp;
mod session;

pub use ftp::{DEFAULT_PORT, FtpConfig, FtpConnector, FtpSession, Reply, parse_mdtm};
pub use session::{Connector, RemoteSession, SessionError, SessionErrorClass};
