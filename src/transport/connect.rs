//! Host address parsing and connection.
//!
//! - Unix: Unix Domain Socket (`$NVIM`, `--listen /path/to/sock`)
//! - Windows: Named Pipe (`\\.\pipe\nvim-1234-0`)
//! - TCP: `host:port`
//! - Stdio: embedded child (`nvim --embed`) talking over our stdin/stdout
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::transport::{connect, ServerAddr};
//!
//! let addr = ServerAddr::from_env().unwrap_or(ServerAddr::Stdio);
//! let (reader, writer) = connect(&addr).await?;
//! ```

use std::fmt;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Read half of a host connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a host connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Environment variables consulted, in order, for the host address.
pub const ADDRESS_ENV_VARS: [&str; 2] = ["NVIM", "NVIM_LISTEN_ADDRESS"];

/// Where the host listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    /// Unix socket path, or named pipe path on Windows.
    Unix(PathBuf),
    /// TCP endpoint.
    Tcp {
        /// Host name or IP.
        host: String,
        /// Port.
        port: u16,
    },
    /// This process's stdin/stdout.
    Stdio,
}

impl ServerAddr {
    /// Parse an address as Neovim prints it in `v:servername`.
    ///
    /// `host:port` with a numeric port and no path separator is TCP,
    /// anything else is a socket or pipe path.
    pub fn parse(addr: &str) -> Self {
        if !addr.contains('/') && !addr.contains('\\') {
            if let Some((host, port)) = addr.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    if !host.is_empty() {
                        return ServerAddr::Tcp {
                            host: host.to_string(),
                            port,
                        };
                    }
                }
            }
        }
        ServerAddr::Unix(PathBuf::from(addr))
    }

    /// Read the address from `$NVIM`, falling back to `$NVIM_LISTEN_ADDRESS`.
    pub fn from_env() -> Option<Self> {
        ADDRESS_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.is_empty())
            .map(|value| Self::parse(&value))
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
            ServerAddr::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ServerAddr::Stdio => f.write_str("stdio"),
        }
    }
}

// ============================================================================
// Platform-specific socket connect
// ============================================================================

#[cfg(unix)]
async fn connect_socket(path: &std::path::Path) -> Result<(BoxedReader, BoxedWriter)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(windows)]
async fn connect_socket(path: &std::path::Path) -> Result<(BoxedReader, BoxedWriter)> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let pipe = ClientOptions::new().open(path)?;
    let (reader, writer) = tokio::io::split(pipe);
    Ok((Box::new(reader), Box::new(writer)))
}

/// Open a connection to the host.
///
/// Must be called from within a tokio runtime with I/O enabled.
pub async fn connect(addr: &ServerAddr) -> Result<(BoxedReader, BoxedWriter)> {
    match addr {
        ServerAddr::Unix(path) => connect_socket(path).await,
        ServerAddr::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        ServerAddr::Stdio => Ok((Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))),
    }
}
