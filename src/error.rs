use std::path::PathBuf;

/// Errors that stop the artifact server from starting or running
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("port {port} is already in use by another process (try `ss -ltnp | grep :{port}`)")]
    PortInUse { port: u16 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("invalid artifact route {0:?}: use a literal path without `:`, `*` or braces")]
    InvalidRoute(String),
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Could not find version in {}", .0.display())]
    FieldMissing(PathBuf),

    #[error("Version field in {} is not a number: {value}", .path.display())]
    InvalidNumber { path: PathBuf, value: String },

    #[error("Bumping {field} in {} would overflow", .path.display())]
    Overflow { path: PathBuf, field: &'static str },

    #[error("No version files given")]
    NoFiles,

    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("Firmware not found at {} (build it first, e.g. `pio run -e pixel_s3`)", .0.display())]
    SourceMissing(PathBuf),

    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
