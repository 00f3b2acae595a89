use std::io;
use std::net::SocketAddr;
use std::path::Path;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, Stream};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, Take};
use tracing::{debug, warn};

use crate::tracker::{ActiveDownload, ConnectionId};
use crate::AppState;

const CHUNK_SIZE: usize = 16 * 1024;

pub fn routes(route: &str) -> Router<AppState> {
    Router::new()
        .route(route, get(serve_artifact))
        .fallback(not_found)
}

/// Result of checking the artifact before any response bytes go out
#[derive(Debug)]
pub enum ArtifactProbe {
    Ready { file: File, size: u64 },
    Missing { reason: String },
}

/// Open the artifact and read its size from the opened handle.
///
/// Checked on every request; the file may be rebuilt or removed between
/// downloads.
pub async fn probe_artifact(path: &Path) -> ArtifactProbe {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            return ArtifactProbe::Missing {
                reason: e.to_string(),
            }
        }
    };

    match file.metadata().await {
        Ok(metadata) if metadata.is_file() => ArtifactProbe::Ready {
            file,
            size: metadata.len(),
        },
        Ok(_) => ArtifactProbe::Missing {
            reason: "not a regular file".to_string(),
        },
        Err(e) => ArtifactProbe::Missing {
            reason: e.to_string(),
        },
    }
}

/// GET <route>
/// Stream the artifact with an exact Content-Length, one download per connection
async fn serve_artifact(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
) -> Response {
    let artifact_path = &state.config.artifact_path;

    let (file, size) = match probe_artifact(artifact_path).await {
        ArtifactProbe::Ready { file, size } => (file, size),
        ArtifactProbe::Missing { reason } => {
            warn!(
                client = %peer,
                "Firmware not found: {} ({})",
                artifact_path.display(),
                reason
            );
            return (StatusCode::NOT_FOUND, "Firmware not found").into_response();
        }
    };

    // HEAD reports the size without counting as a download
    if method == Method::HEAD {
        return (StatusCode::OK, artifact_headers(size)).into_response();
    }

    let download = state.tracker.begin(ConnectionId::new(peer));
    debug!(serial = download.serial(), size, "Streaming {}", artifact_path.display());
    let body = Body::from_stream(artifact_stream(file.take(size), size, download));

    (StatusCode::OK, artifact_headers(size), body).into_response()
}

fn artifact_headers(size: u64) -> [(header::HeaderName, HeaderValue); 3] {
    [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (header::CONTENT_LENGTH, HeaderValue::from(size)),
        (header::CONNECTION, HeaderValue::from_static("close")),
    ]
}

struct Transfer<R> {
    reader: R,
    expected: u64,
    download: ActiveDownload,
}

/// Incrementally read `reader` into body chunks.
///
/// The download record travels with the stream: it is completed at EOF,
/// failed on a read error or short file, and aborted if the body is dropped
/// before either (client disconnect).
fn artifact_stream<R>(
    reader: Take<R>,
    expected: u64,
    download: ActiveDownload,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let transfer = Transfer {
        reader,
        expected,
        download,
    };

    stream::unfold(Some(transfer), |state| async move {
        let mut transfer = state?;
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        match transfer.reader.read_buf(&mut buf).await {
            Ok(0) => {
                let sent = transfer.download.bytes_sent();
                if sent < transfer.expected {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "artifact truncated: sent {} of {} bytes",
                            sent, transfer.expected
                        ),
                    );
                    transfer.download.fail(&err);
                    return Some((Err(err), None));
                }
                transfer.download.complete();
                None
            }
            Ok(n) => {
                transfer.download.record_sent(n as u64);
                Some((Ok(buf.freeze()), Some(transfer)))
            }
            Err(e) => {
                transfer.download.fail(&e);
                Some((Err(e), None))
            }
        }
    })
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    debug!(path = %uri.path(), "Unknown path requested");
    (StatusCode::NOT_FOUND, "Not Found")
}
