use std::path::Path;

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Returns a channel connected to the UNIX socket at `path`, for use with
/// tonic-generated clients via `Client::new` rather than `Client::connect`.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref().to_owned();

    // The URI is a placeholder required by `Endpoint`; the connector
    // ignores it.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}
