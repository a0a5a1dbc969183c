//! The admission listener: `POST /test` with a job document.

use std::{convert::Infallible, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use hyper::{
    body::HttpBody as _,
    header::CONTENT_LENGTH,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use tokio_util::sync::CancellationToken;

use crate::err::AdmissionErr;

use super::Admission;

pub const SUBMIT_PATH: &str = "/test";

/// Largest job document the listener reads. Anything longer is answered with
/// `413` before validation.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// A listener that is bound but not yet serving.
pub struct AdmissionServer {
    pub local_addr: SocketAddr,
    /// Resolves once the listener has shut down. Dropping it releases the
    /// [`Admission`] handles held by the listener.
    pub serve: BoxFuture<'static, hyper::Result<()>>,
}

/// Bind `listen` and route submissions into `admission`.
///
/// The listener stops accepting connections once `shutdown` is cancelled and
/// finishes after every open request is answered.
pub fn bind(
    listen: SocketAddr,
    admission: Admission,
    shutdown: CancellationToken,
) -> hyper::Result<AdmissionServer> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let admission = admission.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let admission = admission.clone();
                async move { Ok::<_, Infallible>(handle(&admission, req, remote).await) }
            }))
        }
    });

    let server = Server::try_bind(&listen)?.serve(make_svc);
    let local_addr = server.local_addr();
    tracing::info!("Accepting jobs on http://{}{}", local_addr, SUBMIT_PATH);

    let serve = server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .boxed();
    Ok(AdmissionServer { local_addr, serve })
}

async fn handle(admission: &Admission, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
    if req.method() != Method::POST || req.uri().path() != SUBMIT_PATH {
        tracing::warn!(
            "Unexpected request {} {} from {}",
            req.method(),
            req.uri(),
            remote
        );
        return respond(StatusCode::NOT_FOUND, "Not found".into());
    }

    let declared_len = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if matches!(declared_len, Some(len) if len > MAX_BODY_BYTES as u64) {
        tracing::warn!("Rejected oversized job from {}", remote);
        return respond(StatusCode::PAYLOAD_TOO_LARGE, too_large());
    }

    let body = match read_body(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(BodyErr::TooLarge) => {
            tracing::warn!("Rejected oversized job from {}", remote);
            return respond(StatusCode::PAYLOAD_TOO_LARGE, too_large());
        }
        Err(BodyErr::Read(e)) => {
            tracing::warn!("Cannot read request body from {}: {}", remote, e);
            return respond(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match admission.submit(&body) {
        Ok(()) => {
            tracing::info!("Accepted job from {}", remote);
            respond(StatusCode::OK, "OK".into())
        }
        Err(e @ AdmissionErr::Validation(_)) => {
            tracing::warn!("Rejected job from {}: {}", remote, e);
            respond(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e @ AdmissionErr::Overloaded) => respond(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
        Err(e @ AdmissionErr::Closed) => respond(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

enum BodyErr {
    TooLarge,
    Read(hyper::Error),
}

/// Read `body` into memory, giving up as soon as it exceeds `limit` bytes.
async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, BodyErr> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyErr::Read)?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyErr::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn too_large() -> String {
    format!("Job documents are limited to {} bytes", MAX_BODY_BYTES)
}

fn respond(status: StatusCode, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res
}
