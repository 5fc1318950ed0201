//! Small HTTP helpers shared by the coordinator and worker servers.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::ErrorResponse;

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .status(status)
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{}"))))
}

pub fn error_response(status: u16, kind: &str, message: &str) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    json_response(
        status,
        &ErrorResponse {
            error: kind.to_string(),
            message: message.to_string(),
        },
    )
}
