//! Request metrics
//!
//! Every cloud call increments a counter labeled by verb, resource and
//! outcome class; the controller adapters call [`record_request`] at the
//! client boundary. Exposition is plain Prometheus text over hyper.

use prometheus::{register_int_counter_vec, IntCounterVec};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{Error, Result};

fn request_counter() -> &'static IntCounterVec {
    static COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        register_int_counter_vec!(
            "oci_csi_requests_total",
            "Cloud API requests issued by the plugin",
            &["verb", "resource", "code"]
        )
        .unwrap()
    })
}

/// Records one cloud API call. `code` is `ok` or the error class label.
pub fn record_request<T>(verb: &str, resource: &str, result: &Result<T>) {
    let code = match result {
        Ok(_) => "ok".to_string(),
        Err(Error::Cloud(service_err)) => service_err.class().to_string(),
        Err(_) => "internal".to_string(),
    };
    request_counter()
        .with_label_values(&[verb, resource, &code])
        .inc();
}

/// Serves `/metrics` until the process exits.
pub async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ServiceError;

    #[test]
    fn test_record_request_labels() {
        record_request("get", "volume", &Ok(()));
        record_request::<()>(
            "create",
            "volume",
            &Err(Error::Cloud(ServiceError::http(429, "TooManyRequests", "x"))),
        );
        let ok = request_counter().with_label_values(&["get", "volume", "ok"]);
        assert!(ok.get() >= 1);
        let limited = request_counter().with_label_values(&["create", "volume", "429"]);
        assert!(limited.get() >= 1);
    }
}
