//! Routes admission reviews to the registered validators and renders their
//! decisions.
use std::{error::Error, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use kube::core::{
    DynamicObject, TypeMeta,
    admission::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
        META_API_VERSION_V1, META_KIND,
    },
    response::StatusSummary,
};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, field::Empty, info, instrument};

/// `admission.k8s.io/v1beta1` apiVersion; no longer exported by `kube::core::admission`.
const META_API_VERSION_V1BETA1: &str = "admission.k8s.io/v1beta1";

use crate::{
    constants::HEALTH_PATH,
    registry::{AdmissionError, Registry},
    resource::ResourceIdentity,
    secrets::SecretProvider,
};

#[derive(Debug, Snafu)]
pub enum ReviewError {
    #[snafu(display("failed to parse admission review"))]
    ParseReview { source: serde_json::Error },

    #[snafu(display("admission review does not contain a request"))]
    MissingRequest { source: ConvertAdmissionReviewError },

    #[snafu(display("unsupported admission review apiVersion {api_version:?}"))]
    UnsupportedApiVersion { api_version: String },
}

/// Answers admission reviews using the validators of a [`Registry`].
///
/// Every decision is returned with HTTP status 200. Denials carry their
/// reason as status code and message inside the review response:
///
/// - 400 if the review or the object under review cannot be decoded,
/// - 422 if validation fails.
///
/// Objects of types without a registered validator are allowed.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    secrets: Arc<dyn SecretProvider>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, secrets: Arc<dyn SecretProvider>) -> Self {
        Self { registry, secrets }
    }

    /// Returns a [`Router`] serving one POST route per registration and the
    /// health route.
    pub fn router(self) -> Router {
        let mut router = Router::new();
        for registration in self.registry.iter() {
            router = router.route(registration.path(), post(review_handler));
        }

        router
            .layer(TraceLayer::new_for_http())
            // The health route is below the TraceLayer so as not to be instrumented
            .route(HEALTH_PATH, get(|| async { "ok" }))
            .with_state(self)
    }

    /// Decides on the admission review contained in `body`.
    ///
    /// The response uses the apiVersion of the received review. Bodies which
    /// cannot be parsed at all are answered as `admission.k8s.io/v1`.
    #[instrument(
        name = "review",
        skip_all,
        fields(admission.uid = Empty, resource.identity = Empty, admission.allowed = Empty)
    )]
    pub async fn review(&self, body: &[u8]) -> AdmissionReview<DynamicObject> {
        let (request, object) = match parse_review(body) {
            Ok(parsed) => parsed,
            Err(err) => return invalid(&err),
        };
        let response = AdmissionResponse::from(&request);

        let identity = ResourceIdentity::from(&request.kind);
        let span = Span::current();
        span.record("admission.uid", request.uid.as_str());
        span.record("resource.identity", tracing::field::display(&identity));

        let api_version = request.types.api_version.as_str();
        if ![META_API_VERSION_V1, META_API_VERSION_V1BETA1].contains(&api_version) {
            let err = UnsupportedApiVersionSnafu { api_version }.build();
            return deny(response, StatusCode::BAD_REQUEST, &err);
        }

        let Some(registration) = self.registry.lookup(&identity) else {
            debug!("no validator registered, allowing");
            return allow(response);
        };

        match registration
            .handler()
            .admit(&request, object.as_ref(), self.secrets.as_ref())
            .await
        {
            Ok(()) => allow(response),
            Err(AdmissionError::Validate { source, .. }) => {
                deny(response, StatusCode::UNPROCESSABLE_ENTITY, &source)
            }
            Err(err) => deny(response, StatusCode::BAD_REQUEST, &err),
        }
    }
}

async fn review_handler(
    State(dispatcher): State<Dispatcher>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(dispatcher.review(&body).await)
}

/// Parses the review in `body` and splits off the raw object under review.
///
/// The object is left undecoded, only validators know its type. A `null`
/// object is treated as missing.
fn parse_review(
    body: &[u8],
) -> Result<(AdmissionRequest<DynamicObject>, Option<Value>), ReviewError> {
    let mut review: Value = serde_json::from_slice(body).context(ParseReviewSnafu)?;

    let object = review
        .pointer_mut("/request/object")
        .map(Value::take)
        .filter(|object| !object.is_null());
    if let Some(old_object) = review.pointer_mut("/request/oldObject") {
        old_object.take();
    }

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(review).context(ParseReviewSnafu)?;
    let request = review.try_into().context(MissingRequestSnafu)?;

    Ok((request, object))
}

fn allow(response: AdmissionResponse) -> AdmissionReview<DynamicObject> {
    Span::current().record("admission.allowed", true);
    response.into_review()
}

fn deny(
    response: AdmissionResponse,
    code: StatusCode,
    error: &(dyn Error + 'static),
) -> AdmissionReview<DynamicObject> {
    let message = error_message(error);
    Span::current().record("admission.allowed", false);
    info!(status.code = code.as_u16(), status.message = %message, "denying admission");

    with_code(response.deny(message), code).into_review()
}

/// Answers a body which does not contain a usable request. There is no uid to
/// echo.
fn invalid(error: &ReviewError) -> AdmissionReview<DynamicObject> {
    let message = error_message(error);
    Span::current().record("admission.allowed", false);
    info!(
        status.code = StatusCode::BAD_REQUEST.as_u16(),
        status.message = %message,
        "rejecting admission review"
    );

    let mut response = with_code(AdmissionResponse::invalid(message), StatusCode::BAD_REQUEST);
    response.types = TypeMeta {
        api_version: META_API_VERSION_V1.to_owned(),
        kind: META_KIND.to_owned(),
    };
    response.into_review()
}

fn with_code(mut response: AdmissionResponse, code: StatusCode) -> AdmissionResponse {
    response.result.status = Some(StatusSummary::Failure);
    response.result.code = code.as_u16();
    response
}

/// Joins the messages of `error` and all of its sources with `": "`.
fn error_message(error: &(dyn Error + 'static)) -> String {
    std::iter::successors(Some(error), |&error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use http::Request;
    use k8s_openapi::api::core::v1::Pod;
    use rstest::rstest;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        secrets::{SecretError, SecretSession},
        validation::{ValidationContext, ValidationError, from_fn},
    };

    const UID: &str = "e911857d-c318-11e8-bbad-025000000001";

    struct NoSecrets;

    #[async_trait]
    impl SecretSession for NoSecrets {
        async fn resolve(&self, _name: &str, _key: &str) -> Result<String, SecretError> {
            Err(SecretError::MissingNamespace)
        }
    }

    impl SecretProvider for NoSecrets {
        fn acquire(&self, _namespace: Option<&str>) -> Result<Box<dyn SecretSession>, SecretError> {
            Ok(Box::new(Self))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = Registry::new();
        registry.register_resource::<Pod, _>(from_fn(|pod: &Pod, _: &ValidationContext<'_>| {
            match pod.metadata.name.as_deref() {
                Some(name) if !name.is_empty() => Ok(()),
                _ => Err(ValidationError::rejected("name must be non-empty")),
            }
        }));

        Dispatcher::new(Arc::new(registry), Arc::new(NoSecrets))
    }

    fn review(api_version: &str, kind: &str, object: &Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": api_version,
            "kind": "AdmissionReview",
            "request": {
                "uid": UID,
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {"username": "kubernetes-admin"},
                "namespace": "default",
                "object": object,
            }
        }))
        .expect("review must serialize")
    }

    fn response(review: AdmissionReview<DynamicObject>) -> AdmissionResponse {
        review.response.expect("review must contain a response")
    }

    #[rstest]
    #[case(META_API_VERSION_V1)]
    #[case(META_API_VERSION_V1BETA1)]
    #[tokio::test]
    async fn allow_valid_pod(#[case] api_version: &str) {
        let review = dispatcher()
            .review(&review(api_version, "Pod", &json!({"metadata": {"name": "nginx"}})))
            .await;

        assert_eq!(review.types.api_version, api_version);
        assert_eq!(review.types.kind, META_KIND);
        let response = response(review);
        assert!(response.allowed);
        assert_eq!(response.uid, UID);
        assert_eq!(response.result.code, 0);
    }

    #[tokio::test]
    async fn reject_invalid_pod() {
        let response = response(
            dispatcher()
                .review(&review(META_API_VERSION_V1, "Pod", &json!({"metadata": {"name": ""}})))
                .await,
        );

        assert!(!response.allowed);
        assert_eq!(response.uid, UID);
        assert_eq!(response.result.code, 422);
        assert_eq!(response.result.message, "name must be non-empty");
    }

    #[rstest]
    #[case::wrong_type(json!({"metadata": {"name": 42}}))]
    #[case::null(Value::Null)]
    #[tokio::test]
    async fn reject_undecodable_pod(#[case] object: Value) {
        let response = response(
            dispatcher()
                .review(&review(META_API_VERSION_V1, "Pod", &object))
                .await,
        );

        assert!(!response.allowed);
        assert_eq!(response.uid, UID);
        assert_eq!(response.result.code, 400);
    }

    #[tokio::test]
    async fn allow_unmatched_kind_without_decoding() {
        let response = response(
            dispatcher()
                .review(&review(META_API_VERSION_V1, "Service", &json!({"spec": 42})))
                .await,
        );

        assert!(response.allowed);
        assert_eq!(response.result.code, 0);
        assert!(response.result.message.is_empty());
    }

    #[tokio::test]
    async fn unsupported_version_echoes_request() {
        let review = dispatcher()
            .review(&review("admission.k8s.io/v2", "Pod", &json!({})))
            .await;

        assert_eq!(review.types.api_version, "admission.k8s.io/v2");
        let response = response(review);
        assert!(!response.allowed);
        assert_eq!(response.uid, UID);
        assert_eq!(response.result.code, 400);
        assert_eq!(
            response.result.message,
            r#"unsupported admission review apiVersion "admission.k8s.io/v2""#
        );
    }

    #[rstest]
    #[case::garbage(b"not json".to_vec())]
    #[case::missing_request(br#"{"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"}"#.to_vec())]
    #[case::missing_user_info(br#"{"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview", "request": {"uid": "1"}}"#.to_vec())]
    #[tokio::test]
    async fn reject_invalid_envelope(#[case] body: Vec<u8>) {
        let review = dispatcher().review(&body).await;

        assert_eq!(review.types.api_version, META_API_VERSION_V1);
        let response = response(review);
        assert!(!response.allowed);
        assert!(response.uid.is_empty());
        assert_eq!(response.result.code, 400);
    }

    #[tokio::test]
    async fn response_wire_format() {
        let review = dispatcher()
            .review(&review(META_API_VERSION_V1, "Pod", &json!({"metadata": {"name": ""}})))
            .await;

        let review = serde_json::to_value(&review).expect("review must serialize");
        assert_eq!(review["apiVersion"], META_API_VERSION_V1);
        assert_eq!(review["kind"], "AdmissionReview");
        assert_eq!(review["response"]["uid"], UID);
        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(review["response"]["status"]["code"], 422);
        assert_eq!(
            review["response"]["status"]["message"],
            "name must be non-empty"
        );
    }

    #[tokio::test]
    async fn router_serves_registered_paths() {
        let router = dispatcher().router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/validate-v1-pod")
                    .header("content-type", "application/json")
                    .body(Body::from(review(
                        META_API_VERSION_V1,
                        "Pod",
                        &json!({"metadata": {"name": "nginx"}}),
                    )))
                    .expect("request must build"),
            )
            .await
            .expect("router is infallible");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::get(HEALTH_PATH)
                    .body(Body::empty())
                    .expect("request must build"),
            )
            .await
            .expect("router is infallible");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::post("/validate-v1-service")
                    .body(Body::empty())
                    .expect("request must build"),
            )
            .await
            .expect("router is infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_message_joins_sources() {
        let err = AdmissionError::Validate {
            source: ValidationError::AcquireSecrets {
                source: SecretError::MissingNamespace,
            },
            identity: ResourceIdentity::of::<Pod>(),
        };

        assert_eq!(
            error_message(&err),
            "failed to validate v1, Kind=Pod: failed to acquire secrets: no namespace to resolve secrets in"
        );
    }
}
