use async_trait::async_trait;
use gatehouse_webhook::validation::{ValidationContext, ValidationError, Validator};
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

/// Rejects Pods without a name.
pub struct PodNameValidator;

#[async_trait]
impl Validator<Pod> for PodNameValidator {
    async fn validate(
        &self,
        pod: &Pod,
        context: &ValidationContext<'_>,
    ) -> Result<(), ValidationError> {
        match pod.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => {
                debug!(k8s.pod.name = name, dry_run = context.dry_run, "pod name is valid");
                Ok(())
            }
            _ => Err(ValidationError::rejected("name must be non-empty")),
        }
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_webhook::secrets::{SecretError, SecretSession};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::{DynamicObject, admission::AdmissionRequest};
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    struct NoSecrets;

    #[async_trait]
    impl SecretSession for NoSecrets {
        async fn resolve(&self, _name: &str, _key: &str) -> Result<String, SecretError> {
            Err(SecretError::MissingNamespace)
        }
    }

    fn request() -> AdmissionRequest<DynamicObject> {
        serde_json::from_value(json!({
            "uid": "d595bfe1-0b8a-4ac5-a1c3-7cd2f00b8d4c",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": "CREATE",
            "userInfo": {"username": "kubernetes-admin"},
            "namespace": "default",
            "dryRun": true,
        }))
        .expect("request must deserialize")
    }

    fn pod(name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(str::to_owned),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[rstest]
    #[case(Some("nginx"), true)]
    #[case(Some(""), false)]
    #[case(None, false)]
    #[tokio::test]
    async fn pod_name(#[case] name: Option<&str>, #[case] valid: bool) {
        let request = request();
        let context = ValidationContext::new(&request, &NoSecrets);

        let result = PodNameValidator.validate(&pod(name), &context).await;
        match result {
            Ok(()) => assert!(valid),
            Err(err) => {
                assert!(!valid);
                assert_eq!(err.to_string(), "name must be non-empty");
            }
        }
    }
}
