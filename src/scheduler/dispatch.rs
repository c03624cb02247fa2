//! Instantiating parameterized job templates.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::{ConcreteJob, JobSpec, JobTemplate};

/// Id of the child job created by a dispatch.
///
/// With a request id the suffix is derived from it, so replaying the same
/// request names the same child and the state machine can drop the repeat.
pub fn dispatch_id(parent: &str, request_id: Option<&str>) -> String {
    let uuid = match request_id {
        Some(rid) => Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}/{}", parent, rid).as_bytes()),
        None => Uuid::new_v4(),
    };
    let simple = uuid.simple().to_string();
    format!("{}-dispatch-{}", parent, &simple[..8])
}

/// Validate `meta` against the template and build the concrete child job.
///
/// Fails before anything is proposed when a required key is missing, an
/// undeclared key is supplied or a value breaks its validation rule.
pub fn dispatch(
    template: &JobTemplate,
    meta: &BTreeMap<String, String>,
    child_id: &str,
) -> Result<ConcreteJob, ValidationError> {
    let params = &template.parameters;

    if let Some(missing) = params
        .meta_required
        .iter()
        .find(|key| !meta.contains_key(*key))
    {
        return Err(ValidationError::MissingMetaKey(missing.clone()));
    }
    if let Some(unknown) = meta.keys().find(|key| !params.declares(key)) {
        return Err(ValidationError::UnknownMetaKey(unknown.clone()));
    }
    for (key, value) in meta {
        if let Some(rule) = params.validation.get(key) {
            rule.check(key, value)?;
        }
    }

    let mut spec: JobSpec = template.spec.clone();
    spec.id = child_id.to_string();
    spec.parameterized = None;
    for (key, value) in meta {
        spec.meta.insert(key.clone(), value.clone());
        spec.task.env.insert(key.clone(), value.clone());
    }
    spec.validate()?;

    Ok(ConcreteJob {
        spec,
        parent_id: Some(template.spec.id.clone()),
        dispatch_meta: meta.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::job_spec;
    use crate::model::{Job, MetaKind, MetaValidation, ParameterizedSpec};

    fn template() -> JobTemplate {
        let mut spec = job_spec("train");
        spec.parameterized = Some(ParameterizedSpec {
            meta_required: vec!["MODEL_NAME".into()],
            meta_optional: vec!["EPOCHS".into()],
            validation: BTreeMap::from([
                (
                    "MODEL_NAME".to_string(),
                    MetaValidation {
                        pattern: Some("^[a-zA-Z0-9_-]+$".into()),
                        min_length: Some(3),
                        ..Default::default()
                    },
                ),
                (
                    "EPOCHS".to_string(),
                    MetaValidation {
                        kind: MetaKind::Integer,
                        min_value: Some(1),
                        ..Default::default()
                    },
                ),
            ]),
        });
        match spec.into_job().unwrap() {
            Job::Template(t) => t,
            Job::Concrete(_) => unreachable!(),
        }
    }

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_required_key_fails() {
        assert_eq!(
            dispatch(&template(), &meta(&[("EPOCHS", "3")]), "train-dispatch-1"),
            Err(ValidationError::MissingMetaKey("MODEL_NAME".into()))
        );
    }

    #[test]
    fn undeclared_key_fails() {
        assert_eq!(
            dispatch(
                &template(),
                &meta(&[("MODEL_NAME", "exp-1"), ("GPU", "1")]),
                "train-dispatch-1"
            ),
            Err(ValidationError::UnknownMetaKey("GPU".into()))
        );
    }

    #[test]
    fn rule_violation_fails() {
        assert!(matches!(
            dispatch(&template(), &meta(&[("MODEL_NAME", "bad name")]), "x"),
            Err(ValidationError::InvalidMetaValue { key, .. }) if key == "MODEL_NAME"
        ));
        assert!(dispatch(
            &template(),
            &meta(&[("MODEL_NAME", "exp-1"), ("EPOCHS", "0")]),
            "x"
        )
        .is_err());
    }

    #[test]
    fn child_carries_meta_in_env() {
        let child = dispatch(
            &template(),
            &meta(&[("MODEL_NAME", "exp-1")]),
            "train-dispatch-abcd1234",
        )
        .unwrap();
        assert_eq!(child.spec.id, "train-dispatch-abcd1234");
        assert_eq!(child.parent_id.as_deref(), Some("train"));
        assert!(child.spec.parameterized.is_none());
        assert_eq!(child.spec.task.env.get("MODEL_NAME").map(String::as_str), Some("exp-1"));
        assert_eq!(child.spec.meta.get("MODEL_NAME").map(String::as_str), Some("exp-1"));
    }

    #[test]
    fn request_id_pins_child_id() {
        let a = dispatch_id("train", Some("req-1"));
        assert_eq!(a, dispatch_id("train", Some("req-1")));
        assert_ne!(a, dispatch_id("train", Some("req-2")));
        assert!(a.starts_with("train-dispatch-"));
        assert_eq!(a.len(), "train-dispatch-".len() + 8);
        assert_ne!(dispatch_id("train", None), dispatch_id("train", None));
    }
}
