//! Field-by-field upgrades from `runtime.v1alpha2` into `runtime.v1`.
//!
//! Fields that only exist in v1 are left at their protobuf defaults.

use crate::runtime::{v1, v1alpha2};

impl From<v1alpha2::VersionResponse> for v1::VersionResponse {
    fn from(response: v1alpha2::VersionResponse) -> Self {
        Self {
            version: response.version,
            runtime_name: response.runtime_name,
            runtime_version: response.runtime_version,
            runtime_api_version: response.runtime_api_version,
        }
    }
}

impl From<v1alpha2::ImageSpec> for v1::ImageSpec {
    fn from(spec: v1alpha2::ImageSpec) -> Self {
        Self {
            image: spec.image,
            annotations: spec.annotations,
            ..Default::default()
        }
    }
}

impl From<v1alpha2::Int64Value> for v1::Int64Value {
    fn from(value: v1alpha2::Int64Value) -> Self {
        Self { value: value.value }
    }
}

impl From<v1alpha2::Image> for v1::Image {
    fn from(image: v1alpha2::Image) -> Self {
        Self {
            id: image.id,
            repo_tags: image.repo_tags,
            repo_digests: image.repo_digests,
            size: image.size,
            uid: image.uid.map(Into::into),
            username: image.username,
            spec: image.spec.map(Into::into),
            pinned: image.pinned,
        }
    }
}

impl From<v1alpha2::ContainerMetadata> for v1::ContainerMetadata {
    fn from(metadata: v1alpha2::ContainerMetadata) -> Self {
        Self {
            name: metadata.name,
            attempt: metadata.attempt,
        }
    }
}

impl From<v1alpha2::ContainerState> for v1::ContainerState {
    fn from(state: v1alpha2::ContainerState) -> Self {
        match state {
            v1alpha2::ContainerState::ContainerCreated => Self::ContainerCreated,
            v1alpha2::ContainerState::ContainerRunning => Self::ContainerRunning,
            v1alpha2::ContainerState::ContainerExited => Self::ContainerExited,
            v1alpha2::ContainerState::ContainerUnknown => Self::ContainerUnknown,
        }
    }
}

impl From<v1alpha2::Container> for v1::Container {
    fn from(container: v1alpha2::Container) -> Self {
        // Unknown wire values collapse to CONTAINER_UNKNOWN rather than
        // leaking an out-of-range i32 into v1.
        let state = v1alpha2::ContainerState::try_from(container.state)
            .map(v1::ContainerState::from)
            .unwrap_or(v1::ContainerState::ContainerUnknown);

        Self {
            id: container.id,
            pod_sandbox_id: container.pod_sandbox_id,
            metadata: container.metadata.map(Into::into),
            image: container.image.map(Into::into),
            image_ref: container.image_ref,
            state: state.into(),
            created_at: container.created_at,
            labels: container.labels,
            annotations: container.annotations,
            image_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_image_upgrade_keeps_identity_fields() {
        let old = v1alpha2::Image {
            id: "sha256:aaa".to_string(),
            repo_tags: vec!["nginx:latest".to_string()],
            repo_digests: vec!["nginx@sha256:bbb".to_string()],
            size: 42,
            uid: Some(v1alpha2::Int64Value { value: 1000 }),
            username: "nginx".to_string(),
            spec: Some(v1alpha2::ImageSpec {
                image: "nginx:latest".to_string(),
                annotations: HashMap::from([("a".to_string(), "b".to_string())]),
            }),
            pinned: true,
        };

        let new: v1::Image = old.into();
        assert_eq!(new.id, "sha256:aaa");
        assert_eq!(new.repo_tags, vec!["nginx:latest"]);
        assert_eq!(new.repo_digests, vec!["nginx@sha256:bbb"]);
        assert_eq!(new.size, 42);
        assert_eq!(new.uid, Some(v1::Int64Value { value: 1000 }));
        assert!(new.pinned);

        let spec = new.spec.unwrap();
        assert_eq!(spec.image, "nginx:latest");
        assert_eq!(spec.annotations.get("a").map(String::as_str), Some("b"));
        assert!(spec.user_specified_image.is_empty());
    }

    #[test]
    fn test_image_upgrade_tolerates_missing_messages() {
        let old = v1alpha2::Image {
            id: "sha256:ccc".to_string(),
            ..Default::default()
        };

        let new: v1::Image = old.into();
        assert_eq!(new.id, "sha256:ccc");
        assert!(new.uid.is_none());
        assert!(new.spec.is_none());
    }

    #[test]
    fn test_container_upgrade() {
        let old = v1alpha2::Container {
            id: "c1".to_string(),
            pod_sandbox_id: "pod1".to_string(),
            metadata: Some(v1alpha2::ContainerMetadata {
                name: "web".to_string(),
                attempt: 2,
            }),
            image: Some(v1alpha2::ImageSpec {
                image: "nginx:latest".to_string(),
                annotations: HashMap::new(),
            }),
            image_ref: "sha256:aaa".to_string(),
            state: v1alpha2::ContainerState::ContainerRunning as i32,
            created_at: 7,
            ..Default::default()
        };

        let new: v1::Container = old.into();
        assert_eq!(new.id, "c1");
        assert_eq!(new.image_ref, "sha256:aaa");
        assert_eq!(new.state, v1::ContainerState::ContainerRunning as i32);
        assert_eq!(new.metadata.unwrap().attempt, 2);
        assert_eq!(new.image.unwrap().image, "nginx:latest");
    }

    #[test]
    fn test_container_upgrade_unknown_state() {
        let old = v1alpha2::Container {
            id: "c2".to_string(),
            state: 99,
            ..Default::default()
        };

        let new: v1::Container = old.into();
        assert_eq!(new.state, v1::ContainerState::ContainerUnknown as i32);
    }
}
