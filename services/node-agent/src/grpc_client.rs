//! CRI client over gRPC.
//!
//! The runtime is probed once at connect time with `Version` on each
//! supported API version, newest first. The first version that answers is
//! used for every later call; v1alpha2 responses are upgraded into v1 shapes
//! before they become [`ImageRecord`]s and [`ContainerRecord`]s, so nothing
//! past this module knows which version was negotiated.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use imgsweep_proto::runtime::{v1, v1alpha2};
use imgsweep_reconcile::{ContainerRecord, ImageRecord, KeyedLocker};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as ChannelEndpoint, Uri};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::runtime::{ImageRuntime, ProbeFailure, RuntimeError};

/// Placeholder authority for Unix socket channels; the connector ignores it.
const UNIX_CHANNEL_URI: &str = "http://[::]:50051";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// CRI API versions, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V1Alpha2,
}

impl ApiVersion {
    pub const PREFERENCE: [ApiVersion; 2] = [ApiVersion::V1, ApiVersion::V1Alpha2];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V1Alpha2 => "v1alpha2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Try each API version in preference order and keep the first that
/// answers the probe.
pub async fn negotiate<F, Fut, T>(mut probe: F) -> Result<(ApiVersion, T), RuntimeError>
where
    F: FnMut(ApiVersion) -> Fut,
    Fut: Future<Output = Result<T, tonic::Status>>,
{
    let mut failures = Vec::new();

    for version in ApiVersion::PREFERENCE {
        match probe(version).await {
            Ok(answer) => return Ok((version, answer)),
            Err(status) => {
                debug!(
                    api_version = %version,
                    code = ?status.code(),
                    error = %status.message(),
                    "CRI version probe failed"
                );
                failures.push(ProbeFailure { version, status });
            }
        }
    }

    Err(RuntimeError::Negotiation { failures })
}

#[derive(Debug, Clone)]
enum Adapter {
    V1 {
        runtime: v1::RuntimeServiceClient<Channel>,
        images: v1::ImageServiceClient<Channel>,
    },
    V1Alpha2 {
        runtime: v1alpha2::RuntimeServiceClient<Channel>,
        images: v1alpha2::ImageServiceClient<Channel>,
    },
}

impl Adapter {
    fn new(version: ApiVersion, channel: Channel) -> Self {
        match version {
            ApiVersion::V1 => Adapter::V1 {
                runtime: v1::RuntimeServiceClient::new(channel.clone()),
                images: v1::ImageServiceClient::new(channel),
            },
            ApiVersion::V1Alpha2 => Adapter::V1Alpha2 {
                runtime: v1alpha2::RuntimeServiceClient::new(channel.clone()),
                images: v1alpha2::ImageServiceClient::new(channel),
            },
        }
    }
}

/// CRI client bound to one negotiated API version.
#[derive(Debug)]
pub struct CriClient {
    api_version: ApiVersion,
    adapter: Adapter,
    /// Serializes concurrent deletes of the same id.
    deletes: KeyedLocker,
}

impl CriClient {
    /// Connect to `endpoint` and negotiate an API version.
    ///
    /// `timeout` bounds every RPC issued through the client.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, RuntimeError> {
        let channel = connect_channel(endpoint, timeout)?;

        let (api_version, reported) = negotiate(|version| {
            let channel = channel.clone();
            async move { probe_version(channel, version).await }
        })
        .await?;

        info!(
            endpoint = %endpoint,
            api_version = %api_version,
            runtime_name = %reported.runtime_name,
            runtime_version = %reported.runtime_version,
            runtime_api_version = %reported.runtime_api_version,
            "Connected to container runtime"
        );

        Ok(Self {
            api_version,
            adapter: Adapter::new(api_version, channel),
            deletes: KeyedLocker::new(),
        })
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        match &self.adapter {
            Adapter::V1 { images, .. } => {
                let request = v1::RemoveImageRequest {
                    image: Some(v1::ImageSpec {
                        image: id.to_string(),
                        ..Default::default()
                    }),
                };
                images
                    .clone()
                    .remove_image(request)
                    .await
                    .map_err(|status| RuntimeError::rpc("RemoveImage", status))?;
            }
            Adapter::V1Alpha2 { images, .. } => {
                let request = v1alpha2::RemoveImageRequest {
                    image: Some(v1alpha2::ImageSpec {
                        image: id.to_string(),
                        ..Default::default()
                    }),
                };
                images
                    .clone()
                    .remove_image(request)
                    .await
                    .map_err(|status| RuntimeError::rpc("RemoveImage", status))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageRuntime for CriClient {
    async fn list_images(&self) -> Result<Vec<ImageRecord>, RuntimeError> {
        let images: Vec<v1::Image> = match &self.adapter {
            Adapter::V1 { images, .. } => {
                images
                    .clone()
                    .list_images(v1::ListImagesRequest { filter: None })
                    .await
                    .map_err(|status| RuntimeError::rpc("ListImages", status))?
                    .into_inner()
                    .images
            }
            Adapter::V1Alpha2 { images, .. } => images
                .clone()
                .list_images(v1alpha2::ListImagesRequest { filter: None })
                .await
                .map_err(|status| RuntimeError::rpc("ListImages", status))?
                .into_inner()
                .images
                .into_iter()
                .map(v1::Image::from)
                .collect(),
        };

        debug!(count = images.len(), "Listed images");
        Ok(images.into_iter().map(image_record).collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let containers: Vec<v1::Container> = match &self.adapter {
            Adapter::V1 { runtime, .. } => {
                runtime
                    .clone()
                    .list_containers(v1::ListContainersRequest { filter: None })
                    .await
                    .map_err(|status| RuntimeError::rpc("ListContainers", status))?
                    .into_inner()
                    .containers
            }
            Adapter::V1Alpha2 { runtime, .. } => runtime
                .clone()
                .list_containers(v1alpha2::ListContainersRequest { filter: None })
                .await
                .map_err(|status| RuntimeError::rpc("ListContainers", status))?
                .into_inner()
                .containers
                .into_iter()
                .map(v1::Container::from)
                .collect(),
        };

        debug!(count = containers.len(), "Listed containers");
        Ok(containers.into_iter().map(container_record).collect())
    }

    async fn delete_image(&self, id: &str) -> Result<(), RuntimeError> {
        // An empty selector means "everything" to some runtimes.
        if id.is_empty() {
            return Ok(());
        }

        self.deletes.lock(id).await;
        let _held = HeldKey {
            locker: &self.deletes,
            key: id,
        };

        absorb_not_found(id, self.remove_image(id).await)
    }
}

/// Releases a key taken on a [`KeyedLocker`] when dropped.
struct HeldKey<'a> {
    locker: &'a KeyedLocker,
    key: &'a str,
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        self.locker.unlock(self.key);
    }
}

/// Deleting an image that is already gone is a success.
pub fn absorb_not_found(id: &str, result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(err) if err.is_not_found() => {
            debug!(image_id = %id, "Image already removed");
            Ok(())
        }
        other => other,
    }
}

/// Build a lazily connecting channel.
///
/// Nothing is dialed here, so an unreachable runtime surfaces as a failed
/// `Version` probe for each API version.
fn connect_channel(endpoint: &Endpoint, timeout: Duration) -> Result<Channel, RuntimeError> {
    let connect_err = |source: tonic::transport::Error| RuntimeError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };

    match endpoint {
        Endpoint::Tcp(addr) => Ok(ChannelEndpoint::from_shared(format!("http://{addr}"))
            .map_err(connect_err)?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .connect_lazy()),
        Endpoint::Unix(path) => {
            let path = path.clone();
            Ok(ChannelEndpoint::from_static(UNIX_CHANNEL_URI)
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(timeout)
                .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                })))
        }
    }
}

async fn probe_version(
    channel: Channel,
    version: ApiVersion,
) -> Result<v1::VersionResponse, tonic::Status> {
    match version {
        ApiVersion::V1 => {
            let response = v1::RuntimeServiceClient::new(channel)
                .version(v1::VersionRequest::default())
                .await?;
            Ok(response.into_inner())
        }
        ApiVersion::V1Alpha2 => {
            let response = v1alpha2::RuntimeServiceClient::new(channel)
                .version(v1alpha2::VersionRequest::default())
                .await?;
            Ok(response.into_inner().into())
        }
    }
}

fn image_record(image: v1::Image) -> ImageRecord {
    ImageRecord {
        id: image.id,
        names: image.repo_tags,
        digests: image.repo_digests,
    }
}

/// The container's image reference is the string it was created from,
/// falling back to the resolved `image_ref` when the spec is missing.
fn container_record(container: v1::Container) -> ContainerRecord {
    let image_ref = container
        .image
        .map(|spec| spec.image)
        .filter(|image| !image.is_empty())
        .unwrap_or(container.image_ref);
    ContainerRecord::new(container.id, image_ref)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn test_negotiate_prefers_v1() {
        let mut probed = Vec::new();
        let (version, answer) = negotiate(|version| {
            probed.push(version);
            async move { Ok::<_, tonic::Status>(version.as_str()) }
        })
        .await
        .unwrap();

        assert_eq!(version, ApiVersion::V1);
        assert_eq!(answer, "v1");
        assert_eq!(probed, vec![ApiVersion::V1]);
    }

    #[tokio::test]
    async fn test_negotiate_falls_back_to_v1alpha2() {
        let (version, _) = negotiate(|version| async move {
            match version {
                ApiVersion::V1 => Err(tonic::Status::unimplemented(
                    "unknown service runtime.v1.RuntimeService",
                )),
                ApiVersion::V1Alpha2 => Ok(()),
            }
        })
        .await
        .unwrap();

        assert_eq!(version, ApiVersion::V1Alpha2);
    }

    #[tokio::test]
    async fn test_negotiate_collects_every_failure() {
        let err = negotiate(|version| async move {
            Err::<(), _>(tonic::Status::unavailable(format!("{version} down")))
        })
        .await
        .unwrap_err();

        let failures = match err {
            RuntimeError::Negotiation { failures } => failures,
            other => panic!("expected negotiation error, got {other:?}"),
        };
        let versions: Vec<_> = failures.iter().map(|f| f.version).collect();
        assert_eq!(versions, ApiVersion::PREFERENCE);
    }

    fn v1_image() -> v1::Image {
        v1::Image {
            id: "sha256:aaa".to_string(),
            repo_tags: vec!["nginx:latest".to_string()],
            repo_digests: vec!["docker.io/library/nginx@sha256:111".to_string()],
            size: 1024,
            ..Default::default()
        }
    }

    fn v1alpha2_image() -> v1alpha2::Image {
        v1alpha2::Image {
            id: "sha256:aaa".to_string(),
            repo_tags: vec!["nginx:latest".to_string()],
            repo_digests: vec!["docker.io/library/nginx@sha256:111".to_string()],
            size: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_image_records_match_across_versions() {
        let from_v1 = image_record(v1_image());
        let from_v1alpha2 = image_record(v1alpha2_image().into());

        assert_eq!(from_v1, from_v1alpha2);
        assert_eq!(from_v1.names, vec!["nginx:latest"]);
        assert_eq!(from_v1.digests, vec!["docker.io/library/nginx@sha256:111"]);
    }

    #[test]
    fn test_container_records_match_across_versions() {
        let v1_container = v1::Container {
            id: "c1".to_string(),
            image: Some(v1::ImageSpec {
                image: "sha256:aaa".to_string(),
                ..Default::default()
            }),
            image_ref: "docker.io/library/nginx@sha256:111".to_string(),
            state: v1::ContainerState::ContainerRunning.into(),
            labels: HashMap::new(),
            ..Default::default()
        };
        let v1alpha2_container = v1alpha2::Container {
            id: "c1".to_string(),
            image: Some(v1alpha2::ImageSpec {
                image: "sha256:aaa".to_string(),
                ..Default::default()
            }),
            image_ref: "docker.io/library/nginx@sha256:111".to_string(),
            state: v1alpha2::ContainerState::ContainerRunning.into(),
            ..Default::default()
        };

        assert_eq!(
            container_record(v1_container),
            container_record(v1alpha2_container.into())
        );
    }

    #[test]
    fn test_container_without_spec_uses_image_ref() {
        let container = v1::Container {
            id: "c1".to_string(),
            image_ref: "redis:latest".to_string(),
            ..Default::default()
        };
        assert_eq!(container_record(container).image_ref, "redis:latest");
    }

    #[tokio::test]
    async fn test_missing_socket_fails_every_probe() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("absent.sock"));

        let err = CriClient::connect(&endpoint, Duration::from_secs(5))
            .await
            .unwrap_err();

        let failures = match err {
            RuntimeError::Negotiation { failures } => failures,
            other => panic!("expected negotiation error, got {other:?}"),
        };
        let versions: Vec<_> = failures.iter().map(|f| f.version).collect();
        assert_eq!(versions, ApiVersion::PREFERENCE);
    }

    #[test]
    fn test_absorb_not_found() {
        let not_found = Err(RuntimeError::rpc(
            "RemoveImage",
            tonic::Status::not_found("no such image"),
        ));
        assert!(absorb_not_found("sha256:gone", not_found).is_ok());

        let refused = Err(RuntimeError::rpc(
            "RemoveImage",
            tonic::Status::failed_precondition("image in use"),
        ));
        assert!(absorb_not_found("sha256:busy", refused).is_err());
    }
}
