//! CriClient against an in-process runtime.
//!
//! The fake runtime serves only `runtime.v1alpha2` on a Unix socket in a
//! temp dir, like an older containerd would. Every `runtime.v1` call is
//! answered with `Unimplemented` by tonic's router.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imgsweep_node_agent::endpoint::Endpoint;
use imgsweep_node_agent::remover::remove_images;
use imgsweep_node_agent::{ApiVersion, CriClient, ImageRuntime};
use imgsweep_proto::runtime::v1alpha2;
use imgsweep_reconcile::{ContainerRecord, ExclusionList, ImageRecord, TargetSpec};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

#[derive(Debug, Default)]
struct FakeState {
    images: Vec<v1alpha2::Image>,
    containers: Vec<v1alpha2::Container>,
    /// Ids the runtime refuses to remove.
    busy: HashSet<String>,
    remove_calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    fn node() -> Self {
        let image = |id: &str, tag: &str, digest: &str| v1alpha2::Image {
            id: id.to_string(),
            repo_tags: vec![tag.to_string()],
            repo_digests: vec![digest.to_string()],
            size: 1024,
            ..Default::default()
        };

        let state = FakeState {
            images: vec![
                image("sha256:aaa", "nginx:latest", "docker.io/library/nginx@sha256:111"),
                image("sha256:bbb", "redis:latest", "docker.io/library/redis@sha256:222"),
                image("sha256:ccc", "caddy:latest", "docker.io/library/caddy@sha256:333"),
            ],
            containers: vec![
                v1alpha2::Container {
                    id: "web".to_string(),
                    image: Some(v1alpha2::ImageSpec {
                        image: "nginx:latest".to_string(),
                        ..Default::default()
                    }),
                    image_ref: "docker.io/library/nginx@sha256:111".to_string(),
                    state: v1alpha2::ContainerState::ContainerRunning.into(),
                    ..Default::default()
                },
                v1alpha2::Container {
                    id: "job".to_string(),
                    image_ref: "sha256:zzz".to_string(),
                    state: v1alpha2::ContainerState::ContainerExited.into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn busy(self, id: &str) -> Self {
        self.state.lock().unwrap().busy.insert(id.to_string());
        self
    }

    fn remove_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().remove_calls.clone()
    }

    fn image_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.images.iter().map(|i| i.id.clone()).collect()
    }
}

#[tonic::async_trait]
impl v1alpha2::RuntimeService for FakeRuntime {
    async fn version(
        &self,
        _request: Request<v1alpha2::VersionRequest>,
    ) -> Result<Response<v1alpha2::VersionResponse>, Status> {
        Ok(Response::new(v1alpha2::VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "fake".to_string(),
            runtime_version: "1.4.0".to_string(),
            runtime_api_version: "v1alpha2".to_string(),
        }))
    }

    async fn list_containers(
        &self,
        _request: Request<v1alpha2::ListContainersRequest>,
    ) -> Result<Response<v1alpha2::ListContainersResponse>, Status> {
        let containers = self.state.lock().unwrap().containers.clone();
        Ok(Response::new(v1alpha2::ListContainersResponse { containers }))
    }
}

#[tonic::async_trait]
impl v1alpha2::ImageService for FakeRuntime {
    async fn list_images(
        &self,
        _request: Request<v1alpha2::ListImagesRequest>,
    ) -> Result<Response<v1alpha2::ListImagesResponse>, Status> {
        let images = self.state.lock().unwrap().images.clone();
        Ok(Response::new(v1alpha2::ListImagesResponse { images }))
    }

    async fn remove_image(
        &self,
        request: Request<v1alpha2::RemoveImageRequest>,
    ) -> Result<Response<v1alpha2::RemoveImageResponse>, Status> {
        let id = request.into_inner().image.map(|spec| spec.image).unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        state.remove_calls.push(id.clone());

        if state.busy.contains(&id) {
            return Err(Status::failed_precondition(format!("image {id} is in use")));
        }
        let before = state.images.len();
        state.images.retain(|image| image.id != id);
        if state.images.len() == before {
            return Err(Status::not_found(format!("no such image: {id}")));
        }
        Ok(Response::new(v1alpha2::RemoveImageResponse {}))
    }
}

async fn serve(dir: &Path, runtime: FakeRuntime) -> PathBuf {
    let socket = dir.join("cri.sock");
    let incoming = UnixListenerStream::new(UnixListener::bind(&socket).unwrap());

    tokio::spawn(
        Server::builder()
            .add_service(v1alpha2::RuntimeServiceServer::new(runtime.clone()))
            .add_service(v1alpha2::ImageServiceServer::new(runtime))
            .serve_with_incoming(incoming),
    );
    socket
}

async fn connect(runtime: FakeRuntime) -> (TempDir, CriClient) {
    let dir = TempDir::new().unwrap();
    let socket = serve(dir.path(), runtime).await;
    let client = CriClient::connect(&Endpoint::Unix(socket), Duration::from_secs(5))
        .await
        .unwrap();
    (dir, client)
}

#[tokio::test]
async fn test_negotiates_v1alpha2_runtime() {
    let (_dir, client) = connect(FakeRuntime::node()).await;
    assert_eq!(client.api_version(), ApiVersion::V1Alpha2);
}

#[tokio::test]
async fn test_v1alpha2_images_come_back_unified() {
    let (_dir, client) = connect(FakeRuntime::node()).await;

    let images = client.list_images().await.unwrap();

    assert_eq!(
        images,
        vec![
            ImageRecord::new("sha256:aaa")
                .with_name("nginx:latest")
                .with_digest("docker.io/library/nginx@sha256:111"),
            ImageRecord::new("sha256:bbb")
                .with_name("redis:latest")
                .with_digest("docker.io/library/redis@sha256:222"),
            ImageRecord::new("sha256:ccc")
                .with_name("caddy:latest")
                .with_digest("docker.io/library/caddy@sha256:333"),
        ]
    );
}

#[tokio::test]
async fn test_v1alpha2_containers_come_back_unified() {
    let (_dir, client) = connect(FakeRuntime::node()).await;

    let containers = client.list_containers().await.unwrap();

    assert_eq!(
        containers,
        vec![
            ContainerRecord::new("web", "nginx:latest"),
            ContainerRecord::new("job", "sha256:zzz"),
        ]
    );
}

#[tokio::test]
async fn test_delete_empty_id_sends_nothing() {
    let runtime = FakeRuntime::node();
    let (_dir, client) = connect(runtime.clone()).await;

    client.delete_image("").await.unwrap();

    assert!(runtime.remove_calls().is_empty());
    assert_eq!(runtime.image_ids().len(), 3);
}

#[tokio::test]
async fn test_delete_of_missing_image_succeeds() {
    let runtime = FakeRuntime::node();
    let (_dir, client) = connect(runtime.clone()).await;

    client.delete_image("sha256:gone").await.unwrap();

    assert_eq!(runtime.remove_calls(), vec!["sha256:gone"]);
}

#[tokio::test]
async fn test_delete_twice_is_idempotent() {
    let runtime = FakeRuntime::node();
    let (_dir, client) = connect(runtime.clone()).await;

    client.delete_image("sha256:bbb").await.unwrap();
    client.delete_image("sha256:bbb").await.unwrap();

    assert_eq!(runtime.image_ids(), vec!["sha256:aaa", "sha256:ccc"]);
    assert_eq!(runtime.remove_calls().len(), 2);
}

#[tokio::test]
async fn test_refused_delete_is_a_runtime_error() {
    let runtime = FakeRuntime::node().busy("sha256:ccc");
    let (_dir, client) = connect(runtime).await;

    let err = client.delete_image("sha256:ccc").await.unwrap_err();

    assert!(err.is_runtime_refusal());
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_prune_through_v1alpha2_runtime() {
    let runtime = FakeRuntime::node();
    let (_dir, client) = connect(runtime.clone()).await;

    let report = remove_images(&client, &TargetSpec::prune_all(), &ExclusionList::default())
        .await
        .unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(runtime.image_ids(), vec!["sha256:aaa"]);
}
