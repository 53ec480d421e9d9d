//! Kubernetes REST adapter for the engine ports.
//!
//! Talks to the API server directly over `reqwest`: Tekton runs and pipelines,
//! Argo CD applications, and persistent volume claims for build workspaces.
//! Watches use `?watch=true` and decode the newline-delimited event stream.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use url::Url;

use super::{
    tekton, EngineError, GitOpsApplication, GitOpsEngine, OwnerReference, Pipeline,
    PipelineEngine, PipelineRun, WorkspaceAllocator, WorkspaceClaim, WorkspaceRequest,
};
use crate::reconcile::watch::{EventStream, ResourceWatcher, WatchError, WatchEvent};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Clone, Debug)]
pub struct KubeRestConfig {
    /// API server base URL, e.g. `https://kubernetes.default.svc`.
    pub api_server: String,
    pub bearer_token: Option<String>,
    pub insecure_skip_tls_verify: bool,
    pub request_timeout: Duration,
}

impl KubeRestConfig {
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            bearer_token: None,
            insecure_skip_tls_verify: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn map_transport(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout(e.to_string())
    } else {
        EngineError::Transport(e.to_string())
    }
}

/// Pulls `message` out of a Kubernetes `Status` body, falling back to the raw text.
fn status_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).to_string())
}

#[derive(Clone)]
pub struct KubeRestClient {
    base: Url,
    client: reqwest::Client,
    config: KubeRestConfig,
}

impl KubeRestClient {
    pub fn new(config: KubeRestConfig) -> Result<Self, EngineError> {
        let base = Url::parse(&config.api_server)
            .map_err(|e| EngineError::Transport(format!("invalid api server url: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            base,
            client,
            config,
        })
    }

    fn url(&self, path: &str) -> Result<Url, EngineError> {
        self.base
            .join(path)
            .map_err(|e| EngineError::Transport(format!("invalid resource path {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<Response, EngineError> {
        let response = builder.send().await.map_err(map_transport)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.bytes().await.map_err(map_transport)?;
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        Err(EngineError::Api {
            status: status.as_u16(),
            message: status_message(&body),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
        kind: &'static str,
        name: &str,
    ) -> Result<T, EngineError> {
        let mut builder = self
            .request(method, self.url(path)?)
            .timeout(self.config.request_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = self.send(builder, kind, name).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::Decode(format!("{kind} {name}: {e}")))
    }

    /// Typed watcher over a namespaced collection path such as
    /// `/apis/tekton.dev/v1/namespaces/ci/taskruns`.
    pub fn watcher<K>(&self, kind: &'static str, collection_path: String) -> KubeWatcher<K> {
        KubeWatcher {
            client: self.clone(),
            kind,
            collection_path,
            _kind: PhantomData,
        }
    }

    pub fn pipeline_runs_path(namespace: &str) -> String {
        format!("/apis/tekton.dev/v1/namespaces/{namespace}/pipelineruns")
    }

    pub fn task_runs_path(namespace: &str) -> String {
        format!("/apis/tekton.dev/v1/namespaces/{namespace}/taskruns")
    }

    pub fn applications_path(namespace: &str) -> String {
        format!("/apis/argoproj.io/v1alpha1/namespaces/{namespace}/applications")
    }

    fn pipelines_path(namespace: &str) -> String {
        format!("/apis/tekton.dev/v1/namespaces/{namespace}/pipelines")
    }

    fn claims_path(namespace: &str) -> String {
        format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims")
    }
}

#[async_trait]
impl PipelineEngine for KubeRestClient {
    async fn submit_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun, EngineError> {
        let path = Self::pipeline_runs_path(&run.metadata.namespace);
        let created: PipelineRun = self
            .call(
                Method::POST,
                &path,
                Some(run),
                tekton::KIND_PIPELINE_RUN,
                &run.metadata.name,
            )
            .await?;
        tracing::info!(
            pipeline_run = %created.metadata.name,
            namespace = %created.metadata.namespace,
            "pipeline run submitted"
        );
        Ok(created)
    }

    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline, EngineError> {
        let path = format!("{}/{name}", Self::pipelines_path(namespace));
        self.call(
            Method::GET,
            &path,
            None::<&serde_json::Value>,
            tekton::KIND_PIPELINE,
            name,
        )
        .await
    }
}

#[async_trait]
impl WorkspaceAllocator for KubeRestClient {
    async fn allocate(&self, request: &WorkspaceRequest) -> Result<WorkspaceClaim, EngineError> {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": request.size}},
        });
        if let Some(class) = &request.storage_class {
            spec["storageClassName"] = json!(class);
        }
        let body = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"generateName": request.generate_name, "namespace": request.namespace},
            "spec": spec,
        });
        let created: serde_json::Value = self
            .call(
                Method::POST,
                &Self::claims_path(&request.namespace),
                Some(&body),
                "PersistentVolumeClaim",
                &request.generate_name,
            )
            .await?;
        let name = created
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::Decode("created claim has no name".to_string()))?;
        Ok(WorkspaceClaim {
            namespace: request.namespace.clone(),
            name: name.to_string(),
        })
    }

    async fn attach_owner(
        &self,
        claim: &WorkspaceClaim,
        owner: &OwnerReference,
    ) -> Result<(), EngineError> {
        let path = format!("{}/{}", Self::claims_path(&claim.namespace), claim.name);
        let patch = json!({"metadata": {"ownerReferences": [owner]}});
        let builder = self
            .request(Method::PATCH, self.url(&path)?)
            .timeout(self.config.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH)
            .body(patch.to_string());
        self.send(builder, "PersistentVolumeClaim", &claim.name)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GitOpsEngine for KubeRestClient {
    async fn create_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError> {
        let path = Self::applications_path(&app.metadata.namespace);
        self.call(
            Method::POST,
            &path,
            Some(app),
            super::argo::KIND_APPLICATION,
            &app.metadata.name,
        )
        .await
    }

    async fn update_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError> {
        let path = format!(
            "{}/{}",
            Self::applications_path(&app.metadata.namespace),
            app.metadata.name
        );
        let mut current: GitOpsApplication = self
            .call(
                Method::GET,
                &path,
                None::<&serde_json::Value>,
                super::argo::KIND_APPLICATION,
                &app.metadata.name,
            )
            .await?;
        current.spec = app.spec.clone();
        current.metadata.labels = app.metadata.labels.clone();
        current.metadata.annotations = app.metadata.annotations.clone();
        current.status = None;
        self.call(
            Method::PUT,
            &path,
            Some(&current),
            super::argo::KIND_APPLICATION,
            &app.metadata.name,
        )
        .await
    }
}

/// [ResourceWatcher] backed by a Kubernetes `?watch=true` request.
pub struct KubeWatcher<K> {
    client: KubeRestClient,
    kind: &'static str,
    collection_path: String,
    _kind: PhantomData<fn() -> K>,
}

#[async_trait]
impl<K> ResourceWatcher<K> for KubeWatcher<K>
where
    K: DeserializeOwned + Send + 'static,
{
    async fn watch(&self) -> Result<EventStream<K>, WatchError> {
        let mut url = self
            .client
            .url(&self.collection_path)
            .map_err(WatchError::Stream)?;
        url.query_pairs_mut().append_pair("watch", "true");
        let builder = self.client.request(Method::GET, url);
        let response = self
            .client
            .send(builder, self.kind, &self.collection_path)
            .await
            .map_err(WatchError::Stream)?;
        Ok(ndjson_events(self.kind, response))
    }
}

fn ndjson_events<K>(kind: &'static str, response: Response) -> EventStream<K>
where
    K: DeserializeOwned + Send + 'static,
{
    let mut chunks = response.bytes_stream();
    Box::pin(async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    yield Err(WatchError::Stream(map_transport(e)));
                    return;
                }
            }
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match WatchEvent::<K>::decode(kind, &line) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        }
        if let Ok(Some(event)) = WatchEvent::<K>::decode(kind, &buffer) {
            yield Ok(event);
        }
    })
}
