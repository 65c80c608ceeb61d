//! Reflection-backed debug UI at `/debug`
//!
//! Services and methods are read live from the reflection service over the
//! self channel, exactly as an external client would see them.

use crate::loopback::{SelfChannel, MAX_DECODING_MESSAGE_SIZE};
use crate::routes::HttpRoutes;
use crate::supervisor::MountTask;
use askama::Template;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use prost::Message;
use prost_types::FileDescriptorProto;
use serde::Serialize;
use std::sync::Arc;
use superservice_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;
use tracing::{error, info};

/// Mount prefix of the debug UI
pub(crate) const PREFIX: &str = "/debug";

/// An RPC service as seen through reflection
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceDescription {
    /// Fully qualified service name
    pub name: String,
    /// Methods, empty when no descriptor was found
    pub methods: Vec<MethodDescription>,
}

/// An RPC method
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MethodDescription {
    /// Method name
    pub name: String,
    /// Fully qualified request message
    pub input_type: String,
    /// Fully qualified response message
    pub output_type: String,
    /// Client sends a stream
    pub client_streaming: bool,
    /// Server sends a stream
    pub server_streaming: bool,
}

impl MethodDescription {
    /// Streaming kind, for display
    pub fn streaming(&self) -> &'static str {
        match (self.client_streaming, self.server_streaming) {
            (false, false) => "unary",
            (true, false) => "client",
            (false, true) => "server",
            (true, true) => "bidi",
        }
    }
}

struct HtmlTemplate<T>(T);

impl<T> IntoResponse for HtmlTemplate<T>
where
    T: Template,
{
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {err}"),
            )
                .into_response(),
        }
    }
}

#[derive(Template)]
#[template(path = "debug_ui.html")]
struct DebugTemplate {
    title: String,
    target: String,
    services: Vec<ServiceDescription>,
}

async fn reflect(channel: Channel, requests: Vec<MessageRequest>) -> Result<Vec<MessageResponse>> {
    let mut client = ServerReflectionClient::new(channel).max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE);

    let requests: Vec<ServerReflectionRequest> = requests
        .into_iter()
        .map(|request| ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        })
        .collect();

    let mut responses = client
        .server_reflection_info(futures::stream::iter(requests))
        .await
        .map_err(|status| Error::Transport(format!("reflection: {status}")))?
        .into_inner();

    let mut messages = Vec::new();
    while let Some(response) = responses.next().await {
        let response = response.map_err(|status| Error::Transport(format!("reflection: {status}")))?;
        match response.message_response {
            Some(MessageResponse::ErrorResponse(e)) => {
                return Err(Error::Transport(format!("reflection: {}", e.error_message)));
            }
            Some(message) => messages.push(message),
            None => {}
        }
    }
    Ok(messages)
}

/// Methods of `service` if one of the descriptors defines it
fn describe(service: &str, descriptors: &[FileDescriptorProto]) -> Option<ServiceDescription> {
    descriptors.iter().find_map(|file| {
        file.service.iter().find_map(|candidate| {
            let qualified = match file.package() {
                "" => candidate.name().to_string(),
                package => format!("{package}.{}", candidate.name()),
            };
            (qualified == service).then(|| ServiceDescription {
                name: qualified,
                methods: candidate
                    .method
                    .iter()
                    .map(|method| MethodDescription {
                        name: method.name().to_string(),
                        input_type: method.input_type().trim_start_matches('.').to_string(),
                        output_type: method.output_type().trim_start_matches('.').to_string(),
                        client_streaming: method.client_streaming(),
                        server_streaming: method.server_streaming(),
                    })
                    .collect(),
            })
        })
    })
}

/// Every service the RPC server exposes, sorted by name
pub async fn describe_services(channel: Channel) -> Result<Vec<ServiceDescription>> {
    let listed = reflect(channel.clone(), vec![MessageRequest::ListServices(String::new())]).await?;
    let mut names: Vec<String> = listed
        .into_iter()
        .filter_map(|message| match message {
            MessageResponse::ListServicesResponse(list) => Some(list.service),
            _ => None,
        })
        .flatten()
        .map(|service| service.name)
        .collect();
    names.sort();

    let requests = names
        .iter()
        .map(|name| MessageRequest::FileContainingSymbol(name.clone()))
        .collect();
    let descriptors: Vec<FileDescriptorProto> = reflect(channel, requests)
        .await?
        .into_iter()
        .filter_map(|message| match message {
            MessageResponse::FileDescriptorResponse(files) => Some(files.file_descriptor_proto),
            _ => None,
        })
        .flatten()
        .filter_map(|bytes| FileDescriptorProto::decode(bytes.as_slice()).ok())
        .collect();

    Ok(names
        .into_iter()
        .map(|name| {
            describe(&name, &descriptors).unwrap_or(ServiceDescription {
                name,
                methods: Vec::new(),
            })
        })
        .collect())
}

#[derive(Clone)]
struct UiState {
    loopback: SelfChannel,
    title: Arc<str>,
    target: Arc<str>,
}

fn closed() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "self connection closed").into_response()
}

async fn index(State(state): State<UiState>) -> Response {
    let Some(channel) = state.loopback.get() else {
        return closed();
    };
    match describe_services(channel).await {
        Ok(services) => HtmlTemplate(DebugTemplate {
            title: state.title.to_string(),
            target: state.target.to_string(),
            services,
        })
        .into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn services(State(state): State<UiState>) -> Response {
    let Some(channel) = state.loopback.get() else {
        return closed();
    };
    match describe_services(channel).await {
        Ok(services) => Json(services).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

/// Debug UI routes at their full paths. The self channel is fetched per
/// request, so the UI stops answering once it is closed.
pub(crate) fn router(loopback: SelfChannel, title: &str, target: &str) -> Router {
    let state = UiState {
        loopback,
        title: Arc::from(title),
        target: Arc::from(target),
    };

    Router::new()
        .route(PREFIX, get(index))
        .route("/debug/", get(index))
        .route("/debug/api/services", get(services))
        .with_state(state)
}

/// Mount task: checks reflection, mounts the UI, then waits for cancellation.
/// A failed reflection call is logged and the UI is left unmounted.
pub(crate) fn ui_task(routes: Arc<HttpRoutes>, loopback: SelfChannel, title: String) -> MountTask {
    MountTask::new("ui", move |token: CancellationToken, addr| async move {
        let target = format!("127.0.0.1:{}", addr.port());

        match loopback.get() {
            Some(channel) => {
                let mounted = match describe_services(channel.clone()).await {
                    Ok(services) => routes
                        .mount(PREFIX, router(loopback.clone(), &title, &target))
                        .map(|()| services.len()),
                    Err(e) => Err(e),
                };
                match mounted {
                    Ok(count) => info!(services = count, address = %format!("http://{target}{PREFIX}"), "Mounted grpc debug ui"),
                    Err(e) => error!(error = %e, "Mount grpcui"),
                }
            }
            None => error!("Mount grpcui: self connection closed"),
        }

        token.cancelled().await;
        Ok(())
    })
}
