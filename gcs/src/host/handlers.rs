//! Handler catalogue: wires every [`RpcId`] to a [`Bridge`] handler
//! that decodes its typed request, calls into
//! [`Host`]/[`Container`]/[`Process`], and re-encodes the typed
//! response. Kept as one registration function rather than scattering
//! `assign_handler` calls across the binary.

use std::sync::Arc;
use std::time::Duration;

use gcs_shared::protocol::{
    ContainerNotification, CreateRequest, CreateResponse, DeleteContainerStateRequest,
    DeleteContainerStateResponse, DumpStacksRequest, DumpStacksResponse, ExecuteProcessRequest,
    ExecuteProcessResponse, GetPropertiesRequest, GetPropertiesResponse,
    LifecycleNotificationRequest, LifecycleNotificationResponse, ModifySettingsRequest,
    ModifySettingsResponse, NegotiateProtocolRequest, NegotiateProtocolResponse, NotifyId,
    PropertyType, ResizeConsoleRequest, ResizeConsoleResponse, ResponseBase, RpcId,
    SignalProcessRequest, SignalProcessResponse, StartRequest, StartResponse, UpdateContainerRequest,
    UpdateContainerResponse, WaitForProcessRequest, WaitForProcessResponse, PROTOCOL_VERSION,
    UVM_CONTAINER_ID,
};
use gcs_shared::{GcsError, GcsResult};

use crate::bridge::{Bridge, HandlerCtx, HandlerResult};
use crate::runtime::StdioOptions;

use super::Host;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Registers every RPC handler against `bridge`.
pub async fn register_handlers(host: Arc<Host>, bridge: Bridge) {
    {
        let bridge = bridge.clone();
        bridge
            .assign_handler(
                RpcId::NegotiateProtocol,
                Arc::new(move |ctx| Box::pin(negotiate_protocol(ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(RpcId::Create, Arc::new(move |ctx| Box::pin(create(host.clone(), ctx))))
            .await;
    }
    {
        let host = host.clone();
        let bridge = bridge.clone();
        bridge
            .assign_handler(
                RpcId::Start,
                Arc::new(move |ctx| Box::pin(start(host.clone(), bridge.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::ShutdownGraceful,
                Arc::new(move |ctx| Box::pin(shutdown(host.clone(), ctx, SIGTERM))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::ShutdownForced,
                Arc::new(move |ctx| Box::pin(shutdown(host.clone(), ctx, SIGKILL))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::ExecuteProcess,
                Arc::new(move |ctx| Box::pin(execute_process(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::WaitForProcess,
                Arc::new(move |ctx| Box::pin(wait_for_process(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::SignalProcess,
                Arc::new(move |ctx| Box::pin(signal_process(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::ResizeConsole,
                Arc::new(move |ctx| Box::pin(resize_console(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::GetProperties,
                Arc::new(move |ctx| Box::pin(get_properties(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::ModifySettings,
                Arc::new(move |ctx| Box::pin(modify_settings(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(RpcId::DumpStacks, Arc::new(move |ctx| Box::pin(dump_stacks(host.clone(), ctx))))
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::DeleteContainerState,
                Arc::new(move |ctx| Box::pin(delete_container_state(host.clone(), ctx))),
            )
            .await;
    }
    {
        let host = host.clone();
        bridge
            .assign_handler(
                RpcId::UpdateContainer,
                Arc::new(move |ctx| Box::pin(update_container(host.clone(), ctx))),
            )
            .await;
    }
    bridge
        .assign_handler(
            RpcId::LifecycleNotification,
            Arc::new(move |ctx| Box::pin(lifecycle_notification(ctx))),
        )
        .await;
}

fn decode<T: serde::de::DeserializeOwned>(ctx: &HandlerCtx) -> GcsResult<T> {
    serde_json::from_value(ctx.payload.clone()).map_err(|e| GcsError::Invalid(format!("malformed request: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> GcsResult<HandlerResult> {
    serde_json::to_value(value)
        .map(HandlerResult::new)
        .map_err(|e| GcsError::Invalid(format!("failed to encode response: {e}")))
}

async fn negotiate_protocol(ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: NegotiateProtocolRequest = decode(&ctx)?;
    if request.min_version != 0 || request.max_version != 0 {
        let version = PROTOCOL_VERSION as u32;
        if version < request.min_version || version > request.max_version {
            return Err(GcsError::Unsupported(format!(
                "no protocol version in [{}, {}] is supported (have {version})",
                request.min_version, request.max_version
            )));
        }
    }
    encode(&NegotiateProtocolResponse {
        base: ResponseBase::ok(ctx.activity_id),
        version: PROTOCOL_VERSION as u32,
        capabilities: gcs_shared::protocol::Capabilities {
            send_host_create_message: false,
            send_host_start_message: false,
            supports_vsock: true,
        },
    })
}

async fn create(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: CreateRequest = decode(&ctx)?;
    let id = if request.container_id.is_empty() {
        ctx.container_id.clone()
    } else {
        request.container_id
    };
    host.create_container(id, request.settings, request.vsock_stdio_relay_settings)
        .await?;
    encode(&CreateResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn start(host: Arc<Host>, bridge: Bridge, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let _request: StartRequest = decode(&ctx)?;
    let container = host.get_container(&ctx.container_id).await?;
    container.start(StdioOptions::default()).await?;

    let watched = container.clone();
    tokio::spawn(async move {
        let exit_type = watched.wait().await;
        let notification = ContainerNotification {
            exit_type,
            operation: "Shutdown".to_string(),
            result: 0,
            result_info: String::new(),
        };
        if let Ok(payload) = serde_json::to_value(&notification) {
            if let Err(e) = bridge.emit(NotifyId::Container, payload) {
                tracing::warn!(error = %e, "failed to emit container notification");
            }
        }
    });

    encode(&StartResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

/// ShutdownGraceful/ShutdownForced: the reserved UVM id triggers the
/// VM-wide poweroff; any other id maps to `Kill(signal)` on that
/// container.
async fn shutdown(host: Arc<Host>, ctx: HandlerCtx, signal: i32) -> GcsResult<HandlerResult> {
    if ctx.container_id == UVM_CONTAINER_ID {
        host.shutdown(&ctx.container_id).await?;
    } else {
        let container = host.get_container(&ctx.container_id).await?;
        container.kill(signal).await?;
    }
    encode(&ResponseBase::ok(ctx.activity_id))
}

async fn execute_process(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: ExecuteProcessRequest = decode(&ctx)?;
    let stdio = StdioOptions {
        terminal: request
            .settings
            .process_parameters
            .get("Terminal")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        open_stdin: request.settings.vsock_stdio_relay_settings.std_in != 0,
        open_stdout: request.settings.vsock_stdio_relay_settings.std_out != 0,
        open_stderr: request.settings.vsock_stdio_relay_settings.std_err != 0,
    };

    let process_id = if ctx.container_id.is_empty() || ctx.container_id == UVM_CONTAINER_ID {
        host.spawn_external_process(request.settings.process_parameters).await?
    } else {
        let container = host.get_container(&ctx.container_id).await?;
        container
            .exec_process(
                request.settings.process_parameters,
                stdio,
                request.settings.vsock_stdio_relay_settings,
            )
            .await?
    };

    encode(&ExecuteProcessResponse {
        base: ResponseBase::ok(ctx.activity_id),
        process_id,
    })
}

async fn wait_for_process(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: WaitForProcessRequest = decode(&ctx)?;

    if !ctx.container_id.is_empty() && ctx.container_id != UVM_CONTAINER_ID {
        let container = host.get_container(&ctx.container_id).await?;
        let process = container.get_process(request.process_id).await?;
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        if request.timeout_in_ms > 0 {
            let timeout = Duration::from_millis(request.timeout_in_ms as u64);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = cancel_tx.send(());
            });
        }
        let wait_handle = process.wait().await;
        return match wait_handle.deliver(cancel_rx).await {
            (crate::process::WaitOutcome::Delivered(exit_code), ack) => {
                let payload = serde_json::to_value(&WaitForProcessResponse {
                    base: ResponseBase::ok(ctx.activity_id),
                    exit_code,
                })
                .map_err(|e| GcsError::Invalid(format!("failed to encode response: {e}")))?;
                // The writers_wg slot this process holds for us must
                // outlive the wire write below, or a crash between
                // releasing it and the write actually landing loses the
                // exit code irrecoverably; ack only once the bridge has
                // attempted to write the response.
                Ok(HandlerResult::with_after_write(payload, async move {
                    ack.ack().await;
                }))
            }
            (crate::process::WaitOutcome::Cancelled, ack) => {
                ack.ack().await;
                Err(GcsError::Busy(format!(
                    "WaitForProcess timed out after {}ms",
                    request.timeout_in_ms
                )))
            }
        };
    }

    let exit_code = host.wait_external_process(request.process_id).await?;
    encode(&WaitForProcessResponse {
        base: ResponseBase::ok(ctx.activity_id),
        exit_code,
    })
}

async fn signal_process(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: SignalProcessRequest = decode(&ctx)?;
    if !ctx.container_id.is_empty() && ctx.container_id != UVM_CONTAINER_ID {
        let container = host.get_container(&ctx.container_id).await?;
        container.signal_process(request.process_id, request.signal).await?;
    } else {
        host.signal_external_process(request.process_id, request.signal).await?;
    }
    encode(&SignalProcessResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn resize_console(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: ResizeConsoleRequest = decode(&ctx)?;
    let container = host.get_container(&ctx.container_id).await?;
    let process = container.get_process(request.process_id).await?;
    process.resize_console(request.height, request.width).await?;
    encode(&ResizeConsoleResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn get_properties(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: GetPropertiesRequest = decode(&ctx)?;
    let container = host.get_container(&ctx.container_id).await?;

    let mut properties = serde_json::Map::new();
    for property_type in &request.property_types {
        match property_type {
            PropertyType::ProcessList => {
                let mut pids = vec![container.init_pid()];
                pids.extend(container.process_pids().await);
                let list: Vec<_> = pids.into_iter().map(|pid| serde_json::json!({"ProcessId": pid})).collect();
                properties.insert("ProcessList".to_string(), serde_json::Value::Array(list));
            }
            PropertyType::Statistics => {
                properties.insert("Statistics".to_string(), container.stats().await?);
            }
        }
    }

    encode(&GetPropertiesResponse {
        base: ResponseBase::ok(ctx.activity_id),
        properties: serde_json::Value::Object(properties),
    })
}

/// ModifySettings: the reserved UVM container id gets host-wide resource
/// changes; any other id is a container-scoped change, applied against
/// that container's own mount/network state.
async fn modify_settings(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let mut request: ModifySettingsRequest = decode(&ctx)?;
    if request.container_id.is_empty() {
        request.container_id = ctx.container_id.clone();
    }
    if request.container_id == UVM_CONTAINER_ID {
        host.modify_host_settings(request).await?;
    } else {
        let container_id = request.container_id.clone();
        host.modify_container_settings(&container_id, request).await?;
    }
    encode(&ModifySettingsResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn dump_stacks(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let _request: DumpStacksRequest = decode(&ctx)?;
    let pids = host.get_all_process_pids().await?;
    let backtrace = std::backtrace::Backtrace::force_capture();
    let guest_stacks = format!("live pids: {pids:?}\n\n{backtrace}");
    encode(&DumpStacksResponse {
        base: ResponseBase::ok(ctx.activity_id),
        guest_stacks,
    })
}

async fn delete_container_state(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: DeleteContainerStateRequest = decode(&ctx)?;
    let id = if request.container_id.is_empty() {
        ctx.container_id.clone()
    } else {
        request.container_id
    };
    host.delete_container_state(&id).await?;
    encode(&DeleteContainerStateResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn update_container(host: Arc<Host>, ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: UpdateContainerRequest = decode(&ctx)?;
    let container = host.get_container(&ctx.container_id).await?;
    container.update(request.resources).await?;
    encode(&UpdateContainerResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}

async fn lifecycle_notification(ctx: HandlerCtx) -> GcsResult<HandlerResult> {
    let request: LifecycleNotificationRequest = decode(&ctx)?;
    tracing::info!(container = %request.container_id, hint = %request.hint, "lifecycle hint from host");
    encode(&LifecycleNotificationResponse {
        base: ResponseBase::ok(ctx.activity_id),
    })
}
