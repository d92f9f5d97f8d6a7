// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Helper process runtime.
//!
//! The `corelink-helper` binary calls [`helper_main`]: it answers the host's
//! handshake on stdio, then drives one core session for the lifetime of the
//! connection. Stdout carries the control channel, so logging goes to stderr.
//!
//! Hosts that register their own cores build their own helper binary around
//! [`helper_main`] with a registry that provides them, and point
//! `ManagerConfig::helper_path` at it. The host's registry still decides which
//! of those cores resolve: it is passed as `--core` arguments.

use crate::core::channel::{
    CommandOutput, CoreCommand, HelperMessage, HostMessage, Notification, PROTOCOL_VERSION, Responder,
    read_frame, write_frame,
};
use crate::core::error::WireError;
use crate::core::plugin::{CorePluginInfo, CoreRegistry, NotificationSink};
use crate::core::session::{NullAudioSink, SessionConfig, SessionExit, SessionHandle};
use crate::core::session_id::SessionId;
use crate::core::surface::SurfaceBackend;
use crate::core::{CoreError, Result};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

/// Object id the helper exports as its root proxy.
pub const ROOT_PROXY_ID: u64 = 1;

/// How long buffered replies get to drain once the connection winds down.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Stdin is read on a blocking thread that cannot be cancelled.
const STDIN_RELEASE_TIMEOUT: Duration = Duration::from_millis(200);

/// Command-line arguments of `corelink-helper`.
#[derive(Debug, Clone, Parser)]
#[command(name = "corelink-helper", version, about = "Hosts one emulation core for a corelink manager")]
pub struct HelperArgs {
    /// Session the host minted for this connection.
    #[arg(long)]
    pub session_id: SessionId,

    /// Core the host allows this session to resolve. Repeatable.
    #[arg(long = "core", value_name = "IDENTIFIER")]
    pub cores: Vec<String>,

    /// Core the host knows but refuses as out of support. Repeatable.
    #[arg(long = "out-of-support-core", value_name = "IDENTIFIER")]
    pub out_of_support_cores: Vec<String>,

    /// Delay the handshake reply (debugging aid for connection timeouts).
    #[arg(long, default_value_t = 0)]
    pub debug_handshake_delay_ms: u64,

    /// Answer the handshake without exporting a root proxy.
    #[arg(long)]
    pub debug_nil_root_proxy: bool,
}

impl HelperArgs {
    /// The host's view of the registry, as passed on the command line.
    pub fn allowed_cores(&self) -> Vec<CorePluginInfo> {
        let supported = self.cores.iter().map(|id| CorePluginInfo::new(id, "host"));
        let retired = self
            .out_of_support_cores
            .iter()
            .map(|id| CorePluginInfo::new(id, "host").out_of_support());
        supported.chain(retired).collect()
    }
}

fn setup_logging() -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    // Stdout is the control channel; logs go to stderr only.
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    guard
}

/// Entry point of a helper binary providing the cores in `registry`.
pub fn helper_main(registry: CoreRegistry) -> anyhow::Result<()> {
    let args = HelperArgs::parse();
    let _guard = setup_logging();

    tracing::info!(
        "[{}] corelink-helper {} starting (pid {}, cores {:?})",
        args.session_id.short(),
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        args.cores
    );

    let session = args.session_id;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let outcome = runtime.block_on(run_helper(args, registry));
    runtime.shutdown_timeout(STDIN_RELEASE_TIMEOUT);

    outcome.with_context(|| format!("helper for session {} failed", session))?;
    tracing::info!("[{}] corelink-helper exiting", session.short());
    Ok(())
}

enum Incoming {
    Message(HostMessage),
    Closed,
    Failed(CoreError),
}

/// Serve the host on this process's stdio until it disconnects.
pub async fn run_helper(args: HelperArgs, registry: CoreRegistry) -> Result<()> {
    serve(args, registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one host connection over an arbitrary byte stream.
pub async fn serve<R, W>(args: HelperArgs, registry: CoreRegistry, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let label = args.session_id.short();
    let registry = registry.restricted_to(&args.allowed_cores());
    let mut reader = reader;
    let mut writer = writer;

    match read_frame::<_, HostMessage>(&mut reader).await? {
        Some(HostMessage::Connect {
            session_id,
            protocol_version,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(CoreError::InvalidConnection(format!(
                    "host speaks protocol {}, helper speaks {}",
                    protocol_version, PROTOCOL_VERSION
                )));
            }
            if SessionId::from(session_id) != args.session_id {
                return Err(CoreError::InvalidConnection(format!(
                    "host connected as session {}, helper was started for {}",
                    session_id, args.session_id
                )));
            }
        }
        Some(other) => {
            return Err(CoreError::InvalidConnection(format!(
                "expected handshake connect, got {:?}",
                other
            )));
        }
        None => {
            tracing::info!("[{}] Host closed the connection before the handshake", label);
            return Ok(());
        }
    }

    if args.debug_handshake_delay_ms > 0 {
        tracing::warn!(
            "[{}] Delaying handshake by {}ms",
            label,
            args.debug_handshake_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(args.debug_handshake_delay_ms)).await;
    }

    let root_proxy = (!args.debug_nil_root_proxy).then_some(ROOT_PROXY_ID);
    write_frame(
        &mut writer,
        &HelperMessage::Accept {
            root_proxy,
            pid: std::process::id(),
        },
    )
    .await?;
    tracing::info!("[{}] Accepted host connection", label);

    let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<HelperMessage>();
    let writer_task = tokio::spawn(write_loop(label.clone(), writer, outgoing_rx));

    let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(reader, incoming_tx));

    let (exit_tx, mut exits) = mpsc::unbounded_channel::<SessionExit>();
    let notify: NotificationSink = {
        let outgoing = outgoing.clone();
        Arc::new(move |notification: Notification| {
            let _ = outgoing.send(HelperMessage::Notify { notification });
        })
    };
    let session = SessionHandle::spawn(
        SessionConfig {
            session: args.session_id,
            registry,
            surface_backend: SurfaceBackend::Ipc,
            audio_sink: Box::new(NullAudioSink),
        },
        notify,
        Box::new(move |exit: SessionExit| {
            let _ = exit_tx.send(exit);
        }),
    )?;

    let outcome = loop {
        tokio::select! {
            message = incoming.recv() => match message {
                Some(Incoming::Message(HostMessage::Request { id, command })) => {
                    dispatch(&session, &outgoing, id, command);
                }
                Some(Incoming::Message(HostMessage::Disconnect)) => {
                    tracing::info!("[{}] Host disconnected", label);
                    break Ok(());
                }
                Some(Incoming::Message(HostMessage::Connect { .. })) => {
                    tracing::warn!("[{}] Ignoring repeated handshake connect", label);
                }
                Some(Incoming::Closed) | None => {
                    tracing::info!("[{}] Host closed the connection", label);
                    break Ok(());
                }
                Some(Incoming::Failed(e)) => {
                    tracing::error!("[{}] Unreadable host frame: {}", label, e);
                    break Err(e);
                }
            },
            Some(exit) = exits.recv() => match exit {
                SessionExit::Finished => {
                    tracing::debug!("[{}] Core session finished, awaiting disconnect", label);
                }
                SessionExit::Panicked(message) => {
                    break Err(CoreError::Other(anyhow::anyhow!("core panicked: {}", message)));
                }
            },
        }
    };

    session.shutdown();
    drop(session);
    drop(outgoing);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        tracing::warn!("[{}] Replies still queued at exit were dropped", label);
    }
    outcome
}

fn dispatch(
    session: &SessionHandle,
    outgoing: &mpsc::UnboundedSender<HelperMessage>,
    id: u64,
    command: CoreCommand,
) {
    tracing::debug!("[{}] <- request {} '{}'", session.session().short(), id, command.name());
    if command.is_capture() {
        let result = session.capture_tap().capture(&command);
        let _ = outgoing.send(reply(id, result));
        return;
    }

    let replies = outgoing.clone();
    let responder = Responder::new(command.name(), move |result| {
        let _ = replies.send(reply(id, result));
    });
    if let Err(responder) = session.submit(command, responder) {
        responder.resolve(Err(CoreError::NotRunning));
    }
}

fn reply(id: u64, result: Result<CommandOutput>) -> HelperMessage {
    HelperMessage::Reply {
        id,
        result: result.map_err(WireError::from),
    }
}

async fn read_loop<R>(mut reader: R, incoming: mpsc::UnboundedSender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = match read_frame::<_, HostMessage>(&mut reader).await {
            Ok(Some(message)) => Incoming::Message(message),
            Ok(None) => Incoming::Closed,
            Err(e) => Incoming::Failed(e),
        };
        let last = !matches!(next, Incoming::Message(_));
        if incoming.send(next).is_err() || last {
            break;
        }
    }
}

async fn write_loop<W>(label: String, mut writer: W, mut outgoing: mpsc::UnboundedReceiver<HelperMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            tracing::warn!("[{}] Failed to write to host: {}", label, e);
            break;
        }
    }
    tracing::debug!("[{}] Host writer finished", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::{PatternCore, PatternRom};
    use crate::core::startup::StartupInfo;
    use crate::core::types::IntSize;
    use tokio::io::DuplexStream;

    fn args(session_id: SessionId) -> HelperArgs {
        HelperArgs {
            session_id,
            cores: vec![PatternCore::IDENTIFIER.to_string()],
            out_of_support_cores: Vec::new(),
            debug_handshake_delay_ms: 0,
            debug_nil_root_proxy: false,
        }
    }

    async fn connect(host: &mut DuplexStream, session_id: SessionId) -> HelperMessage {
        write_frame(
            host,
            &HostMessage::Connect {
                session_id: *session_id.as_uuid(),
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();
        read_frame(host).await.unwrap().unwrap()
    }

    /// Read frames until the reply for `id`, collecting notifications.
    async fn reply_for(
        host: &mut DuplexStream,
        id: u64,
        seen: &mut Vec<Notification>,
    ) -> std::result::Result<CommandOutput, WireError> {
        loop {
            match read_frame::<_, HelperMessage>(host).await.unwrap().unwrap() {
                HelperMessage::Reply { id: got, result } if got == id => return result,
                HelperMessage::Notify { notification } => seen.push(notification),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[test]
    fn test_args_parse() {
        let session = SessionId::new();
        let parsed = HelperArgs::try_parse_from([
            "corelink-helper",
            "--session-id",
            &session.to_string(),
            "--core",
            "pattern",
            "--out-of-support-core",
            "legacy",
            "--debug-handshake-delay-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(parsed.session_id, session);
        assert_eq!(parsed.cores, vec!["pattern"]);
        let allowed = parsed.allowed_cores();
        assert_eq!(allowed.len(), 2);
        assert!(!allowed[0].out_of_support);
        assert!(allowed[1].out_of_support && allowed[1].identifier == "legacy");
        assert_eq!(parsed.debug_handshake_delay_ms, 250);
        assert!(!parsed.debug_nil_root_proxy);
    }

    #[test]
    fn test_args_reject_bad_session() {
        assert!(
            HelperArgs::try_parse_from([
                "corelink-helper",
                "--session-id",
                "not-a-uuid",
                "--core",
                "pattern"
            ])
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_handshake_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("demo.json");
        PatternRom::new("demo").with_discs(2).write_to(&rom).unwrap();

        let session_id = SessionId::new();
        let (mut host, helper) = tokio::io::duplex(1 << 20);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(
            args(session_id),
            CoreRegistry::with_builtin_cores(),
            rd,
            wr,
        ));

        match connect(&mut host, session_id).await {
            HelperMessage::Accept { root_proxy, pid } => {
                assert_eq!(root_proxy, Some(ROOT_PROXY_ID));
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected accept, got {:?}", other),
        }

        let info = StartupInfo::builder(&rom, "pattern", "test").build();
        write_frame(
            &mut host,
            &HostMessage::Request {
                id: 1,
                command: CoreCommand::Load(info),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut host,
            &HostMessage::Request {
                id: 2,
                command: CoreCommand::Setup,
            },
        )
        .await
        .unwrap();

        let mut seen = Vec::new();
        assert_eq!(reply_for(&mut host, 1, &mut seen).await, Ok(CommandOutput::Unit));
        let setup = reply_for(&mut host, 2, &mut seen).await.unwrap().into_setup().unwrap();
        assert_eq!(setup.screen_size, IntSize::new(64, 48));
        assert!(seen.contains(&Notification::SetDiscCount(2)));

        write_frame(&mut host, &HostMessage::Disconnect).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_load_error_carries_code() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("broken.json");
        std::fs::write(&rom, b"not json").unwrap();

        let session_id = SessionId::new();
        let (mut host, helper) = tokio::io::duplex(1 << 16);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(
            args(session_id),
            CoreRegistry::with_builtin_cores(),
            rd,
            wr,
        ));
        connect(&mut host, session_id).await;

        let info = StartupInfo::builder(&rom, "pattern", "test").build();
        write_frame(
            &mut host,
            &HostMessage::Request {
                id: 1,
                command: CoreCommand::Load(info),
            },
        )
        .await
        .unwrap();
        let err = reply_for(&mut host, 1, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.code, Some(CoreError::INCORRECT_FILE));

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capture_before_render_is_not_ready() {
        let session_id = SessionId::new();
        let (mut host, helper) = tokio::io::duplex(1 << 16);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(
            args(session_id),
            CoreRegistry::with_builtin_cores(),
            rd,
            wr,
        ));
        connect(&mut host, session_id).await;

        write_frame(
            &mut host,
            &HostMessage::Request {
                id: 9,
                command: CoreCommand::CaptureOutputImage,
            },
        )
        .await
        .unwrap();
        let err = reply_for(&mut host, 9, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.code, None);

        write_frame(&mut host, &HostMessage::Disconnect).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_session_is_rejected() {
        let (mut host, helper) = tokio::io::duplex(1 << 16);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(
            args(SessionId::new()),
            CoreRegistry::with_builtin_cores(),
            rd,
            wr,
        ));
        write_frame(
            &mut host,
            &HostMessage::Connect {
                session_id: *SessionId::new().as_uuid(),
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();
        let err = server.await.unwrap().unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_nil_root_proxy() {
        let session_id = SessionId::new();
        let mut helper_args = args(session_id);
        helper_args.debug_nil_root_proxy = true;
        let (mut host, helper) = tokio::io::duplex(1 << 16);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(helper_args, CoreRegistry::with_builtin_cores(), rd, wr));

        match connect(&mut host, session_id).await {
            HelperMessage::Accept { root_proxy, .. } => assert_eq!(root_proxy, None),
            other => panic!("expected accept, got {:?}", other),
        }
        drop(host);
        server.await.unwrap().unwrap();
    }

    async fn load_in_helper(
        registry: CoreRegistry,
        helper_args: HelperArgs,
        info: StartupInfo,
    ) -> std::result::Result<CommandOutput, WireError> {
        let session_id = helper_args.session_id;
        let (mut host, helper) = tokio::io::duplex(1 << 16);
        let (rd, wr) = tokio::io::split(helper);
        let server = tokio::spawn(serve(helper_args, registry, rd, wr));
        connect(&mut host, session_id).await;

        write_frame(
            &mut host,
            &HostMessage::Request {
                id: 1,
                command: CoreCommand::Load(info),
            },
        )
        .await
        .unwrap();
        let result = reply_for(&mut host, 1, &mut Vec::new()).await;
        write_frame(&mut host, &HostMessage::Disconnect).await.unwrap();
        server.await.unwrap().unwrap();
        result
    }

    #[tokio::test]
    async fn test_host_registry_decides_resolvable_cores() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("demo.json");
        PatternRom::new("demo").write_to(&rom).unwrap();

        let mut registry = CoreRegistry::with_builtin_cores();
        registry
            .register(CorePluginInfo::new("custom", "1"), || Box::new(PatternCore::new()))
            .unwrap();

        let mut custom_only = args(SessionId::new());
        custom_only.cores = vec!["custom".into()];
        let loaded = load_in_helper(
            registry.clone(),
            custom_only.clone(),
            StartupInfo::builder(&rom, "custom", "test").build(),
        )
        .await;
        assert_eq!(loaded, Ok(CommandOutput::Unit));

        custom_only.session_id = SessionId::new();
        let err = load_in_helper(
            registry.clone(),
            custom_only,
            StartupInfo::builder(&rom, "pattern", "test").build(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Some(CoreError::PLUGIN_INVALID));

        let mut retired = args(SessionId::new());
        retired.cores.clear();
        retired.out_of_support_cores = vec!["custom".into()];
        let err = load_in_helper(
            registry,
            retired,
            StartupInfo::builder(&rom, "custom", "test").build(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Some(CoreError::PLUGIN_OUT_OF_SUPPORT));
    }
}
