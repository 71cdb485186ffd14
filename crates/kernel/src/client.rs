use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::{self, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    connection::{ConfigError, ConnectionInfo},
    execution::{ExecutionError, ExecutionTask},
    session::{Channels, Session, SessionError, ZmqChannels},
    status::{StatusListeners, StatusSubscription, SubscriptionId},
    supervisor::KernelProcess,
    wire::{ProtocolError, SignatureScheme, Signer},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("kernel did not become ready within {0:?}")]
    NotReady(Duration),
    #[error("kernel client is closed")]
    Closed,
}

enum Request {
    Execute {
        code: String,
        responds_to: oneshot::Sender<String>,
    },
    KernelInfo {
        timeout: Duration,
        responds_to: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Eventual text result of [`KernelClient::execute`].
///
/// Always resolves to a string: kernel errors come back as traceback text,
/// client-side failures as `"Error: ..."`.
pub struct Execution {
    handle: JoinHandle<String>,
}

impl Future for Execution {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<String> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| format!("Error: {e}")))
    }
}

/// Client for one running kernel.
///
/// The session is owned by a background worker; at most
/// [`ClientConfig::max_in_flight`] executions are queued or running.
pub struct KernelClient {
    requests: mpsc::Sender<Request>,
    listeners: StatusListeners,
    in_flight: Arc<Semaphore>,
    cancellation: CancellationToken,
    worker: Option<JoinHandle<()>>,
    process: Option<KernelProcess>,
    connection_file: PathBuf,
    config: ClientConfig,
}

impl KernelClient {
    pub async fn connect(
        connection_file: impl AsRef<Path>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let connection_file = connection_file.as_ref();
        info!(path = %connection_file.display(), "initializing kernel client");

        let connection = ConnectionInfo::from_file(connection_file)?;
        let signer = Signer::new(&connection.signature_scheme, &connection.key);
        if let SignatureScheme::Unsupported(scheme) = signer.scheme() {
            if config.strict_signatures {
                return Err(ProtocolError::UnsupportedScheme(scheme.clone()).into());
            }
            warn!(scheme = %scheme, "unsupported signature scheme, messages will be unsigned");
        }

        let channels = ZmqChannels::connect(&connection, config.connect_timeout).await?;
        let session = Session::new(channels, signer, config.username.clone());
        info!("kernel client initialized");

        Ok(Self::launch(session, connection_file.to_path_buf(), config))
    }

    /// Starts the session worker over already established channels.
    pub fn launch<C>(session: Session<C>, connection_file: PathBuf, config: ClientConfig) -> Self
    where
        C: Channels + 'static,
    {
        let capacity = config.max_in_flight.max(1);
        let (requests, request_receiver) = mpsc::channel(capacity);
        let listeners = StatusListeners::default();
        let cancellation = CancellationToken::new();

        let worker = task::spawn(run_session(
            session,
            request_receiver,
            listeners.clone(),
            config.clone(),
            cancellation.clone(),
        ));

        Self {
            requests,
            listeners,
            in_flight: Arc::new(Semaphore::new(capacity)),
            cancellation,
            worker: Some(worker),
            process: None,
            connection_file,
            config,
        }
    }

    /// Submits code for execution without waiting for it.
    pub fn execute(&self, code: impl Into<String>) -> Execution {
        let code = code.into();
        let requests = self.requests.clone();
        let in_flight = self.in_flight.clone();

        let handle = task::spawn(async move {
            let Ok(_permit) = in_flight.acquire_owned().await else {
                return format!("Error: {}", ClientError::Closed);
            };

            let (responds_to, response) = oneshot::channel();
            if requests
                .send(Request::Execute { code, responds_to })
                .await
                .is_err()
            {
                return format!("Error: {}", ClientError::Closed);
            }

            response
                .await
                .unwrap_or_else(|_| format!("Error: {}", ClientError::Closed))
        });

        Execution { handle }
    }

    /// Sends `kernel_info_request` and waits for the matching reply.
    pub async fn wait_until_ready(&self) -> Result<(), ClientError> {
        let (responds_to, response) = oneshot::channel();
        let request = Request::KernelInfo {
            timeout: self.config.ready_timeout,
            responds_to,
        };

        self.requests
            .send(request)
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)?
    }

    /// Sends SIGINT to the kernel. `false` when no process id is known or
    /// signalling failed.
    pub async fn interrupt(&self) -> bool {
        match &self.process {
            Some(process) => process.interrupt().await,
            None => {
                warn!("cannot interrupt kernel: no process id available");
                false
            }
        }
    }

    pub fn subscribe_status(&self) -> StatusSubscription {
        self.listeners.subscribe()
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Hands the kernel process over to this client, which then terminates
    /// it and removes its connection file on shutdown.
    pub fn adopt_process(&mut self, process: KernelProcess) {
        self.process = Some(process);
    }

    pub fn kernel_pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(KernelProcess::pid)
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Closes the channels, stops the owned kernel process and removes its
    /// connection file. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        let started = Instant::now();
        info!("closing kernel client");

        self.in_flight.close();
        self.cancellation.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "session worker ended abnormally");
            }
        }

        match self.process.take() {
            Some(process) => process.shutdown(&self.config).await,
            None => debug!("no kernel process owned by this client"),
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "kernel client closed"
        );
    }
}

async fn run_session<C: Channels>(
    mut session: Session<C>,
    mut requests: mpsc::Receiver<Request>,
    listeners: StatusListeners,
    config: ClientConfig,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => break,
            request = requests.recv() => {
                let Some(request) = request else { break };

                match request {
                    Request::Execute { code, responds_to } => {
                        let mut task = ExecutionTask::new(&mut session, &config, &listeners);
                        let result = tokio::select! {
                            biased;

                            _ = cancellation.cancelled() => Err(ExecutionError::Cancelled),
                            result = task.run(&code) => result,
                        };

                        let output = result.unwrap_or_else(|e| {
                            warn!(error = %e, "execution failed");
                            format!("Error: {e}")
                        });
                        let _ = responds_to.send(output);
                    }
                    Request::KernelInfo { timeout, responds_to } => {
                        let result = tokio::select! {
                            biased;

                            _ = cancellation.cancelled() => Err(ClientError::Closed),
                            result = handshake(&mut session, timeout, config.ready_poll_interval) => result,
                        };
                        let _ = responds_to.send(result);
                    }
                }
            }
        }
    }

    session.close().await;
    debug!("session worker stopped");
}

async fn handshake<C: Channels>(
    session: &mut Session<C>,
    limit: Duration,
    poll_interval: Duration,
) -> Result<(), ClientError> {
    info!("checking if kernel is ready");
    let msg_id = session.send_request("kernel_info_request", json!({})).await?;

    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        let Some(reply) = session.poll_shell(poll_interval).await? else {
            continue;
        };
        if reply.parent_msg_id() == Some(msg_id.as_str()) {
            info!("kernel is ready");
            return Ok(());
        }
        debug!(msg_type = reply.msg_type(), "ignoring unrelated shell reply");
    }

    Err(ClientError::NotReady(limit))
}
