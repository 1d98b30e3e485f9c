pub(crate) mod channel;
pub(crate) mod payload_channel;
mod utils;

use crate::data_structures::{AppData, RouterInternal};
use crate::events::{EventBus, EventKind};
use crate::messages::{
    WorkerCreateRouterRequest, WorkerDumpRequest, WorkerGetResourceRequest,
    WorkerUpdateSettingsRequest,
};
use crate::ortc;
use crate::ortc::RouterRtpCapabilitiesError;
use crate::registry::{Registry, ResourceId, WeakResource};
use crate::router::{Router, RouterId, RouterOptions};
use crate::worker::utils::SpawnResult;
pub use channel::RequestError;
pub(crate) use channel::{Channel, InternalMessage, SubscriptionHandler};
use async_executor::Executor;
use async_io::Timer;
use async_process::{Child, Command, ExitStatus, Stdio};
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use futures_lite::io::BufReader;
use futures_lite::{future, AsyncBufReadExt, StreamExt};
use log::*;
use parking_lot::Mutex;
pub use payload_channel::NotificationError;
pub(crate) use payload_channel::{
    NotificationMessage, PayloadChannel, PayloadSubscriptionHandler,
};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use std::io;
use thiserror::Error;
use uuid::Uuid;

uuid_based_wrapper_type!(
    /// Worker identifier.
    WorkerId
);

#[derive(Debug, Copy, Clone)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl Default for WorkerLogLevel {
    fn default() -> Self {
        Self::Error
    }
}

impl Serialize for WorkerLogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl WorkerLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub enum WorkerLogTag {
    Info,
    Ice,
    Dtls,
    Rtp,
    Srtp,
    Rtcp,
    Rtx,
    Bwe,
    Score,
    Simulcast,
    Svc,
    Sctp,
    Message,
}

impl Serialize for WorkerLogTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl WorkerLogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ice => "ice",
            Self::Dtls => "dtls",
            Self::Rtp => "rtp",
            Self::Srtp => "srtp",
            Self::Rtcp => "rtcp",
            Self::Rtx => "rtx",
            Self::Bwe => "bwe",
            Self::Score => "score",
            Self::Simulcast => "simulcast",
            Self::Svc => "svc",
            Self::Sctp => "sctp",
            Self::Message => "message",
        }
    }
}

#[derive(Debug)]
pub struct WorkerSettings {
    pub app_data: AppData,
    /// Logging level of the worker subprocess. Default `Error`.
    pub log_level: WorkerLogLevel,
    /// Log tags enabled in the worker subprocess.
    pub log_tags: Vec<WorkerLogTag>,
    /// Minimum RTC port for ICE, DTLS, RTP, etc. Default 10000.
    pub rtc_min_port: u16,
    /// Maximum RTC port for ICE, DTLS, RTP, etc. Default 59999.
    pub rtc_max_port: u16,
    /// Path to the DTLS public certificate in PEM format; the worker
    /// generates one when unset.
    pub dtls_certificate_file: Option<PathBuf>,
    /// Path to the DTLS certificate private key in PEM format.
    pub dtls_private_key_file: Option<PathBuf>,
    /// How long a command may stay unanswered before its waiter completes
    /// with a timeout error. Default 30 s.
    pub command_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            app_data: AppData::default(),
            log_level: WorkerLogLevel::default(),
            log_tags: Vec::new(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdateSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
}

#[derive(Debug, Copy, Clone, Deserialize)]
pub struct WorkerResourceUsage {
    /// User CPU time used (in ms).
    pub ru_utime: u64,
    /// System CPU time used (in ms).
    pub ru_stime: u64,
    /// Maximum resident set size.
    pub ru_maxrss: u64,
    /// Page reclaims (soft page faults).
    pub ru_minflt: u64,
    /// Page faults (hard page faults).
    pub ru_majflt: u64,
    /// Block input operations.
    pub ru_inblock: u64,
    /// Block output operations.
    pub ru_oublock: u64,
    /// Voluntary context switches.
    pub ru_nvcsw: u64,
    /// Involuntary context switches.
    pub ru_nivcsw: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct WorkerDump {
    pub pid: u32,
    pub router_ids: Vec<RouterId>,
}

#[derive(Debug, Error)]
pub enum CreateRouterError {
    #[error("RTP capabilities generation error: {0}")]
    FailedRtpCapabilitiesGeneration(RouterRtpCapabilitiesError),
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Default)]
struct Handlers {
    new_router: Bag<Box<dyn Fn(&Router) + Send + Sync>>,
    dead: BagOnce<Box<dyn FnOnce(Option<ExitStatus>) + Send>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: WorkerId,
    local_id: ResourceId,
    channel: Channel,
    payload_channel: PayloadChannel,
    executor: Arc<Executor<'static>>,
    pid: u32,
    handlers: Arc<Handlers>,
    app_data: AppData,
    registry: Registry,
    event_bus: EventBus,
    load_score: AtomicI64,
    load_score_zero_time: Mutex<Option<Instant>>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    _payload_forward_handler: Mutex<Option<PayloadSubscriptionHandler>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [pid:{}]", self.pid);

            self.registry.unregister(self.local_id);
            self.handlers.closed.call_simple();
            self.channel.close();
            self.payload_channel.close();
            self.kill_process(false);
        }
    }

    /// Kills the worker process: SIGINT first, escalated to SIGKILL after
    /// ten seconds when the process lingers.
    fn kill_process(&self, escalate: bool) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.pid;
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
        if escalate {
            self.executor
                .spawn(async move {
                    Timer::after(Duration::from_secs(10)).await;
                    unsafe {
                        // Zero signal probes for existence first.
                        if libc::kill(pid as libc::pid_t, 0) == 0 {
                            warn!("worker [pid:{}] ignored SIGINT, sending SIGKILL", pid);
                            libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        }
                    }
                })
                .detach();
        }
    }
}

/// A single SFU worker subprocess and its IPC channels.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

/// Weak handle to a worker, does not keep the process alive.
#[derive(Clone)]
pub struct WeakWorker {
    inner: Weak<Inner>,
}

impl WeakWorker {
    pub fn upgrade(&self) -> Option<Worker> {
        self.inner.upgrade().map(|inner| Worker { inner })
    }
}

impl Worker {
    pub(crate) async fn new(
        executor: Arc<Executor<'static>>,
        worker_binary: PathBuf,
        worker_settings: WorkerSettings,
        registry: Registry,
        event_bus: EventBus,
    ) -> io::Result<Self> {
        debug!("new()");

        let WorkerSettings {
            app_data,
            log_level,
            log_tags,
            rtc_min_port,
            rtc_max_port,
            dtls_certificate_file,
            dtls_private_key_file,
            command_timeout,
        } = worker_settings;

        let mut spawn_args: Vec<OsString> = Vec::new();
        spawn_args.push(format!("--logLevel={}", log_level.as_str()).into());
        if !log_tags.is_empty() {
            let log_tags = log_tags
                .iter()
                .map(|log_tag| log_tag.as_str())
                .collect::<Vec<_>>()
                .join(",");
            spawn_args.push(format!("--logTags={}", log_tags).into());
        }
        spawn_args.push(format!("--rtcMinPort={}", rtc_min_port).into());
        spawn_args.push(format!("--rtcMaxPort={}", rtc_max_port).into());

        if let Some(dtls_certificate_file) = dtls_certificate_file {
            let mut arg = OsString::new();
            arg.push("--dtlsCertificateFile=");
            arg.push(dtls_certificate_file);
            spawn_args.push(arg);
        }
        if let Some(dtls_private_key_file) = dtls_private_key_file {
            let mut arg = OsString::new();
            arg.push("--dtlsPrivateKeyFile=");
            arg.push(dtls_private_key_file);
            spawn_args.push(arg);
        }

        debug!(
            "spawning worker process: {} {}",
            worker_binary.to_string_lossy(),
            spawn_args
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new(worker_binary);
        command
            .args(spawn_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("MEDIASOUP_VERSION", "3.9.9");

        let SpawnResult {
            mut child,
            channel,
            payload_channel,
        } = utils::spawn_with_worker_channels(Arc::clone(&executor), &mut command, command_timeout)?;

        let pid = child.id();
        let handlers = Arc::<Handlers>::default();

        setup_output_forwarding(&executor, &mut child, pid);
        wait_for_worker_ready(&channel, pid, &mut child).await?;
        setup_internal_messages(&executor, &channel, &payload_channel, pid);

        let id = WorkerId::new();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::Worker(WeakWorker {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                channel,
                payload_channel,
                executor,
                pid,
                handlers,
                app_data,
                registry: registry.clone(),
                event_bus: event_bus.clone(),
                load_score: AtomicI64::new(0),
                load_score_zero_time: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                _payload_forward_handler: Mutex::new(None),
            }
        });
        let worker = Worker { inner };

        // Channel protocol violations kill the worker.
        {
            let inner_weak = worker.downgrade();
            worker.inner.channel.on_protocol_violation(move || {
                if let Some(worker) = inner_weak.upgrade() {
                    error!("worker [pid:{}] violated the channel protocol", worker.pid());
                    worker.inner.kill_process(true);
                }
            });
        }
        {
            let inner_weak = worker.downgrade();
            worker.inner.payload_channel.on_protocol_violation(move || {
                if let Some(worker) = inner_weak.upgrade() {
                    error!(
                        "worker [pid:{}] violated the payload channel protocol",
                        worker.pid(),
                    );
                    worker.inner.kill_process(true);
                }
            });
        }

        // Forward payload notifications to the event bus, resolving the
        // worker-side uuid to a local id.
        {
            let registry = worker.inner.registry.clone();
            let event_bus = worker.inner.event_bus.clone();
            let handler = worker.inner.payload_channel.subscribe_to_all(move |notification| {
                let resource_id = notification
                    .message
                    .get("targetId")
                    .and_then(|target_id| target_id.as_str())
                    .and_then(|target_id| Uuid::from_str(target_id).ok())
                    .and_then(|uuid| registry.resolve_uuid(&uuid))
                    .unwrap_or_else(ResourceId::invalid);
                event_bus.emit(EventKind::Payload, resource_id, Some(notification.message));
            });
            worker
                .inner
                ._payload_forward_handler
                .lock()
                .replace(handler);
        }

        // Watch for the child exiting; every pending command completes
        // with a channel-closed error and descendants cascade via the
        // dead handlers.
        {
            let status_fut = child.status();
            let inner_weak = Arc::downgrade(&worker.inner);
            worker
                .inner
                .executor
                .spawn(async move {
                    let status = status_fut.await;

                    if let Some(inner) = inner_weak.upgrade() {
                        match &status {
                            Ok(exit_status) => warn!(
                                "worker [pid:{}] exited with status {}",
                                inner.pid, exit_status,
                            ),
                            Err(error) => {
                                error!("worker [pid:{}] wait failed: {}", inner.pid, error)
                            }
                        }

                        inner.channel.close();
                        inner.payload_channel.close();

                        inner
                            .event_bus
                            .emit(EventKind::WorkerShutdown, inner.local_id, None);

                        let exit_status = status.ok();
                        inner.handlers.dead.call(|callback| {
                            callback(exit_status);
                        });

                        inner.close();
                    }
                })
                .detach();
        }

        worker
            .inner
            .event_bus
            .emit(EventKind::WorkerLaunched, worker.inner.local_id, None);

        Ok(worker)
    }

    /// Worker identifier.
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Worker process identifier (PID).
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// App custom data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the worker is closed or shutting down.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
            || self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Load heuristic used by the worker selection policy.
    pub fn load_score(&self) -> i64 {
        self.inner.load_score.load(Ordering::SeqCst)
    }

    /// Time the load score last dropped to zero, while it stays there.
    pub(crate) fn load_score_zero_time(&self) -> Option<Instant> {
        if self.load_score() < 1 {
            *self.inner.load_score_zero_time.lock()
        } else {
            None
        }
    }

    /// Adjusts the load score by `delta`; reaching zero records the time
    /// for idle-worker reaping.
    pub(crate) fn adjust_load_score(&self, delta: i64) {
        let new_score = self.inner.load_score.fetch_add(delta, Ordering::SeqCst) + delta;
        if new_score < 1 {
            self.inner
                .load_score_zero_time
                .lock()
                .replace(Instant::now());
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub(crate) fn executor(&self) -> &Arc<Executor<'static>> {
        &self.inner.executor
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub(crate) fn payload_channel(&self) -> &PayloadChannel {
        &self.inner.payload_channel
    }

    /// Dump worker state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<WorkerDump, RequestError> {
        debug!("dump()");

        self.inner.channel.request(WorkerDumpRequest {}).await
    }

    /// Worker process resource usage.
    pub async fn get_resource_usage(&self) -> Result<WorkerResourceUsage, RequestError> {
        debug!("get_resource_usage()");

        self.inner.channel.request(WorkerGetResourceRequest {}).await
    }

    /// Update worker settings.
    pub async fn update_settings(&self, data: WorkerUpdateSettings) -> Result<(), RequestError> {
        debug!("update_settings()");

        self.inner
            .channel
            .request(WorkerUpdateSettingsRequest { data })
            .await
    }

    /// Create a router.
    ///
    /// The worker is kept alive as long as at least one router instance is
    /// alive, and its load score is raised while the router exists.
    pub async fn create_router(
        &self,
        router_options: RouterOptions,
    ) -> Result<Router, CreateRouterError> {
        debug!("create_router()");

        let RouterOptions {
            app_data,
            media_codecs,
        } = router_options;

        let rtp_capabilities = ortc::generate_router_rtp_capabilities(media_codecs)
            .map_err(CreateRouterError::FailedRtpCapabilitiesGeneration)?;

        let router_id = RouterId::new();
        let internal = RouterInternal { router_id };

        self.inner
            .channel
            .request(WorkerCreateRouterRequest { internal })
            .await
            .map_err(CreateRouterError::Request)?;

        let router = Router::new(router_id, rtp_capabilities, app_data, self.clone());

        self.inner.handlers.new_router.call(|callback| {
            callback(&router);
        });

        Ok(router)
    }

    /// Gracefully shuts the worker down.
    pub fn kill(&self) {
        debug!("kill() [pid:{}]", self.inner.pid);

        self.inner.kill_process(true);
    }

    pub fn on_new_router<F: Fn(&Router) + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.new_router.add(Box::new(callback))
    }

    /// Callback called when the worker process exits for whatever reason.
    pub fn on_dead<F: FnOnce(Option<ExitStatus>) + Send + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.dead.add(Box::new(callback))
    }

    /// Callback called when the worker object is closed.
    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    pub fn downgrade(&self) -> WeakWorker {
        WeakWorker {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

fn setup_output_forwarding(executor: &Arc<Executor<'static>>, child: &mut Child, pid: u32) {
    if let Some(stdout) = child.stdout.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(Ok(line)) = lines.next().await {
                    debug!("[pid:{}] (stdout) {}", pid, line);
                }
            })
            .detach();
    }

    if let Some(stderr) = child.stderr.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    error!("[pid:{}] (stderr) {}", pid, line);
                }
            })
            .detach();
    }
}

async fn wait_for_worker_ready(channel: &Channel, pid: u32, child: &mut Child) -> io::Result<()> {
    #[derive(Deserialize)]
    #[serde(tag = "event", rename_all = "lowercase")]
    enum Notification {
        Running,
    }

    let (sender, receiver) = async_oneshot::oneshot();
    let sender = Mutex::new(Some(sender));
    let _handler = channel.subscribe_to_notifications(pid.to_string(), move |notification| {
        let result = match serde_json::from_value::<Notification>(notification.clone()) {
            Ok(Notification::Running) => {
                debug!("worker process running [pid:{}]", pid);
                Ok(())
            }
            Err(error) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "unexpected first notification from worker [pid:{}]: {:?}; error = {}",
                    pid, notification, error,
                ),
            )),
        };
        if let Some(mut sender) = sender.lock().take() {
            let _ = sender.send(result);
        }
    });

    let status = child.status();
    future::or(
        async move {
            status.await?;
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                "worker process exited before being ready",
            ))
        },
        async move {
            receiver
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "channel closed"))?
        },
    )
    .await
}

fn setup_internal_messages(
    executor: &Arc<Executor<'static>>,
    channel: &Channel,
    _payload_channel: &PayloadChannel,
    pid: u32,
) {
    let channel_receiver = channel.get_internal_message_receiver();
    executor
        .spawn(async move {
            while let Ok(message) = channel_receiver.recv().await {
                match message {
                    InternalMessage::Debug(text) => debug!("[pid:{}] {}", pid, text),
                    InternalMessage::Warn(text) => warn!("[pid:{}] {}", pid, text),
                    InternalMessage::Error(text) => error!("[pid:{}] {}", pid, text),
                    InternalMessage::Dump(text) => println!("{}", text),
                    InternalMessage::Unexpected(data) => error!(
                        "worker [pid:{}] unexpected data: {}",
                        pid,
                        String::from_utf8_lossy(&data),
                    ),
                }
            }
        })
        .detach();
}
