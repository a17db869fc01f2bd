//! Shared fakes for driving the transport end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bes_proto::build_event::Event;
use bes_proto::{
    build_status, PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse,
    PublishLifecycleEventRequest,
};
use bes_transport::host::{
    Clock, CommandLineReporter, EventSeverity, ExitKind, ModuleEnvironment, Sleeper,
};
use bes_transport::{
    AckCallback, BuildCompletion, BuildEvent, BuildEventArtifactUploader,
    BuildEventServiceClient, BuildEventServiceTransport, LocalFile, NoConversion, PathConverter,
    PathConverterFuture, StreamStatus, StreamStatusSender, TransportConfig,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tonic::{async_trait, Code, Status};

/// Order in which the client and the uploader were shut down.
pub type ShutdownLog = Arc<Mutex<Vec<&'static str>>>;

/// Scripted behavior for one stream attempt.
#[derive(Clone)]
pub enum StreamBehavior {
    /// Acknowledge every request in order; close cleanly after the
    /// terminator.
    AckAll,
    /// Acknowledge the first `acks` requests, then fail the stream with
    /// `status`.
    AckThenFail { acks: usize, status: Status },
    /// Accept sends but resolve the stream with `status` once `sends`
    /// requests arrived; the driver notices on its status check.
    CloseAfterSends { sends: usize, status: Status },
    /// Accept everything, acknowledge nothing, never finish.
    NoAcks,
    /// Acknowledge the first request with the wrong sequence number.
    AckOutOfOrder,
    /// Fail `open_stream` itself.
    FailOpen(Status),
}

struct ActiveStream {
    on_ack: AckCallback,
    status: StreamStatusSender,
    behavior: StreamBehavior,
    sends: usize,
    resolved: Option<Status>,
}

/// In-memory Build Event Service client with scriptable stream attempts.
pub struct FakeBesClient {
    behaviors: Mutex<VecDeque<StreamBehavior>>,
    lifecycle_results: Mutex<VecDeque<Result<(), Status>>>,
    pub lifecycle_requests: Mutex<Vec<PublishLifecycleEventRequest>>,
    pub stream_requests: Mutex<Vec<PublishBuildToolEventStreamRequest>>,
    attempts: Mutex<Vec<Vec<i64>>>,
    acked: Mutex<Vec<i64>>,
    active: Mutex<Option<ActiveStream>>,
    shutdown_log: ShutdownLog,
}

impl FakeBesClient {
    pub fn new(shutdown_log: ShutdownLog) -> Self {
        Self {
            behaviors: Mutex::new(VecDeque::new()),
            lifecycle_results: Mutex::new(VecDeque::new()),
            lifecycle_requests: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            shutdown_log,
        }
    }

    /// Scripts the next stream attempts; unscripted attempts ack everything.
    pub fn script_streams(&self, behaviors: Vec<StreamBehavior>) {
        self.behaviors.lock().extend(behaviors);
    }

    /// Scripts the next lifecycle publishes; unscripted calls succeed.
    pub fn script_lifecycle(&self, results: Vec<Result<(), Status>>) {
        self.lifecycle_results.lock().extend(results);
    }

    /// Sequence numbers sent on the wire, one vec per stream attempt.
    pub fn attempt_seqs(&self) -> Vec<Vec<i64>> {
        self.attempts.lock().clone()
    }

    /// Sequence numbers acknowledged, across all attempts, in order.
    pub fn acked_seqs(&self) -> Vec<i64> {
        self.acked.lock().clone()
    }

    /// Short names of the lifecycle events published, in order.
    pub fn lifecycle_kinds(&self) -> Vec<String> {
        self.lifecycle_requests
            .lock()
            .iter()
            .map(|request| {
                let event = request
                    .build_event
                    .as_ref()
                    .and_then(|ordered| ordered.event.as_ref())
                    .and_then(|event| event.event.as_ref());
                match event {
                    Some(Event::BuildEnqueued(_)) => "build_enqueued".to_owned(),
                    Some(Event::InvocationAttemptStarted(_)) => "invocation_started".to_owned(),
                    Some(Event::InvocationAttemptFinished(finished)) => {
                        let result = finished
                            .invocation_status
                            .as_ref()
                            .map_or(build_status::Result::UnknownStatus as i32, |status| {
                                status.result
                            });
                        format!("invocation_finished({result})")
                    }
                    Some(Event::BuildFinished(finished)) => {
                        let result = finished
                            .status
                            .as_ref()
                            .map_or(build_status::Result::UnknownStatus as i32, |status| {
                                status.result
                            });
                        format!("build_finished({result})")
                    }
                    other => format!("unexpected({other:?})"),
                }
            })
            .collect()
    }
}

#[async_trait]
impl BuildEventServiceClient for FakeBesClient {
    async fn publish_lifecycle_event(
        &self,
        request: PublishLifecycleEventRequest,
    ) -> Result<(), Status> {
        self.lifecycle_requests.lock().push(request);
        self.lifecycle_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn open_stream(&self, on_ack: AckCallback) -> Result<StreamStatus, Status> {
        let behavior = self
            .behaviors
            .lock()
            .pop_front()
            .unwrap_or(StreamBehavior::AckAll);
        if let StreamBehavior::FailOpen(status) = behavior {
            return Err(status);
        }
        let (tx, rx) = StreamStatus::channel();
        self.attempts.lock().push(Vec::new());
        *self.active.lock() = Some(ActiveStream {
            on_ack,
            status: tx,
            behavior,
            sends: 0,
            resolved: None,
        });
        Ok(rx)
    }

    async fn send_over_stream(
        &self,
        request: PublishBuildToolEventStreamRequest,
    ) -> Result<(), Status> {
        let (acks, result, on_ack) = {
            let mut active = self.active.lock();
            let Some(stream) = active.as_mut() else {
                return Err(Status::failed_precondition("no open stream"));
            };
            if let Some(status) = &stream.resolved {
                return Err(status.clone());
            }

            let sequence = request
                .ordered_build_event
                .as_ref()
                .map_or(-1, |ordered| ordered.sequence_number);
            self.stream_requests.lock().push(request);
            if let Some(attempt) = self.attempts.lock().last_mut() {
                attempt.push(sequence);
            }
            stream.sends += 1;

            let mut acks = Vec::new();
            let mut result = Ok(());
            match &stream.behavior {
                StreamBehavior::AckAll => acks.push(sequence),
                StreamBehavior::AckThenFail { acks: budget, status } => {
                    if stream.sends <= *budget {
                        acks.push(sequence);
                    } else {
                        stream.status.resolve(status.clone());
                        stream.resolved = Some(status.clone());
                        result = Err(status.clone());
                    }
                }
                StreamBehavior::CloseAfterSends { sends, status } => {
                    if stream.sends >= *sends {
                        stream.status.resolve(status.clone());
                        stream.resolved = Some(status.clone());
                    }
                }
                StreamBehavior::NoAcks => {}
                StreamBehavior::AckOutOfOrder => {
                    if stream.sends == 1 {
                        acks.push(sequence + 1);
                    } else {
                        acks.push(sequence);
                    }
                }
                StreamBehavior::FailOpen(_) => unreachable!("rejected at open"),
            }
            (acks, result, Arc::clone(&stream.on_ack))
        };

        // Fire ACKs outside the lock: the callback may call back into
        // close_stream / abort_stream.
        for sequence in acks {
            self.acked.lock().push(sequence);
            on_ack(PublishBuildToolEventStreamResponse {
                stream_id: None,
                sequence_number: sequence,
            });
        }
        result
    }

    fn close_stream(&self) {
        if let Some(stream) = self.active.lock().as_mut() {
            stream.status.resolve(Status::new(Code::Ok, ""));
            stream.resolved.get_or_insert_with(|| Status::new(Code::Ok, ""));
        }
    }

    fn abort_stream(&self, status: Status) {
        if let Some(stream) = self.active.lock().as_mut() {
            stream.status.resolve(status.clone());
            stream.resolved.get_or_insert(status);
        }
    }

    fn is_stream_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|stream| stream.resolved.is_none())
    }

    fn user_readable_error(&self, status: &Status) -> String {
        status.message().to_owned()
    }

    async fn shutdown(&self) {
        self.shutdown_log.lock().push("client");
    }
}

/// Uploader that resolves immediately, optionally with a scripted failure.
pub struct FakeUploader {
    pub uploads: Mutex<Vec<Vec<PathBuf>>>,
    pub fail_with: Mutex<Option<String>>,
    shutdown_log: ShutdownLog,
}

impl FakeUploader {
    pub fn new(shutdown_log: ShutdownLog) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            shutdown_log,
        }
    }
}

#[async_trait]
impl BuildEventArtifactUploader for FakeUploader {
    fn upload(
        &self,
        files: std::collections::HashMap<PathBuf, LocalFile>,
    ) -> PathConverterFuture {
        let mut paths: Vec<PathBuf> = files.into_keys().collect();
        paths.sort();
        self.uploads.lock().push(paths);
        let failure = self.fail_with.lock().clone();
        Box::pin(async move {
            match failure {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(Arc::new(NoConversion) as Arc<dyn PathConverter>),
            }
        })
    }

    async fn shutdown(&self) {
        self.shutdown_log.lock().push("uploader");
    }
}

/// Build-tool event whose payload is just its name.
pub struct TestEvent {
    pub name: String,
    pub files: Vec<LocalFile>,
    pub completion: Option<BuildCompletion>,
}

impl TestEvent {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            files: Vec::new(),
            completion: None,
        }
    }

    pub fn completing(name: &str, exit_code: i32) -> Self {
        Self {
            completion: Some(BuildCompletion {
                exit_code: Some(exit_code),
            }),
            ..Self::named(name)
        }
    }

    pub fn with_files(mut self, files: Vec<LocalFile>) -> Self {
        self.files = files;
        self
    }
}

impl BuildEvent for TestEvent {
    fn referenced_local_files(&self) -> Vec<LocalFile> {
        self.files.clone()
    }

    fn as_packed_proto(&self, _paths: &dyn PathConverter) -> prost_types::Any {
        prost_types::Any {
            type_url: format!("test.example/{}", self.name),
            value: Vec::new(),
        }
    }

    fn build_completion(&self) -> Option<BuildCompletion> {
        self.completion
    }
}

/// Captures everything the user would see.
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Mutex<Vec<(EventSeverity, String)>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn messages_with_severity(&self, severity: EventSeverity) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl CommandLineReporter for RecordingReporter {
    fn handle(&self, severity: EventSeverity, message: String) {
        self.events.lock().push((severity, message));
    }
}

/// Captures fatal-exit requests.
#[derive(Default)]
pub struct RecordingEnvironment {
    pub exits: Mutex<Vec<(String, ExitKind)>>,
}

impl ModuleEnvironment for RecordingEnvironment {
    fn exit(&self, message: String, kind: ExitKind) {
        self.exits.lock().push((message, kind));
    }
}

/// Sleeper that records requested backoffs and returns immediately.
#[derive(Default)]
pub struct InstantSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

/// Clock pinned to a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A transport wired to fakes, plus handles on all of them.
pub struct Harness {
    pub client: Arc<FakeBesClient>,
    pub uploader: Arc<FakeUploader>,
    pub reporter: Arc<RecordingReporter>,
    pub environment: Arc<RecordingEnvironment>,
    pub sleeper: Arc<InstantSleeper>,
    pub shutdown_log: ShutdownLog,
    pub transport: BuildEventServiceTransport,
}

pub fn config() -> TransportConfig {
    TransportConfig::new("build-1", "invocation-1", "build")
}

pub fn harness(config: TransportConfig) -> Harness {
    let shutdown_log: ShutdownLog = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(FakeBesClient::new(Arc::clone(&shutdown_log)));
    let uploader = Arc::new(FakeUploader::new(Arc::clone(&shutdown_log)));
    let reporter = Arc::new(RecordingReporter::default());
    let environment = Arc::new(RecordingEnvironment::default());
    let sleeper = Arc::new(InstantSleeper::default());
    let clock = Arc::new(FixedClock(
        Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap(),
    ));
    let transport = BuildEventServiceTransport::with_host(
        Arc::clone(&client) as Arc<dyn BuildEventServiceClient>,
        Arc::clone(&uploader) as Arc<dyn BuildEventArtifactUploader>,
        config,
        Arc::clone(&reporter) as Arc<dyn CommandLineReporter>,
        Arc::clone(&environment) as Arc<dyn ModuleEnvironment>,
        clock,
        Arc::clone(&sleeper) as Arc<dyn Sleeper>,
        tokio::runtime::Handle::current(),
    );
    Harness {
        client,
        uploader,
        reporter,
        environment,
        sleeper,
        shutdown_log,
        transport,
    }
}
