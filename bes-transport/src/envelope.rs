//! Construction of sequence-numbered wire envelopes.
//!
//! Lifecycle envelopes use the per-sub-phase constants {1, 2} the service
//! expects; the main stream carries its own monotonic counter starting at 1.
//! Stream-id composition is keyed on the event kind and must match the
//! service's routing table bit-exactly.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use bes_proto::build_event::{
    build_component_stream_finished::FinishType, BuildComponentStreamFinished, BuildEnqueued,
    BuildFinished, Event, InvocationAttemptFinished, InvocationAttemptStarted,
};
use bes_proto::publish_lifecycle_event_request::ServiceLevel;
use bes_proto::stream_id::BuildComponent;
use bes_proto::{
    build_status, BuildEvent, BuildStatus, OrderedBuildEvent, PublishBuildToolEventStreamRequest,
    PublishLifecycleEventRequest, StreamId,
};
use prost_types::Timestamp;

/// Builds lifecycle and stream requests for one transport instance.
pub(crate) struct EnvelopeBuilder {
    build_request_id: String,
    invocation_id: String,
    project_id: Option<String>,
    command_name: String,
    additional_keywords: BTreeSet<String>,
    stream_sequence: AtomicI64,
}

impl EnvelopeBuilder {
    pub(crate) fn new(
        build_request_id: String,
        invocation_id: String,
        project_id: Option<String>,
        command_name: String,
        additional_keywords: BTreeSet<String>,
    ) -> Self {
        Self {
            build_request_id,
            invocation_id,
            project_id,
            command_name,
            additional_keywords,
            stream_sequence: AtomicI64::new(1),
        }
    }

    /// Returns and advances the main-stream sequence counter.
    pub(crate) fn next_sequence_number(&self) -> i64 {
        self.stream_sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn build_enqueued(&self, timestamp: Timestamp) -> PublishLifecycleEventRequest {
        self.lifecycle_event(
            1,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::BuildEnqueued(BuildEnqueued { details: None })),
            },
        )
    }

    pub(crate) fn build_finished(
        &self,
        timestamp: Timestamp,
        result: build_status::Result,
    ) -> PublishLifecycleEventRequest {
        self.lifecycle_event(
            2,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::BuildFinished(BuildFinished {
                    status: Some(BuildStatus {
                        result: result as i32,
                        details: None,
                    }),
                    details: None,
                })),
            },
        )
    }

    pub(crate) fn invocation_started(&self, timestamp: Timestamp) -> PublishLifecycleEventRequest {
        self.lifecycle_event(
            1,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::InvocationAttemptStarted(InvocationAttemptStarted {
                    attempt_number: 1,
                    details: None,
                })),
            },
        )
    }

    pub(crate) fn invocation_finished(
        &self,
        timestamp: Timestamp,
        result: build_status::Result,
    ) -> PublishLifecycleEventRequest {
        self.lifecycle_event(
            2,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::InvocationAttemptFinished(InvocationAttemptFinished {
                    invocation_status: Some(BuildStatus {
                        result: result as i32,
                        details: None,
                    }),
                    details: None,
                })),
            },
        )
    }

    /// Stream request carrying a packed build-tool payload.
    pub(crate) fn bazel_event(
        &self,
        sequence_number: i64,
        timestamp: Timestamp,
        payload: prost_types::Any,
    ) -> PublishBuildToolEventStreamRequest {
        self.stream_request(
            sequence_number,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::BazelEvent(payload)),
            },
        )
    }

    /// Stream request closing the tool's component stream.
    pub(crate) fn stream_finished(
        &self,
        sequence_number: i64,
        timestamp: Timestamp,
    ) -> PublishBuildToolEventStreamRequest {
        self.stream_request(
            sequence_number,
            BuildEvent {
                event_time: Some(timestamp),
                event: Some(Event::ComponentStreamFinished(BuildComponentStreamFinished {
                    r#type: FinishType::Finished as i32,
                })),
            },
        )
    }

    fn stream_request(
        &self,
        sequence_number: i64,
        event: BuildEvent,
    ) -> PublishBuildToolEventStreamRequest {
        let stream_id = self.stream_id(event.event.as_ref());
        PublishBuildToolEventStreamRequest {
            ordered_build_event: Some(OrderedBuildEvent {
                stream_id: Some(stream_id),
                sequence_number,
                event: Some(event),
            }),
            notification_keywords: if sequence_number == 1 {
                self.keywords()
            } else {
                Vec::new()
            },
            project_id: String::new(),
        }
    }

    fn lifecycle_event(
        &self,
        sequence_number: i64,
        event: BuildEvent,
    ) -> PublishLifecycleEventRequest {
        let stream_id = self.stream_id(event.event.as_ref());
        PublishLifecycleEventRequest {
            service_level: ServiceLevel::Interactive as i32,
            build_event: Some(OrderedBuildEvent {
                stream_id: Some(stream_id),
                sequence_number,
                event: Some(event),
            }),
            stream_timeout: None,
            notification_keywords: Vec::new(),
            project_id: self.project_id.clone().unwrap_or_default(),
        }
    }

    /// Stream-id composition, keyed by event kind.
    fn stream_id(&self, kind: Option<&Event>) -> StreamId {
        let mut stream_id = StreamId {
            build_id: self.build_request_id.clone(),
            invocation_id: String::new(),
            component: BuildComponent::UnknownComponent as i32,
        };
        match kind {
            Some(Event::BuildEnqueued(_)) | Some(Event::BuildFinished(_)) => {
                stream_id.component = BuildComponent::Controller as i32;
            }
            Some(Event::InvocationAttemptStarted(_))
            | Some(Event::InvocationAttemptFinished(_)) => {
                stream_id.invocation_id = self.invocation_id.clone();
                stream_id.component = BuildComponent::Controller as i32;
            }
            Some(Event::BazelEvent(_)) | Some(Event::ComponentStreamFinished(_)) | None => {
                stream_id.invocation_id = self.invocation_id.clone();
                stream_id.component = BuildComponent::Tool as i32;
            }
        }
        stream_id
    }

    /// Keywords subscribers filter notifications by; sent with the first
    /// stream request only.
    fn keywords(&self) -> Vec<String> {
        let mut keywords = vec![
            format!("command_name={}", self.command_name),
            "protocol_name=BEP".to_owned(),
        ];
        keywords.extend(self.additional_keywords.iter().cloned());
        keywords
    }
}
