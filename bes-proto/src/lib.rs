//! Wire types for the Build Event Service publisher API.
//!
//! These messages mirror the `google.devtools.build.v1` publisher surface
//! consumed by the transport: the unary lifecycle request, the bidirectional
//! event-stream request/response pair, and the envelope types they share.
//! Field tags match the live service, so encoded bytes are interchangeable
//! with the canonical definitions.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

/// Identifies one event stream within a build.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamId {
    /// Unique id of the build request this stream belongs to.
    #[prost(string, tag = "1")]
    pub build_id: ::prost::alloc::string::String,
    /// Id of the invocation attempt; empty for build-scoped streams.
    #[prost(string, tag = "6")]
    pub invocation_id: ::prost::alloc::string::String,
    /// Component that produces the stream.
    #[prost(enumeration = "stream_id::BuildComponent", tag = "3")]
    pub component: i32,
}

pub mod stream_id {
    /// Producers of build event streams.
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum BuildComponent {
        UnknownComponent = 0,
        /// The service that coordinates the build.
        Controller = 1,
        Worker = 2,
        /// The build tool itself.
        Tool = 3,
    }
}

/// Aggregate outcome of a build or invocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildStatus {
    #[prost(enumeration = "build_status::Result", tag = "1")]
    pub result: i32,
    #[prost(message, optional, tag = "2")]
    pub details: ::core::option::Option<::prost_types::Any>,
}

pub mod build_status {
    /// Tri-state (plus service-side refinements) outcome reported in
    /// `invocation_attempt_finished` and `build_finished`.
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Result {
        UnknownStatus = 0,
        CommandSucceeded = 1,
        CommandFailed = 2,
        UserError = 3,
        SystemError = 4,
        ResourceExhausted = 5,
        InvocationDeadlineExceeded = 6,
        Cancelled = 7,
        RequestDeadlineExceeded = 8,
    }
}

/// One event in a build event stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildEvent {
    /// Wall-clock time the event was produced.
    #[prost(message, optional, tag = "1")]
    pub event_time: ::core::option::Option<Timestamp>,
    #[prost(
        oneof = "build_event::Event",
        tags = "51, 52, 53, 55, 59, 60"
    )]
    pub event: ::core::option::Option<build_event::Event>,
}

pub mod build_event {
    /// The build has been enqueued by the controller.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildEnqueued {
        #[prost(message, optional, tag = "1")]
        pub details: ::core::option::Option<::prost_types::Any>,
    }

    /// An invocation attempt has started.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InvocationAttemptStarted {
        /// 1-based attempt counter within the build.
        #[prost(int64, tag = "1")]
        pub attempt_number: i64,
        #[prost(message, optional, tag = "2")]
        pub details: ::core::option::Option<::prost_types::Any>,
    }

    /// An invocation attempt has finished.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InvocationAttemptFinished {
        #[prost(message, optional, tag = "3")]
        pub invocation_status: ::core::option::Option<super::BuildStatus>,
        #[prost(message, optional, tag = "4")]
        pub details: ::core::option::Option<::prost_types::Any>,
    }

    /// The build as a whole has finished.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildFinished {
        #[prost(message, optional, tag = "1")]
        pub status: ::core::option::Option<super::BuildStatus>,
        #[prost(message, optional, tag = "2")]
        pub details: ::core::option::Option<::prost_types::Any>,
    }

    /// A component will publish no further events on this stream.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildComponentStreamFinished {
        #[prost(
            enumeration = "build_component_stream_finished::FinishType",
            tag = "1"
        )]
        pub r#type: i32,
    }

    pub mod build_component_stream_finished {
        /// How the stream ended.
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum FinishType {
            FinishTypeUnspecified = 0,
            /// All events were published and the stream closed normally.
            Finished = 1,
            /// The stream was closed by the service after inactivity.
            Expired = 2,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "51")]
        InvocationAttemptStarted(InvocationAttemptStarted),
        #[prost(message, tag = "52")]
        InvocationAttemptFinished(InvocationAttemptFinished),
        #[prost(message, tag = "53")]
        BuildEnqueued(BuildEnqueued),
        #[prost(message, tag = "55")]
        BuildFinished(BuildFinished),
        #[prost(message, tag = "59")]
        ComponentStreamFinished(BuildComponentStreamFinished),
        /// Opaque, packed payload produced by the build tool.
        #[prost(message, tag = "60")]
        BazelEvent(::prost_types::Any),
    }
}

/// A build event bound to its stream position.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrderedBuildEvent {
    #[prost(message, optional, tag = "1")]
    pub stream_id: ::core::option::Option<StreamId>,
    /// Position within the stream; the first event carries 1.
    #[prost(int64, tag = "2")]
    pub sequence_number: i64,
    #[prost(message, optional, tag = "3")]
    pub event: ::core::option::Option<BuildEvent>,
}

/// Unary request framing the build outside the main event stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishLifecycleEventRequest {
    #[prost(
        enumeration = "publish_lifecycle_event_request::ServiceLevel",
        tag = "1"
    )]
    pub service_level: i32,
    #[prost(message, optional, tag = "2")]
    pub build_event: ::core::option::Option<OrderedBuildEvent>,
    #[prost(message, optional, tag = "3")]
    pub stream_timeout: ::core::option::Option<::prost_types::Duration>,
    #[prost(string, repeated, tag = "4")]
    pub notification_keywords: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "6")]
    pub project_id: ::prost::alloc::string::String,
}

pub mod publish_lifecycle_event_request {
    /// How interested the producer is in acknowledgements.
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum ServiceLevel {
        Noninteractive = 0,
        /// A user is watching; events should be processed promptly.
        Interactive = 1,
    }
}

/// One frame of the bidirectional event stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishBuildToolEventStreamRequest {
    #[prost(message, optional, tag = "4")]
    pub ordered_build_event: ::core::option::Option<OrderedBuildEvent>,
    /// Only populated on the first request of the stream.
    #[prost(string, repeated, tag = "5")]
    pub notification_keywords: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "6")]
    pub project_id: ::prost::alloc::string::String,
}

/// Acknowledgement of one stream request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishBuildToolEventStreamResponse {
    #[prost(message, optional, tag = "1")]
    pub stream_id: ::core::option::Option<StreamId>,
    /// Sequence number being acknowledged.
    #[prost(int64, tag = "2")]
    pub sequence_number: i64,
}

/// Convert a chrono `DateTime` to a protobuf `Timestamp`.
pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf `Timestamp` back to a chrono `DateTime`.
pub fn timestamp_to_datetime(ts: &Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.seconds, ts.nanos as u32).unwrap_or_else(Utc::now)
}
