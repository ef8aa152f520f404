//! Framed codec for process links.
//!
//! LengthDelimitedCodec does the framing (4-byte big-endian prefix), serde_json
//! does the payload. Works over any AsyncRead/AsyncWrite: child pipes, own
//! stdio, or in-memory duplex streams.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side accepts. Task payloads and results travel inline,
/// so this bounds the biggest value a task can return.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(target: "taskpool::wire", frame_bytes = json.len(), "Encoding frame");
        if json.len() > 1024 * 1024 {
            tracing::debug!(
                target: "taskpool::wire",
                frame_kb = json.len() / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        CorrelationId, ManagerInbound, Outbound, Reply, Request, Status, Verb,
    };
    use crate::task::{FinishedTask, Task, TaskFault, TaskId, TaskSpec};

    #[test]
    fn submit_frame_survives_codec() {
        let mut codec = JsonCodec::<ManagerInbound>::new();
        let mut buf = BytesMut::new();

        let task = Task::new(TaskId::new(7), TaskSpec::new("increment", serde_json::json!(0)))
            .with_prerequisites(vec![TaskId::new(3), TaskId::new(5)]);
        codec
            .encode(ManagerInbound::Submit { tasks: vec![task] }, &mut buf)
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            ManagerInbound::Submit { tasks } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].id, TaskId::new(7));
                assert_eq!(tasks[0].prerequisites, vec![TaskId::new(3), TaskId::new(5)]);
                assert_eq!(tasks[0].work.kind, "increment");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn fault_outcome_survives_codec() {
        let mut codec = JsonCodec::<Outbound>::new();
        let mut buf = BytesMut::new();

        let finished = FinishedTask::fault(TaskId::new(2), TaskFault::raised("division by zero"));
        codec
            .encode(Outbound::Finished { task: finished.clone() }, &mut buf)
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            Outbound::Finished { task } => assert_eq!(task, finished),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn several_frames_decode_in_order() {
        let mut codec = JsonCodec::<Outbound>::new();
        let mut buf = BytesMut::new();

        for (n, status) in [Status::Running, Status::Sleeping].into_iter().enumerate() {
            let reply = Reply::new(status, CorrelationId::new(n as u32));
            codec.encode(Outbound::Reply(reply), &mut buf).unwrap();
        }

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Outbound::Reply(r) if r.value == Status::Running));
        assert!(matches!(second, Outbound::Reply(r) if r.value == Status::Sleeping));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<ManagerInbound>::new();
        let mut full = BytesMut::new();
        let request = Request::new(Verb::GetStatus, CorrelationId::new(1));
        codec
            .encode(ManagerInbound::Control(request), &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(ManagerInbound::Control(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<Outbound>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let finished = FinishedTask::value(TaskId::new(1), serde_json::json!("x".repeat(64)));

        let err = codec
            .encode(Outbound::Finished { task: finished }, &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonCodec::<Outbound>::new();
        let mut buf = BytesMut::new();
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        raw.encode(Bytes::from_static(b"not json"), &mut buf).unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
