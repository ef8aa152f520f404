//! Correlated request/reply over a frame link.
//!
//! A `Requester` tags each request with a fresh `CorrelationId` and waits for
//! the reply carrying the same id. Replies arrive through a `ReplyRouter`
//! that the link's reader task feeds; the requester drains them into its
//! correlation table and re-polls after a short sleep until its own id shows up.
//!
//! A `Replier` is the other side: the reader task pushes incoming requests
//! into it, the owning process pulls them out and answers through a
//! `ReplyHandle`, which can be cloned into spawned handlers.
//!
//! Id reuse: ids are `u32` and wrap. A new id skips any id still outstanding.
//! An id stops being outstanding when its reply is taken or the waiter gives
//! up. Replies for ids that are not outstanding are stale and dropped, so the
//! unmatched buffer never holds more than one reply per live waiter.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::channel::FrameSender;
use super::protocol::{CorrelationId, Reply, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no reply within {after:?}")]
pub struct ProtocolTimeout {
    pub after: Duration,
}

/// Race `future` against a watchdog. On timeout the caller stops waiting; a
/// request already sent is not retracted.
pub async fn exit_after<T>(
    future: impl Future<Output = T>,
    timeout: Duration,
) -> Result<T, ProtocolTimeout> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ProtocolTimeout { after: timeout })
}

struct CorrelationTable<A> {
    last: CorrelationId,
    outstanding: HashSet<CorrelationId>,
    unmatched: HashMap<CorrelationId, Reply<A>>,
}

impl<A> CorrelationTable<A> {
    fn starting_after(last: CorrelationId) -> Self {
        Self {
            last,
            outstanding: HashSet::new(),
            unmatched: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> CorrelationId {
        let mut id = self.last.successor();
        while self.outstanding.contains(&id) {
            id = id.successor();
        }
        self.last = id;
        self.outstanding.insert(id);
        id
    }

    fn accept(&mut self, reply: Reply<A>) {
        let id = reply.correlation_id;
        if self.outstanding.contains(&id) {
            self.unmatched.insert(id, reply);
        } else {
            tracing::debug!(correlation_id = %id, "Dropping stale reply");
        }
    }

    fn take(&mut self, id: CorrelationId) -> Option<Reply<A>> {
        let reply = self.unmatched.remove(&id)?;
        self.outstanding.remove(&id);
        Some(reply)
    }

    fn abandon(&mut self, id: CorrelationId) {
        self.outstanding.remove(&id);
        self.unmatched.remove(&id);
    }
}

/// Feeds replies read off the link into a `Requester`.
pub struct ReplyRouter<A> {
    tx: mpsc::UnboundedSender<Reply<A>>,
}

impl<A> Clone for ReplyRouter<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A> ReplyRouter<A> {
    /// Returns false once the requester is gone.
    pub fn route(&self, reply: Reply<A>) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// A request that has been sent and whose reply has not been taken yet.
///
/// Dropping it releases the correlation id.
pub struct PendingReply<'a, A> {
    id: CorrelationId,
    table: &'a StdMutex<CorrelationTable<A>>,
}

impl<A> PendingReply<'_, A> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl<A> Drop for PendingReply<'_, A> {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abandon(self.id);
    }
}

/// Sends `Request<Q>` wrapped in frame type `F` and waits for `Reply<A>`.
pub struct Requester<Q, A, F> {
    sink: FrameSender<F>,
    replies: StdMutex<mpsc::UnboundedReceiver<Reply<A>>>,
    table: StdMutex<CorrelationTable<A>>,
    poll_interval: Duration,
    _request: PhantomData<fn(Q)>,
}

impl<Q, A, F> Requester<Q, A, F>
where
    F: From<Request<Q>> + Serialize,
{
    pub fn new(sink: FrameSender<F>, poll_interval: Duration) -> (Self, ReplyRouter<A>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let requester = Self {
            sink,
            replies: StdMutex::new(rx),
            table: StdMutex::new(CorrelationTable::starting_after(CorrelationId::new(0))),
            poll_interval,
            _request: PhantomData,
        };
        (requester, ReplyRouter { tx })
    }

    /// Send `value` under a fresh correlation id.
    ///
    /// A write failure is logged, not returned: the peer is presumed gone and
    /// the caller's deadline decides how long to keep waiting.
    pub async fn send_request(&self, value: Q) -> PendingReply<'_, A> {
        let id = self.lock_table().allocate();
        let pending = PendingReply {
            id,
            table: &self.table,
        };
        if let Err(e) = self.sink.send(F::from(Request::new(value, id))).await {
            tracing::warn!(correlation_id = %id, error = %e, "Failed to send request");
        }
        pending
    }

    /// Drain routed replies into the table and take the one for `id`, if present.
    pub fn check_received(&self, id: CorrelationId) -> Option<Reply<A>> {
        let mut table = self.lock_table();
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(reply) = replies.try_recv() {
            table.accept(reply);
        }
        table.take(id)
    }

    /// Poll until the reply for `pending` arrives. Unbounded; see `get_answer`.
    pub async fn receive_answer(&self, pending: PendingReply<'_, A>) -> Reply<A> {
        loop {
            if let Some(reply) = self.check_received(pending.id) {
                return reply;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Full round trip bounded by `timeout`.
    pub async fn get_answer(&self, value: Q, timeout: Duration) -> Result<A, ProtocolTimeout> {
        exit_after(
            async {
                let pending = self.send_request(value).await;
                self.receive_answer(pending).await.value
            },
            timeout,
        )
        .await
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, CorrelationTable<A>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sends replies back over the link. Cheap to clone into request handlers.
pub struct ReplyHandle<A, F> {
    sink: FrameSender<F>,
    _reply: PhantomData<fn(A)>,
}

impl<A, F> Clone for ReplyHandle<A, F> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            _reply: PhantomData,
        }
    }
}

impl<A, F> ReplyHandle<A, F>
where
    F: From<Reply<A>> + Serialize,
{
    pub async fn reply(&self, reply: Reply<A>) -> io::Result<()> {
        self.sink.send(F::from(reply)).await
    }
}

/// Receives `Request<Q>` and answers with `Reply<A>` wrapped in frame type `F`.
pub struct Replier<Q, A, F> {
    requests: mpsc::UnboundedReceiver<Request<Q>>,
    handle: ReplyHandle<A, F>,
}

impl<Q, A, F> Replier<Q, A, F>
where
    F: From<Reply<A>> + Serialize,
{
    /// The returned sender is where the link's reader task pushes requests.
    pub fn new(sink: FrameSender<F>) -> (Self, mpsc::UnboundedSender<Request<Q>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let replier = Self {
            requests: rx,
            handle: ReplyHandle {
                sink,
                _reply: PhantomData,
            },
        };
        (replier, tx)
    }

    /// Wait for the next request. `None` once every sender is gone and the queue is empty.
    pub async fn next_request(&mut self) -> Option<Request<Q>> {
        self.requests.recv().await
    }

    /// Take every request queued right now without waiting.
    pub fn handle_requests(&mut self) -> Vec<Request<Q>> {
        let mut drained = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            drained.push(request);
        }
        drained
    }

    pub fn reply_handle(&self) -> ReplyHandle<A, F> {
        self.handle.clone()
    }

    /// Answer everything still queued with `answer`. Returns how many replies went out.
    pub async fn answer_pending(&mut self, answer: A) -> usize
    where
        A: Clone,
    {
        let mut answered = 0;
        for request in self.handle_requests() {
            match self.handle.reply(Reply::to(&request, answer.clone())).await {
                Ok(()) => answered += 1,
                Err(e) => {
                    tracing::debug!(correlation_id = %request.correlation_id, error = %e, "Could not answer queued request");
                }
            }
        }
        answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::ChannelPair;
    use crate::bridge::protocol::{Outbound, Status, Verb, WorkerInbound};
    use futures::StreamExt;
    use std::sync::Arc;

    const POLL: Duration = Duration::from_millis(1);
    const DEADLINE: Duration = Duration::from_secs(5);

    type TestRequester = Requester<Verb, Status, WorkerInbound>;

    /// Requester on one end of an in-memory link, raw framed access on the other.
    fn requester_with_peer() -> (
        Arc<TestRequester>,
        crate::bridge::channel::FrameReader<WorkerInbound>,
        FrameSender<Outbound>,
    ) {
        let (local, peer) = ChannelPair::in_memory();
        let (mut local_rx, local_tx) = local.into_framed::<Outbound, WorkerInbound>();
        let (peer_rx, peer_tx) = peer.into_framed::<WorkerInbound, Outbound>();

        let (requester, router) = TestRequester::new(local_tx, POLL);
        tokio::spawn(async move {
            while let Some(Ok(Outbound::Reply(reply))) = local_rx.next().await {
                if !router.route(reply) {
                    break;
                }
            }
        });
        (Arc::new(requester), peer_rx, peer_tx)
    }

    async fn next_request(rx: &mut crate::bridge::channel::FrameReader<WorkerInbound>) -> Request<Verb> {
        match rx.next().await {
            Some(Ok(WorkerInbound::Control(request))) => request,
            other => panic!("expected control request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_trip_matches_reply() {
        let (requester, mut peer_rx, peer_tx) = requester_with_peer();

        let peer = tokio::spawn(async move {
            let request = next_request(&mut peer_rx).await;
            assert_eq!(request.value, Verb::GetStatus);
            peer_tx
                .send(Outbound::Reply(Reply::to(&request, Status::Running)))
                .await
                .unwrap();
        });

        let status = requester.get_answer(Verb::GetStatus, DEADLINE).await.unwrap();
        assert_eq!(status, Status::Running);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let (requester, mut peer_rx, peer_tx) = requester_with_peer();

        let peer = tokio::spawn(async move {
            let first = next_request(&mut peer_rx).await;
            let second = next_request(&mut peer_rx).await;
            // Answer in reverse order so the first waiter has to buffer.
            peer_tx
                .send(Outbound::Reply(Reply::to(&second, Status::Stopped)))
                .await
                .unwrap();
            peer_tx
                .send(Outbound::Reply(Reply::to(&first, Status::Running)))
                .await
                .unwrap();
        });

        let (status, stop) = tokio::join!(
            requester.get_answer(Verb::GetStatus, DEADLINE),
            requester.get_answer(Verb::Stop, DEADLINE),
        );
        assert_eq!(status.unwrap(), Status::Running);
        assert_eq!(stop.unwrap(), Status::Stopped);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_releases_the_id() {
        let (requester, _peer_rx, _peer_tx) = requester_with_peer();

        let err = requester
            .get_answer(Verb::GetStatus, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.after, Duration::from_millis(20));
        assert!(requester.lock_table().outstanding.is_empty());
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let (requester, mut peer_rx, peer_tx) = requester_with_peer();

        assert!(
            requester
                .get_answer(Verb::Join, Duration::from_millis(10))
                .await
                .is_err()
        );
        let request = next_request(&mut peer_rx).await;
        peer_tx
            .send(Outbound::Reply(Reply::to(&request, Status::Sleeping)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(requester.check_received(request.correlation_id).is_none());
        assert!(requester.lock_table().unmatched.is_empty());
    }

    #[tokio::test]
    async fn send_failure_surfaces_as_timeout() {
        let (local, peer) = ChannelPair::in_memory();
        let (_local_rx, local_tx) = local.into_framed::<Outbound, WorkerInbound>();
        drop(peer);

        let (requester, _router) = TestRequester::new(local_tx, POLL);
        assert!(
            requester
                .get_answer(Verb::Stop, Duration::from_millis(20))
                .await
                .is_err()
        );
    }

    #[test]
    fn allocation_wraps_and_skips_outstanding_ids() {
        let mut table = CorrelationTable::<Status>::starting_after(CorrelationId::new(u32::MAX - 1));
        let last = table.allocate();
        assert_eq!(last, CorrelationId::new(u32::MAX));

        let wrapped = table.allocate();
        assert_eq!(wrapped, CorrelationId::new(0));

        // Wrap all the way around: the next allocation must not hand out 0 or MAX again.
        table.last = CorrelationId::new(u32::MAX - 1);
        let next = table.allocate();
        assert_eq!(next, CorrelationId::new(1));
    }

    #[test]
    fn only_outstanding_replies_are_buffered() {
        let mut table = CorrelationTable::<Status>::starting_after(CorrelationId::new(0));
        let id = table.allocate();

        table.accept(Reply::new(Status::Running, CorrelationId::new(99)));
        table.accept(Reply::new(Status::Sleeping, id));
        assert_eq!(table.unmatched.len(), 1);

        assert_eq!(table.take(id).map(|r| r.value), Some(Status::Sleeping));
        assert!(table.outstanding.is_empty());
        assert!(table.take(id).is_none());
    }

    #[tokio::test]
    async fn replier_drains_and_answers() {
        let (local, peer) = ChannelPair::in_memory();
        let (_local_rx, local_tx) = local.into_framed::<WorkerInbound, Outbound>();
        let (mut peer_rx, _peer_tx) = peer.into_framed::<Outbound, WorkerInbound>();

        let (mut replier, requests) = Replier::<Verb, Status, Outbound>::new(local_tx);
        requests
            .send(Request::new(Verb::GetStatus, CorrelationId::new(1)))
            .unwrap();
        requests
            .send(Request::new(Verb::Stop, CorrelationId::new(2)))
            .unwrap();

        let drained = replier.handle_requests();
        assert_eq!(drained.len(), 2);
        assert!(replier.handle_requests().is_empty());

        let handle = replier.reply_handle();
        for request in &drained {
            handle
                .reply(Reply::to(request, Status::Stopped))
                .await
                .unwrap();
        }

        for expected in [1, 2] {
            match peer_rx.next().await {
                Some(Ok(Outbound::Reply(reply))) => {
                    assert_eq!(reply.correlation_id, CorrelationId::new(expected));
                }
                other => panic!("expected reply, got {other:?}"),
            }
        }

        drop(requests);
        assert!(replier.next_request().await.is_none());
    }

    #[tokio::test]
    async fn pending_requests_all_get_the_same_answer() {
        let (local, peer) = ChannelPair::in_memory();
        let (_local_rx, local_tx) = local.into_framed::<WorkerInbound, Outbound>();
        let (mut peer_rx, _peer_tx) = peer.into_framed::<Outbound, WorkerInbound>();

        let (mut replier, requests) = Replier::<Verb, Status, Outbound>::new(local_tx);
        for id in [7, 8, 9] {
            requests
                .send(Request::new(Verb::GetStatus, CorrelationId::new(id)))
                .unwrap();
        }

        assert_eq!(replier.answer_pending(Status::Stopped).await, 3);
        assert_eq!(replier.answer_pending(Status::Stopped).await, 0);

        for expected in [7, 8, 9] {
            match peer_rx.next().await {
                Some(Ok(Outbound::Reply(reply))) => {
                    assert_eq!(reply.correlation_id, CorrelationId::new(expected));
                    assert_eq!(reply.value, Status::Stopped);
                }
                other => panic!("expected reply, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn pending_requests_on_a_closed_link_are_not_counted() {
        let (local, peer) = ChannelPair::in_memory();
        let (_local_rx, local_tx) = local.into_framed::<WorkerInbound, Outbound>();
        drop(peer);

        let (mut replier, requests) = Replier::<Verb, Status, Outbound>::new(local_tx);
        requests
            .send(Request::new(Verb::Stop, CorrelationId::new(1)))
            .unwrap();

        assert_eq!(replier.answer_pending(Status::Stopped).await, 0);
        assert!(replier.handle_requests().is_empty());
    }
}
