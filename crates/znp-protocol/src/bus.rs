//! MT command multiplexer
//!
//! Routes SRSPs to the single outstanding SREQ, AREQ indications to
//! callback waiters and subscribers, and applies a deadline to every
//! waiter. At most one SREQ is in flight at any instant; the lane only
//! advances once its SRSP arrives, its deadline passes, or the bus dies.

use crate::cmd::{AsyncRequest, Indication, MtCommand, StatusReply, SyncRequest};
use crate::frame::MtFrame;
use crate::transport::{MtLink, WriteCommand};
use crate::types::{CommandType, ProtocolError, ProtocolViolation, Subsystem};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;

/// Default SREQ response deadline
pub const DEFAULT_SREQ_TIMEOUT: Duration = Duration::from_secs(15);

/// Default deadline for AREQ callbacks answering a request
pub const DEFAULT_ARSP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bus tuning knobs
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub sreq_timeout: Duration,
    /// Interval between watchdog pings; `None` disables the watchdog
    pub watchdog_interval: Option<Duration>,
    /// Consecutive watchdog timeouts before the bus is declared dead
    pub watchdog_failures_max: u32,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            sreq_timeout: DEFAULT_SREQ_TIMEOUT,
            watchdog_interval: None,
            watchdog_failures_max: 3,
        }
    }
}

/// Running bus counters
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub sreqs_sent: u64,
    pub areqs_received: u64,
    /// SRSPs that arrived with no SREQ outstanding (logged and discarded)
    pub unsolicited_srsps: u64,
    /// SRSPs whose (subsystem, id) did not match the outstanding SREQ
    pub mismatched_srsps: u64,
}

struct SrspWaiter {
    subsystem: Subsystem,
    id: u8,
    deadline: Instant,
    tx: oneshot::Sender<Result<MtFrame, ProtocolError>>,
}

struct FrameWaiter {
    token: u64,
    matcher: Box<dyn Fn(&MtFrame) -> bool + Send + Sync>,
    tx: oneshot::Sender<MtFrame>,
}

struct BusInner {
    write_tx: mpsc::Sender<WriteCommand>,
    /// FIFO single-slot SREQ lane
    sreq_lane: Mutex<()>,
    /// The outstanding SREQ's waiter; present means the lane is occupied
    srsp_slot: StdMutex<Option<SrspWaiter>>,
    slot_free: Notify,
    waiters: StdMutex<Vec<FrameWaiter>>,
    next_token: AtomicU64,
    event_tx: broadcast::Sender<MtFrame>,
    disconnected: AtomicBool,
    options: BusOptions,
    sreqs_sent: AtomicU64,
    areqs_received: AtomicU64,
    unsolicited_srsps: AtomicU64,
    mismatched_srsps: AtomicU64,
}

/// Handle to the MT command multiplexer
#[derive(Clone)]
pub struct MtBus {
    inner: Arc<BusInner>,
}

impl MtBus {
    /// Take ownership of a link and start dispatching
    #[must_use]
    pub fn new(link: MtLink, options: BusOptions) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let inner = Arc::new(BusInner {
            write_tx: link.write_tx,
            sreq_lane: Mutex::new(()),
            srsp_slot: StdMutex::new(None),
            slot_free: Notify::new(),
            waiters: StdMutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            event_tx,
            disconnected: AtomicBool::new(false),
            options,
            sreqs_sent: AtomicU64::new(0),
            areqs_received: AtomicU64::new(0),
            unsolicited_srsps: AtomicU64::new(0),
            mismatched_srsps: AtomicU64::new(0),
        });

        tokio::spawn(dispatch_task(inner.clone(), link.frame_rx));

        if let Some(interval) = inner.options.watchdog_interval {
            tokio::spawn(watchdog_task(
                Arc::downgrade(&inner),
                interval,
                inner.options.watchdog_failures_max,
            ));
        }

        Self { inner }
    }

    /// Issue an SREQ and await its SRSP
    #[allow(clippy::missing_errors_doc)]
    pub async fn request<R: SyncRequest>(&self, req: R) -> Result<R::Response, ProtocolError> {
        self.request_with_timeout(req, self.inner.options.sreq_timeout)
            .await
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn request_with_timeout<R: SyncRequest>(
        &self,
        req: R,
        timeout: Duration,
    ) -> Result<R::Response, ProtocolError> {
        let inner = &self.inner;
        if inner.disconnected.load(Ordering::SeqCst) {
            return Err(ProtocolError::Disconnected);
        }

        // FIFO lane: at most one SREQ outstanding at any instant
        let _lane = inner.sreq_lane.lock().await;
        inner.wait_slot_free().await;
        if inner.disconnected.load(Ordering::SeqCst) {
            return Err(ProtocolError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        *inner.srsp_slot.lock().unwrap() = Some(SrspWaiter {
            subsystem: R::SUBSYSTEM,
            id: R::ID,
            deadline,
            tx,
        });

        tracing::debug!("SREQ {}", R::NAME);
        if let Err(e) = inner.send_frame(req.to_frame()).await {
            inner.srsp_slot.lock().unwrap().take();
            return Err(e);
        }
        inner.sreqs_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result.and_then(|frame| R::Response::from_frame(&frame)),
            Ok(Err(_)) => Err(ProtocolError::Disconnected),
            Err(_) => {
                inner.srsp_slot.lock().unwrap().take();
                tracing::warn!("{} timed out waiting for SRSP", R::NAME);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Issue an SREQ whose real answer arrives later as an AREQ
    ///
    /// The callback waiter is registered before the request is written, so
    /// an indication racing ahead of the SRSP is still captured. A failed
    /// SREQ cancels the waiter.
    #[allow(clippy::missing_errors_doc)]
    pub async fn request_callback<R, C, F>(
        &self,
        req: R,
        predicate: F,
        callback_timeout: Duration,
    ) -> Result<C, ProtocolError>
    where
        R: SyncRequest,
        R::Response: StatusReply,
        C: Indication,
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        let callback = self.wait_for(predicate, callback_timeout);

        let rsp = self.request(req).await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(ProtocolError::CommandStatus {
                command: R::NAME,
                status,
            });
        }

        callback.await
    }

    /// Fire-and-forget AREQ
    #[allow(clippy::missing_errors_doc)]
    pub async fn send<A: AsyncRequest>(&self, areq: A) -> Result<(), ProtocolError> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(ProtocolError::Disconnected);
        }
        tracing::debug!("AREQ {}", A::NAME);
        self.inner.send_frame(areq.to_frame()).await
    }

    /// One-shot wait for a matching indication
    ///
    /// The waiter is registered before this returns; the returned future
    /// may be awaited later without missing frames in between. Dropping
    /// the future cancels the waiter.
    pub fn wait_for<C, F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<C, ProtocolError>> + Send
    where
        C: Indication,
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let disconnected = inner.disconnected.load(Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // The guard travels into the future so the waiter is deregistered
        // even if the future is dropped without ever being polled
        let guard = if disconnected {
            None
        } else {
            let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
            inner.waiters.lock().unwrap().push(FrameWaiter {
                token,
                matcher: Box::new(move |frame| {
                    C::matches(frame)
                        && C::from_frame(frame).map(|c| predicate(&c)).unwrap_or(false)
                }),
                tx,
            });
            Some(WaiterGuard {
                inner: Arc::clone(&inner),
                token,
            })
        };

        async move {
            let _guard = guard;
            if disconnected {
                return Err(ProtocolError::Disconnected);
            }
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(frame)) => C::from_frame(&frame),
                Ok(Err(_)) => Err(ProtocolError::Disconnected),
                Err(_) => Err(ProtocolError::Timeout),
            }
        }
    }

    /// Subscribe to every incoming AREQ in wire order
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MtFrame> {
        self.inner.event_tx.subscribe()
    }

    /// Streaming subscription to one indication type, optionally filtered
    pub fn subscribe_to<C, F>(&self, predicate: F) -> TypedSubscription<C, F>
    where
        C: Indication,
        F: Fn(&C) -> bool,
    {
        TypedSubscription {
            rx: self.inner.event_tx.subscribe(),
            predicate,
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            sreqs_sent: self.inner.sreqs_sent.load(Ordering::Relaxed),
            areqs_received: self.inner.areqs_received.load(Ordering::Relaxed),
            unsolicited_srsps: self.inner.unsolicited_srsps.load(Ordering::Relaxed),
            mismatched_srsps: self.inner.mismatched_srsps.load(Ordering::Relaxed),
        }
    }

    /// Fail outstanding waiters and stop the writer
    pub async fn close(&self) {
        self.inner.fail();
        let _ = self.inner.write_tx.send(WriteCommand::Shutdown).await;
    }
}

/// Typed stream over matching indications, in wire order
///
/// Backed by the bus broadcast channel: a slow consumer lags and loses the
/// oldest frames rather than stalling dispatch.
pub struct TypedSubscription<C, F> {
    rx: broadcast::Receiver<MtFrame>,
    predicate: F,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<C, F> TypedSubscription<C, F>
where
    C: Indication,
    F: Fn(&C) -> bool,
{
    /// Next matching indication; `Disconnected` once the bus is gone
    #[allow(clippy::missing_errors_doc)]
    pub async fn recv(&mut self) -> Result<C, ProtocolError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if C::matches(&frame) => match C::from_frame(&frame) {
                    Ok(decoded) if (self.predicate)(&decoded) => return Ok(decoded),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Dropping undecodable {}: {e}", C::NAME),
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProtocolError::Disconnected)
                }
            }
        }
    }
}

struct WaiterGuard {
    inner: Arc<BusInner>,
    token: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.inner
            .waiters
            .lock()
            .unwrap()
            .retain(|w| w.token != self.token);
    }
}

impl BusInner {
    async fn send_frame(&self, frame: MtFrame) -> Result<(), ProtocolError> {
        self.write_tx
            .send(WriteCommand::Send(frame))
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Wait until no SREQ occupies the lane slot
    ///
    /// A cancelled requester leaves its waiter in the slot so the lane
    /// stays blocked until the SRSP arrives or the deadline passes;
    /// whoever queues next evicts the stale entry.
    async fn wait_slot_free(&self) {
        loop {
            let deadline = {
                let mut slot = self.srsp_slot.lock().unwrap();
                match slot.as_ref() {
                    None => return,
                    Some(w) if Instant::now() >= w.deadline => {
                        *slot = None;
                        return;
                    }
                    Some(w) => w.deadline,
                }
            };
            tokio::select! {
                () = self.slot_free.notified() => {}
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn dispatch_srsp(&self, frame: MtFrame) {
        let waiter = self.srsp_slot.lock().unwrap().take();
        match waiter {
            Some(w) if w.subsystem == frame.subsystem && w.id == frame.id => {
                self.slot_free.notify_waiters();
                let _ = w.tx.send(Ok(frame));
            }
            Some(w) => {
                self.slot_free.notify_waiters();
                self.mismatched_srsps.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "SRSP mismatch: expected {:?}/{:#04x}, got {:?}/{:#04x}",
                    w.subsystem,
                    w.id,
                    frame.subsystem,
                    frame.id
                );
                let _ = w.tx.send(Err(ProtocolViolation::UnexpectedSrsp {
                    subsystem: frame.subsystem,
                    id: frame.id,
                }
                .into()));
            }
            None => {
                self.unsolicited_srsps.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Discarding unsolicited SRSP {:?}/{:#04x}",
                    frame.subsystem,
                    frame.id
                );
            }
        }
    }

    fn dispatch_areq(&self, frame: MtFrame) {
        self.areqs_received.fetch_add(1, Ordering::Relaxed);

        // Callback waiters first, then the broadcast stream
        let mut matched = Vec::new();
        {
            let mut waiters = self.waiters.lock().unwrap();
            let mut i = 0;
            while i < waiters.len() {
                if (waiters[i].matcher)(&frame) {
                    matched.push(waiters.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for waiter in matched {
            let _ = waiter.tx.send(frame.clone());
        }

        let _ = self.event_tx.send(frame);
    }

    /// Terminal state: fail every waiter, refuse new work
    fn fail(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("MT bus disconnected");

        if let Some(w) = self.srsp_slot.lock().unwrap().take() {
            let _ = w.tx.send(Err(ProtocolError::Disconnected));
        }
        self.slot_free.notify_waiters();

        // Dropping the senders wakes every callback waiter with an error
        self.waiters.lock().unwrap().clear();
    }
}

async fn dispatch_task(inner: Arc<BusInner>, mut frame_rx: mpsc::Receiver<MtFrame>) {
    while let Some(frame) = frame_rx.recv().await {
        if inner.disconnected.load(Ordering::SeqCst) {
            break;
        }
        match frame.cmd_type {
            CommandType::Srsp => inner.dispatch_srsp(frame),
            CommandType::Areq => inner.dispatch_areq(frame),
            CommandType::Poll | CommandType::Sreq => {
                tracing::debug!(
                    "Ignoring host-bound {:?} frame {:?}/{:#04x}",
                    frame.cmd_type,
                    frame.subsystem,
                    frame.id
                );
            }
        }
    }
    inner.fail();
    tracing::debug!("Dispatch task shutting down");
}

/// Periodic SYS.PING; repeated timeouts promote to a disconnect
async fn watchdog_task(inner: Weak<BusInner>, interval: Duration, max_failures: u32) {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        if strong.disconnected.load(Ordering::SeqCst) {
            return;
        }

        let bus = MtBus { inner: strong };
        match bus.request(crate::cmd::sys::Ping {}).await {
            Ok(_) => failures = 0,
            Err(ProtocolError::Timeout) => {
                failures += 1;
                tracing::warn!("Watchdog ping timed out ({failures}/{max_failures})");
                if failures >= max_failures {
                    tracing::error!("Watchdog gave up, failing the bus");
                    bus.inner.fail();
                    return;
                }
            }
            Err(ProtocolError::Disconnected) => return,
            Err(e) => {
                tracing::warn!("Watchdog ping failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{af, sys, zdo, MtCommand};
    use crate::transport::MtLinkPeer;
    use crate::types::{NwkAddr, ZnpStatus};

    fn bus_pair(options: BusOptions) -> (MtBus, MtLinkPeer) {
        let (link, peer) = MtLink::pair();
        (MtBus::new(link, options), peer)
    }

    async fn expect_written(peer: &mut MtLinkPeer) -> MtFrame {
        match peer.write_rx.recv().await {
            Some(WriteCommand::Send(frame)) => frame,
            other => panic!("expected a written frame, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_on_matching_srsp() {
        let (bus, mut peer) = bus_pair(BusOptions::default());

        let request = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Ping {}).await }
        });

        let written = expect_written(&mut peer).await;
        assert!(sys::Ping::matches(&written));

        let rsp = sys::PingRsp { capabilities: 0x0659 };
        peer.frame_tx.send(rsp.to_frame()).await.unwrap();

        let result = request.await.unwrap().unwrap();
        assert_eq!(result.capabilities, 0x0659);
    }

    #[tokio::test]
    async fn test_sreq_lane_is_serialised() {
        let (bus, mut peer) = bus_pair(BusOptions::default());

        let first = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Ping {}).await }
        });
        let second = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Version {}).await }
        });

        // Exactly one SREQ hits the wire until its SRSP arrives
        let written = expect_written(&mut peer).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.write_rx.recv())
                .await
                .is_err(),
            "second SREQ written before first SRSP"
        );

        let answer = |frame: &MtFrame| -> MtFrame {
            if sys::Ping::matches(frame) {
                sys::PingRsp { capabilities: 0 }.to_frame()
            } else {
                assert!(sys::Version::matches(frame));
                sys::VersionRsp {
                    transport_rev: 2,
                    product: 1,
                    major: 2,
                    minor: 7,
                    maint: 1,
                    revision: None,
                }
                .to_frame()
            }
        };

        peer.frame_tx.send(answer(&written)).await.unwrap();
        let later = expect_written(&mut peer).await;
        assert_ne!(later.id, written.id, "same SREQ written twice");
        peer.frame_tx.send(answer(&later)).await.unwrap();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_next_sreq_succeeds() {
        let (bus, mut peer) = bus_pair(BusOptions::default());

        let result = bus.request(sys::Ping {}).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));

        // Lane must have advanced
        let request = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Ping {}).await }
        });
        // Drain the first (timed-out) write, then answer the second
        let _ = expect_written(&mut peer).await;
        let _ = expect_written(&mut peer).await;
        peer.frame_tx
            .send(sys::PingRsp { capabilities: 1 }.to_frame())
            .await
            .unwrap();
        request.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_srsp_logged_and_discarded() {
        let (bus, peer) = bus_pair(BusOptions::default());

        peer.frame_tx
            .send(sys::PingRsp { capabilities: 0 }.to_frame())
            .await
            .unwrap();

        // Give the dispatcher a beat
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.stats().unsolicited_srsps, 1);
        assert!(!bus.is_disconnected());
    }

    #[tokio::test]
    async fn test_areq_interleave_does_not_resolve_sreq() {
        let (bus, mut peer) = bus_pair(BusOptions::default());
        let mut events = bus.subscribe();

        let request = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Ping {}).await }
        });
        let _ = expect_written(&mut peer).await;

        // Two indications before the SRSP
        let msg = af::IncomingMsg {
            group_id: 0,
            cluster_id: 6,
            src_addr: NwkAddr(0x1111),
            src_endpoint: 1,
            dst_endpoint: 1,
            was_broadcast: false,
            lqi: 80,
            security_use: false,
            timestamp: 0,
            trans_seq: 1,
            data: vec![],
        };
        let msg2 = af::IncomingMsg {
            src_addr: NwkAddr(0x2222),
            ..msg.clone()
        };
        peer.frame_tx.send(msg.to_frame()).await.unwrap();
        peer.frame_tx.send(msg2.to_frame()).await.unwrap();

        assert!(!request.is_finished());

        peer.frame_tx
            .send(sys::PingRsp { capabilities: 0 }.to_frame())
            .await
            .unwrap();
        request.await.unwrap().unwrap();

        // Both AREQs delivered to subscribers in wire order
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(
            af::IncomingMsg::from_frame(&first).unwrap().src_addr,
            NwkAddr(0x1111)
        );
        assert_eq!(
            af::IncomingMsg::from_frame(&second).unwrap().src_addr,
            NwkAddr(0x2222)
        );
    }

    #[tokio::test]
    async fn test_callback_arriving_before_srsp_is_delivered() {
        let (bus, mut peer) = bus_pair(BusOptions::default());

        let request = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.request_callback(
                    af::DataRequest {
                        dst_addr: NwkAddr(0x1234),
                        dst_endpoint: 1,
                        src_endpoint: 1,
                        cluster_id: 6,
                        trans_id: 42,
                        options: 0,
                        radius: 30,
                        data: vec![],
                    },
                    |confirm: &af::DataConfirm| confirm.trans_id == 42,
                    DEFAULT_ARSP_TIMEOUT,
                )
                .await
            }
        });

        let _ = expect_written(&mut peer).await;

        // Confirm arrives before the SRSP
        peer.frame_tx
            .send(
                af::DataConfirm {
                    status: ZnpStatus::Success,
                    endpoint: 1,
                    trans_id: 42,
                }
                .to_frame(),
            )
            .await
            .unwrap();
        peer.frame_tx
            .send(
                af::DataRequestRsp {
                    status: ZnpStatus::Success,
                }
                .to_frame(),
            )
            .await
            .unwrap();

        let confirm = request.await.unwrap().unwrap();
        assert_eq!(confirm.trans_id, 42);
    }

    #[tokio::test]
    async fn test_reversed_confirms_resolve_correct_waiters() {
        let (bus, peer) = bus_pair(BusOptions::default());

        let wait_a = bus.wait_for(
            |c: &af::DataConfirm| c.trans_id == 1,
            DEFAULT_ARSP_TIMEOUT,
        );
        let wait_b = bus.wait_for(
            |c: &af::DataConfirm| c.trans_id == 2,
            DEFAULT_ARSP_TIMEOUT,
        );

        // Confirms in reverse registration order
        for id in [2u8, 1u8] {
            peer.frame_tx
                .send(
                    af::DataConfirm {
                        status: ZnpStatus::Success,
                        endpoint: 1,
                        trans_id: id,
                    }
                    .to_frame(),
                )
                .await
                .unwrap();
        }

        assert_eq!(wait_a.await.unwrap().trans_id, 1);
        assert_eq!(wait_b.await.unwrap().trans_id, 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gets_nothing() {
        let (bus, peer) = bus_pair(BusOptions::default());

        let cancelled = bus.wait_for(
            |c: &af::DataConfirm| c.trans_id == 7,
            DEFAULT_ARSP_TIMEOUT,
        );
        drop(cancelled);

        let live = bus.wait_for(
            |c: &af::DataConfirm| c.trans_id == 7,
            DEFAULT_ARSP_TIMEOUT,
        );

        peer.frame_tx
            .send(
                af::DataConfirm {
                    status: ZnpStatus::Success,
                    endpoint: 1,
                    trans_id: 7,
                }
                .to_frame(),
            )
            .await
            .unwrap();

        assert_eq!(live.await.unwrap().trans_id, 7);
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_waiters() {
        let (bus, peer) = bus_pair(BusOptions::default());

        let waiter = bus.wait_for(
            |_: &zdo::StateChangeInd| true,
            DEFAULT_ARSP_TIMEOUT,
        );
        let request = tokio::spawn({
            let bus = bus.clone();
            async move { bus.request(sys::Ping {}).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer); // transport gone

        assert!(matches!(waiter.await, Err(ProtocolError::Disconnected)));
        assert!(matches!(
            request.await.unwrap(),
            Err(ProtocolError::Disconnected)
        ));
        assert!(bus.is_disconnected());
        assert!(matches!(
            bus.request(sys::Ping {}).await,
            Err(ProtocolError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_typed_subscription_filters_and_orders() {
        let (bus, peer) = bus_pair(BusOptions::default());
        let mut joins = bus.subscribe_to(|ind: &zdo::PermitJoinInd| ind.duration > 0);

        peer.frame_tx
            .send(zdo::StateChangeInd { state: 9 }.to_frame())
            .await
            .unwrap();
        for duration in [0u8, 60, 30] {
            peer.frame_tx
                .send(zdo::PermitJoinInd { duration }.to_frame())
                .await
                .unwrap();
        }

        // Wrong type and non-matching duration are skipped, order kept
        assert_eq!(joins.recv().await.unwrap().duration, 60);
        assert_eq!(joins.recv().await.unwrap().duration, 30);
    }

    #[tokio::test]
    async fn test_subscribe_sees_each_indication_once() {
        let (bus, peer) = bus_pair(BusOptions::default());
        let mut events = bus.subscribe();

        for duration in [10u8, 20, 30] {
            peer.frame_tx
                .send(zdo::PermitJoinInd { duration }.to_frame())
                .await
                .unwrap();
        }

        for expected in [10u8, 20, 30] {
            let frame = events.recv().await.unwrap();
            let ind = zdo::PermitJoinInd::from_frame(&frame).unwrap();
            assert_eq!(ind.duration, expected);
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(50), events.recv())
                .await
                .is_err()
        );
    }
}
