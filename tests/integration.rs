//! End-to-end coverage of the six scenarios an engine instance must satisfy
//! (original §8 "Testable properties"), built the way the teacher tests its
//! own runtime: self-contained `#[test]` functions spinning up listener and
//! client in the same process, no external fixture process.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tpcio::actor::{self, LocalDispatch, PartitionActorRef, PartitionDirectory, PartitionOwner};
use tpcio::buffer::IoBuffer;
use tpcio::config::Config;
use tpcio::engine::TpcEngine;
use tpcio::event_loop::{EventLoop, LoopHandle};
use tpcio::frame::{self, FrameHeader, HEADER_LEN};
use tpcio::socket::{AcceptHandler, AsyncServerSocket, AsyncSocket, FrameHandler};

fn poll_ready<T>(future: &mut (impl Future<Output = T> + Unpin)) -> Option<T> {
    let waker = noop_waker::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match Pin::new(future).poll(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}

fn single_loop_engine() -> (TpcEngine, LoopHandle) {
    let config = Config {
        loop_count: 1,
        ..Config::default()
    };
    let engine = TpcEngine::start_default(config).unwrap();
    let handle = engine.eventloop(0).clone();
    (engine, handle)
}

// 1. Echo 1000 frames synchronously.
#[test]
fn echoes_one_thousand_frames_in_order() {
    struct Echo;
    impl FrameHandler for Echo {
        fn on_frame(self: Rc<Self>, socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]) {
            let reply = IoBuffer::with_capacity(HEADER_LEN + payload.len());
            frame::begin_frame(&reply, header.call_id);
            reply.write_bytes(payload);
            frame::construct_complete(&reply);
            reply.flip();
            socket.write_and_flush(reply);
        }
    }

    struct Acceptor;
    impl AcceptHandler for Acceptor {
        fn on_accept(self: Rc<Self>, socket: Rc<AsyncSocket>) {
            socket.set_frame_handler(Rc::new(Echo));
            socket.activate().unwrap();
        }
    }

    struct Collector(Arc<Mutex<Vec<i32>>>);
    impl FrameHandler for Collector {
        fn on_frame(self: Rc<Self>, _socket: &Rc<AsyncSocket>, _header: FrameHeader, payload: &[u8]) {
            let value = i32::from_be_bytes(payload[0..4].try_into().unwrap());
            self.0.lock().unwrap().push(value);
        }
    }

    let (engine, handle) = single_loop_engine();
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);

    let (tx, rx) = std::sync::mpsc::channel();
    handle
        .execute(move || {
            let server = AsyncServerSocket::open(
                "127.0.0.1:0".parse().unwrap(),
                128,
                EventLoop::current(|lp| lp.handle().clone()),
                4 * 1024 * 1024,
                1 << 20,
            )
            .unwrap();
            let addr = server.local_addr().unwrap();
            server.accept(Rc::new(Acceptor)).unwrap();
            tx.send(addr).unwrap();
        })
        .unwrap();
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle
        .execute(move || {
            let loop_handle = EventLoop::current(|lp| lp.handle().clone());
            let client = AsyncSocket::connect(addr, loop_handle, 4 * 1024 * 1024, 1 << 20).unwrap();
            client.set_frame_handler(Rc::new(Collector(received2)));
            client.activate().unwrap();

            for i in 0..1000i32 {
                let request = IoBuffer::with_capacity(HEADER_LEN + 4);
                frame::begin_frame(&request, i as i64);
                request.write_i32(-1);
                frame::construct_complete(&request);
                request.flip();
                client.write_and_flush(request);
            }
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1000);
    assert!(received.iter().all(|&v| v == -1));
}

// 2. Ping-pong counter decrement: client resends a decrementing counter
// until it reaches zero; must finish within 10s at concurrency 1.
#[test]
fn ping_pong_counter_decrements_to_zero_within_ten_seconds() {
    struct Decrementer;
    impl FrameHandler for Decrementer {
        fn on_frame(self: Rc<Self>, socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]) {
            let counter = i32::from_be_bytes(payload[0..4].try_into().unwrap());
            let reply = IoBuffer::with_capacity(HEADER_LEN + 4);
            frame::begin_frame(&reply, header.call_id);
            reply.write_i32(counter - 1);
            frame::construct_complete(&reply);
            reply.flip();
            socket.write_and_flush(reply);
        }
    }

    struct Resender(Arc<std::sync::mpsc::Sender<()>>);
    impl FrameHandler for Resender {
        fn on_frame(self: Rc<Self>, socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]) {
            let counter = i32::from_be_bytes(payload[0..4].try_into().unwrap());
            if counter == 0 {
                let _ = self.0.send(());
                return;
            }
            let request = IoBuffer::with_capacity(HEADER_LEN + 4);
            frame::begin_frame(&request, header.call_id + 1);
            request.write_i32(counter);
            frame::construct_complete(&request);
            request.flip();
            socket.write_and_flush(request);
        }
    }

    struct Acceptor;
    impl AcceptHandler for Acceptor {
        fn on_accept(self: Rc<Self>, socket: Rc<AsyncSocket>) {
            socket.set_frame_handler(Rc::new(Decrementer));
            socket.activate().unwrap();
        }
    }

    let (engine, handle) = single_loop_engine();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let done_tx = Arc::new(done_tx);

    let (tx, rx) = std::sync::mpsc::channel();
    handle
        .execute(move || {
            let server = AsyncServerSocket::open(
                "127.0.0.1:0".parse().unwrap(),
                128,
                EventLoop::current(|lp| lp.handle().clone()),
                4 * 1024 * 1024,
                1 << 20,
            )
            .unwrap();
            let addr = server.local_addr().unwrap();
            server.accept(Rc::new(Acceptor)).unwrap();
            tx.send(addr).unwrap();
        })
        .unwrap();
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle
        .execute(move || {
            let loop_handle = EventLoop::current(|lp| lp.handle().clone());
            let client = AsyncSocket::connect(addr, loop_handle, 4 * 1024 * 1024, 1 << 20).unwrap();
            client.set_frame_handler(Rc::new(Resender(done_tx)));
            client.activate().unwrap();

            let request = IoBuffer::with_capacity(HEADER_LEN + 4);
            frame::begin_frame(&request, 0);
            request.write_i32(1000);
            frame::construct_complete(&request);
            request.flip();
            client.write_and_flush(request);
        })
        .unwrap();

    let finished = done_rx.recv_timeout(Duration::from_secs(10)).is_ok();

    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    assert!(finished, "counter did not reach zero within 10s");
}

// 3. Cross-loop submit wakeup within 50ms, spin=false, no other work.
#[test]
fn cross_loop_submit_wakes_within_fifty_milliseconds() {
    let config = Config {
        loop_count: 1,
        spin: false,
        ..Config::default()
    };
    let engine = TpcEngine::start_default(config).unwrap();
    let handle = engine.eventloop(0).clone();

    // Let the loop settle into its parked-waiting-on-poll state before timing.
    std::thread::sleep(Duration::from_millis(50));

    let (tx, rx) = std::sync::mpsc::channel();
    let start = Instant::now();
    handle
        .execute(move || {
            tx.send(Instant::now()).unwrap();
        })
        .unwrap();
    let observed_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    assert!(
        observed_at.duration_since(start) < Duration::from_millis(50),
        "cross-loop task took {:?}",
        observed_at.duration_since(start)
    );
}

// 4. Partition affinity: 100 requests to partitionId=42 observed in order
// by exactly one loop, the one `hash(42) mod E` selects.
#[test]
fn partition_affine_requests_land_on_a_single_loop_in_order() {
    struct Directory;
    impl PartitionDirectory for Directory {
        fn partition_owner(&self, _partition_id: u64) -> Option<PartitionOwner> {
            Some(PartitionOwner::Local)
        }
    }

    struct RecordingDispatch {
        loop_index: usize,
        seen: Arc<Mutex<Vec<(usize, i32)>>>,
    }
    impl LocalDispatch for RecordingDispatch {
        fn dispatch_local(self: Rc<Self>, _partition_id: u64, call_id: i64, request: IoBuffer, reply_to: LoopHandle) {
            let value = request.with_data(|d| i32::from_be_bytes(d[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap()));
            request.release();
            self.seen.lock().unwrap().push((self.loop_index, value));
            actor::reply(reply_to, call_id, Ok(Vec::new()));
        }
    }

    let config = Config {
        loop_count: 4,
        ..Config::default()
    };
    let engine = TpcEngine::start_default(config).unwrap();
    let loops = engine.eventloops().to_vec();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for (index, handle) in loops.iter().enumerate() {
        let seen = Arc::clone(&seen);
        handle
            .execute(move || {
                EventLoop::current(|lp| lp.set_local_dispatch(RecordingDispatch { loop_index: index, seen }));
            })
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));

    let expected_loop = actor::loop_index_for(42, loops.len());
    let home = loops[0].clone();
    let (tx, rx) = std::sync::mpsc::channel();

    home.execute(move || {
        let home = EventLoop::current(|lp| lp.handle().clone());
        let actor_ref = PartitionActorRef::new(Rc::new(Directory), loops, home, Some(Duration::from_secs(5)));
        for i in 0..100i32 {
            let mut future = actor_ref.submit(42, |buf| buf.write_i32(i));
            poll_ready(&mut future);
        }
        tx.send(()).unwrap();
    })
    .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    assert!(seen.iter().all(|&(loop_index, _)| loop_index == expected_loop));
    let values: Vec<i32> = seen.iter().map(|&(_, v)| v).collect();
    assert_eq!(values, (0..100).collect::<Vec<i32>>());
}

// 5. Backpressure: writes past the outbound limit return false until flush
// progress is made; no buffer is lost or double-released.
#[test]
fn backpressured_writes_signal_false_without_losing_buffers() {
    struct SlowFrameHandler(Arc<AtomicUsize>);
    impl FrameHandler for SlowFrameHandler {
        fn on_frame(self: Rc<Self>, _socket: &Rc<AsyncSocket>, _header: FrameHeader, payload: &[u8]) {
            self.0.fetch_add(payload.len(), Ordering::SeqCst);
        }
    }

    struct Acceptor(Arc<AtomicUsize>);
    impl AcceptHandler for Acceptor {
        fn on_accept(self: Rc<Self>, socket: Rc<AsyncSocket>) {
            socket.set_frame_handler(Rc::new(SlowFrameHandler(Arc::clone(&self.0))));
            socket.activate().unwrap();
        }
    }

    let (engine, handle) = single_loop_engine();
    let server_received = Arc::new(AtomicUsize::new(0));
    let server_received2 = Arc::clone(&server_received);

    let (tx, rx) = std::sync::mpsc::channel();
    handle
        .execute(move || {
            let server = AsyncServerSocket::open(
                "127.0.0.1:0".parse().unwrap(),
                128,
                EventLoop::current(|lp| lp.handle().clone()),
                4 * 1024 * 1024,
                16 * 1024 * 1024,
            )
            .unwrap();
            let addr = server.local_addr().unwrap();
            server.accept(Rc::new(Acceptor(server_received2))).unwrap();
            tx.send(addr).unwrap();
        })
        .unwrap();
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let payload_len = 64 * 1024;
    // Smaller than a single frame: the very first write already exceeds it,
    // guaranteeing a `false` without depending on flush timing.
    let backpressure_limit = 1024;
    let (result_tx, result_rx) = std::sync::mpsc::channel();

    handle
        .execute(move || {
            let loop_handle = EventLoop::current(|lp| lp.handle().clone());
            let client = AsyncSocket::connect(addr, loop_handle, backpressure_limit, 16 * 1024 * 1024).unwrap();
            client.set_frame_handler(Rc::new(SlowFrameHandler(Arc::new(AtomicUsize::new(0)))));
            client.activate().unwrap();

            let mut results = Vec::new();
            for _ in 0..8 {
                let buf = IoBuffer::with_capacity(HEADER_LEN + payload_len);
                frame::begin_frame(&buf, 0);
                buf.write_bytes(&vec![0u8; payload_len]);
                frame::construct_complete(&buf);
                buf.flip();
                results.push(client.write_and_flush(buf));
            }
            result_tx.send(results).unwrap();
        })
        .unwrap();

    let results = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(results.iter().any(|&ok| !ok), "expected at least one write to report backpressure");

    std::thread::sleep(Duration::from_millis(500));
    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    assert_eq!(server_received.load(Ordering::SeqCst), payload_len * 8);
}

// 6. Graceful shutdown: awaitTermination returns true and every outstanding
// future completes (observed here through its waker, since a `RequestFuture`
// can't be moved off the loop thread that owns it to be re-polled from the
// test thread once that thread has exited).
#[test]
fn graceful_shutdown_completes_outstanding_futures_with_shutdown() {
    use std::task::Wake;

    struct Directory;
    impl PartitionDirectory for Directory {
        fn partition_owner(&self, _partition_id: u64) -> Option<PartitionOwner> {
            Some(PartitionOwner::Local)
        }
    }

    // Never calls `reply`, so the request is still outstanding at shutdown.
    struct Stall;
    impl LocalDispatch for Stall {
        fn dispatch_local(self: Rc<Self>, _partition_id: u64, _call_id: i64, request: IoBuffer, _reply_to: LoopHandle) {
            request.release();
        }
    }

    struct SignalWaker(std::sync::mpsc::Sender<()>);
    impl Wake for SignalWaker {
        fn wake(self: Arc<Self>) {
            let _ = self.0.send(());
        }
    }

    let config = Config {
        loop_count: 1,
        ..Config::default()
    };
    let engine = TpcEngine::start_default(config).unwrap();
    let handle = engine.eventloop(0).clone();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (wake_tx, wake_rx) = std::sync::mpsc::channel();

    handle
        .execute(move || {
            EventLoop::current(|lp| lp.set_local_dispatch(Stall));
            let loop_handle = EventLoop::current(|lp| lp.handle().clone());
            let actor_ref = PartitionActorRef::new(Rc::new(Directory), vec![loop_handle.clone()], loop_handle, None);

            let mut future = actor_ref.submit(1, |buf| buf.write_bytes(b"x"));
            let waker = std::task::Waker::from(Arc::new(SignalWaker(wake_tx)));
            let mut cx = Context::from_waker(&waker);
            match Pin::new(&mut future).poll(&mut cx) {
                Poll::Ready(_) => panic!("Stall never replies; the future should still be pending"),
                Poll::Pending => {}
            }
            // `future` is dropped here; the `Requests` slot keeps its own
            // `Rc` clone of the shared state and wakes `waker` independently
            // when the loop's shutdown path fails every outstanding slot.
            ready_tx.send(()).unwrap();
        })
        .unwrap();

    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    engine.shutdown();
    let terminated = engine.await_termination(Duration::from_secs(5));

    assert!(terminated, "awaitTermination should return true after shutdown");
    assert!(
        wake_rx.recv_timeout(Duration::from_secs(1)).is_ok(),
        "outstanding request should have been woken by the shutdown path's fail_all"
    );
}
