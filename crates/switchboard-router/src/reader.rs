//! Downstream stream readers backing the server-stream bridges.
//!
//! The async reader owns a producer thread that drains the downstream
//! stream into a bounded pipe; the sync reader pulls the downstream
//! stream directly on the upstream worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use switchboard_client::ClientStub;
use switchboard_transport::{Metadata, MethodDescriptor, Status, StatusCode};

use crate::hooks::RouterHooks;
use crate::pipe::BoundedPipe;

fn pending_status() -> Status {
    Status::new(StatusCode::Unknown, "")
}

/// Reads a downstream server-stream on a dedicated producer thread,
/// buffering responses in a bounded pipe for the upstream event loop.
///
/// On downstream failure the pipe is cleared (to unblock a waiting
/// consumer), the terminal status is recorded, and the stub channel is
/// reset. The pipe is closed in every case once the downstream is done.
/// After [`AsyncStreamReader::stop`] returns, neither the pipe nor the
/// status changes again.
pub struct AsyncStreamReader<Resp> {
    pipe: Arc<BoundedPipe<Resp>>,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<Status>>,
    thread: Option<JoinHandle<()>>,
}

impl<Resp> AsyncStreamReader<Resp>
where
    Resp: Send + 'static,
{
    /// Spawns the producer thread and starts the downstream call.
    pub fn start<Req>(
        stub: Arc<ClientStub>,
        method: MethodDescriptor<Req, Resp>,
        req: Req,
        metadata: Metadata,
        capacity: usize,
        hooks: Arc<dyn RouterHooks>,
    ) -> Self
    where
        Req: Send + 'static,
    {
        let pipe = Arc::new(BoundedPipe::new(capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(pending_status()));

        let thread = {
            let pipe = pipe.clone();
            let stop = stop.clone();
            let status = status.clone();
            std::thread::spawn(move || {
                let result = stub.call_stream(
                    &method,
                    &req,
                    |resp| {
                        if stop.load(Ordering::SeqCst) {
                            return false;
                        }
                        pipe.push(resp) && !stop.load(Ordering::SeqCst)
                    },
                    &metadata,
                );
                match result {
                    Ok(()) => {
                        *status.lock().unwrap_or_else(|e| e.into_inner()) = Status::ok();
                    }
                    Err(e) => {
                        // Unblock a consumer stuck on pop before recording
                        // the terminal status.
                        pipe.clear();
                        let message = e.to_string();
                        *status.lock().unwrap_or_else(|e| e.into_inner()) =
                            Status::internal(message.clone());
                        stub.reset();
                        hooks.on_error(&message);
                    }
                }
                pipe.close();
            })
        };

        Self {
            pipe,
            stop,
            status,
            thread: Some(thread),
        }
    }

    /// Pops the next buffered response; `None` means the downstream is
    /// done (check [`AsyncStreamReader::status`] for how).
    pub fn read(&self) -> Option<Resp> {
        self.pipe.pop()
    }

    /// Terminal status of the downstream call; UNKNOWN while streaming.
    pub fn status(&self) -> Status {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stops the producer: sets the stop flag, clears the pipe so a
    /// blocked push returns, and joins the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            self.pipe.clear();
            let _ = thread.join();
        }
    }
}

impl<Resp> Drop for AsyncStreamReader<Resp> {
    // The producer thread must never outlive the reader.
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            self.pipe.clear();
            let _ = thread.join();
        }
    }
}

/// Reads a downstream server-stream directly on the calling thread.
///
/// Minimises threads and preserves ordering trivially, at the cost of
/// blocking the upstream worker on downstream reads.
pub struct SyncStreamReader<Resp> {
    stub: Arc<ClientStub>,
    call: Option<switchboard_client::StreamingCall<Resp>>,
    status: Status,
    hooks: Arc<dyn RouterHooks>,
}

impl<Resp> SyncStreamReader<Resp>
where
    Resp: Send + 'static,
{
    /// Opens the downstream stream.
    pub fn start<Req>(
        stub: Arc<ClientStub>,
        method: MethodDescriptor<Req, Resp>,
        req: &Req,
        metadata: Metadata,
        hooks: Arc<dyn RouterHooks>,
    ) -> Self {
        let mut reader = Self {
            stub: stub.clone(),
            call: None,
            status: pending_status(),
            hooks,
        };
        match stub.open_stream(&method, req, &metadata) {
            Ok(call) => reader.call = Some(call),
            Err(e) => {
                reader.status = Status::internal(e.to_string());
                reader.hooks.on_error(&e.to_string());
            }
        }
        reader
    }

    /// Blocks for the next downstream response; `None` means the stream
    /// ended and the terminal status is recorded.
    pub fn read(&mut self) -> Option<Resp> {
        let call = self.call.as_mut()?;
        match call.next() {
            Some(Ok(resp)) => Some(resp),
            Some(Err(e)) => {
                call.cancel();
                call.drain();
                let _ = call.finish();
                self.call = None;
                self.status = Status::internal(e.to_string());
                self.stub.reset();
                self.hooks.on_error(&e.to_string());
                None
            }
            None => {
                let status = call.finish();
                self.call = None;
                if status.is_ok() {
                    self.status = Status::ok();
                } else {
                    let message = format!(
                        "failed to make server-side stream call, err='{}'",
                        status.describe()
                    );
                    self.status = Status::internal(message.clone());
                    self.stub.reset();
                    self.hooks.on_error(&message);
                }
                None
            }
        }
    }

    /// Terminal status of the downstream call; UNKNOWN while streaming.
    pub fn status(&self) -> Status {
        self.status.clone()
    }

    /// Cancels and drains an in-progress downstream stream.
    pub fn stop(&mut self) {
        if let Some(mut call) = self.call.take() {
            call.cancel();
            call.drain();
            let status = call.finish();
            let message = format!(
                "server-side stream call stopped, err='{}'",
                status.describe()
            );
            self.status = Status::internal(message.clone());
            self.hooks.on_error(&message);
        }
    }
}
