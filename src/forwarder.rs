// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{error::Error, frame::Frame, queue::FrameQueue};
use log::{debug, error};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

/// Receives frames from a streaming bridge.
///
/// The callback runs on the forwarder thread.  Every frame handed over
/// is owned by the listener, dropping it releases the buffer.
pub trait FrameListener: Send {
    fn on_frame(&mut self, frame: Frame);
}

impl<F> FrameListener for F
where
    F: FnMut(Frame) + Send,
{
    fn on_frame(&mut self, frame: Frame) {
        self(frame)
    }
}

type SharedListener = Arc<Mutex<Option<Box<dyn FrameListener>>>>;

/// Upper bound on how long the worker sleeps before rechecking its
/// running flag.
const WORKER_POLL: Duration = Duration::from_millis(100);

struct Worker {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

/// Hands queued frames to a registered listener on a background thread.
pub struct FrameForwarder {
    queue: Arc<FrameQueue>,
    listener: SharedListener,
    attached: AtomicBool,
    started: AtomicBool,
    worker: Mutex<Option<Worker>>,
    worker_id: Arc<Mutex<Option<ThreadId>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn worker_loop(queue: Arc<FrameQueue>, listener: SharedListener, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match queue.blocking_dequeue(WORKER_POLL) {
            Some(frame) => {
                let mut listener = lock(&listener);
                match listener.as_mut() {
                    Some(listener) => listener.on_frame(frame),
                    None => drop(frame),
                }
            }
            // queue stopped for a listener swap
            None if !queue.is_accepting() => {
                queue.wait_accepting(WORKER_POLL);
            }
            None => {}
        }
    }
    debug!("frame forwarder thread exit");
}

impl FrameForwarder {
    pub fn new(queue: Arc<FrameQueue>) -> FrameForwarder {
        FrameForwarder {
            queue,
            listener: Arc::new(Mutex::new(None)),
            attached: AtomicBool::new(false),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
            worker_id: Arc::new(Mutex::new(None)),
        }
    }

    fn on_worker_thread(&self) -> bool {
        *lock(&self.worker_id) == Some(thread::current().id())
    }

    /// Registers a listener, replacing the current one, or detaches it
    /// with `None`.  Returns once a callback in progress has completed.
    /// Registering from inside the listener callback is refused.
    pub fn register_listener(
        &self,
        listener: Option<Box<dyn FrameListener>>,
    ) -> Result<(), Error> {
        if self.on_worker_thread() {
            return Err(Error::Argument(
                "cannot register a frame listener from its own callback".to_string(),
            ));
        }

        let was_accepting = self.queue.stop();
        match listener {
            Some(listener) => {
                *lock(&self.listener) = Some(listener);
                self.attached.store(true, Ordering::Release);
                if self.started.load(Ordering::Acquire) {
                    self.spawn_worker()?;
                }
            }
            None => {
                self.stop_worker();
                *lock(&self.listener) = None;
                self.attached.store(false, Ordering::Release);
            }
        }
        if was_accepting {
            self.queue.start();
        }
        Ok(())
    }

    pub fn has_listener(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Starts forwarding if a listener is registered.
    pub fn start(&self) -> Result<(), Error> {
        self.started.store(true, Ordering::Release);
        if self.has_listener() {
            self.spawn_worker()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.stop_worker();
    }

    fn spawn_worker(&self) -> Result<(), Error> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let queue = self.queue.clone();
            let listener = self.listener.clone();
            let running = running.clone();
            let worker_id = self.worker_id.clone();
            thread::Builder::new()
                .name("frame-forwarder".to_string())
                .spawn(move || {
                    *lock(&worker_id) = Some(thread::current().id());
                    worker_loop(queue, listener, running);
                })?
        };
        *lock(&self.worker_id) = Some(handle.thread().id());
        *worker = Some(Worker { handle, running });
        Ok(())
    }

    fn stop_worker(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        self.queue.wake();

        if worker.handle.thread().id() == thread::current().id() {
            // stopped from inside the callback, the thread exits on its own
            return;
        }
        if worker.handle.join().is_err() {
            error!("frame forwarder thread panicked");
        }
        *lock(&self.worker_id) = None;
    }
}

impl Drop for FrameForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}
