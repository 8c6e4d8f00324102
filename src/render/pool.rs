//! Pull-based frame worker pool.
//!
//! One controller thread (the caller) owns the frame cursor and the completion count. Workers
//! announce themselves, then receive one [`FrameJob`] at a time in reply to each message they
//! send, so faster workers naturally take more frames.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    foundation::{
        core::FrameIndex,
        error::{FramesmithError, FramesmithResult, panic_message},
    },
    render::renderer::FrameRendererFactory,
};

/// One unit of work for one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameJob {
    pub frame_index: FrameIndex,
    pub output_path: PathBuf,
}

#[derive(Debug)]
enum WorkerMessage {
    Initialized { worker: usize },
    RenderedFrame { worker: usize, frame_index: FrameIndex },
    RenderError { worker: usize, error: String },
}

#[derive(Debug)]
enum WorkerCommand {
    Render(FrameJob),
    Stop,
}

#[derive(Clone, Debug)]
pub struct FramePoolConfig {
    pub frame_count: u64,
    pub worker_count: usize,
    /// Frames are written as `<index>.png` inside this directory.
    pub output_dir: PathBuf,
}

impl FramePoolConfig {
    pub fn validate(&self) -> FramesmithResult<()> {
        if self.worker_count == 0 {
            return Err(FramesmithError::validation(
                "number of frame renderer workers must be >= 1",
            ));
        }
        Ok(())
    }

    pub fn frame_path(&self, frame_index: FrameIndex) -> PathBuf {
        self.output_dir.join(format!("{}.png", frame_index.0))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_total: u64,
    pub frames_rendered: u64,
    pub workers_spawned: usize,
}

/// Worker threads spawned by [`render_frames`].
///
/// A failed batch returns while other workers may still be rendering. Whoever owns the output
/// directory must [`join`](Self::join) them before removing it; dropping joins as well.
#[derive(Debug, Default)]
pub struct FrameWorkers {
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl FrameWorkers {
    /// Workers that have not exited yet.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop workers from starting new frames and wait for the current ones to finish.
    pub fn join(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.cancel.store(true, Ordering::SeqCst);
        let mut waited = 0usize;
        for handle in self.handles.drain(..) {
            waited += 1;
            if handle.join().is_err() {
                tracing::warn!("frame worker thread panicked outside a frame");
            }
        }
        self.cancel.store(false, Ordering::SeqCst);
        tracing::debug!(workers = waited, "frame workers joined");
    }
}

impl Drop for FrameWorkers {
    fn drop(&mut self) {
        self.join();
    }
}

/// Render every frame in `[0, frame_count)` exactly once across `worker_count` threads.
///
/// `progress` is called with `(completed, total)` after each rendered frame. The first error
/// fails the batch immediately without waiting for in-flight frames; the spawned threads are
/// left in `workers`, which stops and joins them.
#[tracing::instrument(skip_all, fields(frames = cfg.frame_count, workers = cfg.worker_count))]
pub fn render_frames(
    factory: Arc<dyn FrameRendererFactory>,
    cfg: &FramePoolConfig,
    workers: &mut FrameWorkers,
    mut progress: impl FnMut(u64, u64),
) -> FramesmithResult<RenderStats> {
    cfg.validate()?;
    workers.join();
    let total = cfg.frame_count;
    let mut stats = RenderStats {
        frames_total: total,
        ..RenderStats::default()
    };
    if total == 0 {
        return Ok(stats);
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded::<WorkerMessage>();
    let mut commands = Vec::with_capacity(cfg.worker_count);
    for worker in 0..cfg.worker_count {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<WorkerCommand>();
        let events = events_tx.clone();
        let factory = Arc::clone(&factory);
        let cancel = Arc::clone(&workers.cancel);
        let handle = std::thread::Builder::new()
            .name(format!("framesmith-frame-{worker}"))
            .spawn(move || worker_loop(worker, factory, &cancel, cmd_rx, events))
            .map_err(|e| {
                FramesmithError::render(format!("failed to spawn frame worker {worker}: {e}"))
            })?;
        workers.handles.push(handle);
        commands.push(cmd_tx);
        stats.workers_spawned += 1;
    }
    // Only workers hold senders now, so a fully disconnected channel means they all exited.
    drop(events_tx);

    let mut next_frame_index = 0u64;
    let mut completed = 0u64;
    loop {
        let msg = events_rx.recv().map_err(|_| {
            FramesmithError::render(format!(
                "frame workers exited after {completed}/{total} frames"
            ))
        })?;

        let worker = match msg {
            WorkerMessage::Initialized { worker } => {
                tracing::debug!(worker, "frame worker ready");
                worker
            }
            WorkerMessage::RenderedFrame {
                worker,
                frame_index,
            } => {
                completed += 1;
                stats.frames_rendered = completed;
                tracing::debug!(worker, frame = %frame_index, "frame rendered");
                progress(completed, total);
                if completed == total {
                    for tx in &commands {
                        let _ = tx.send(WorkerCommand::Stop);
                    }
                    return Ok(stats);
                }
                worker
            }
            WorkerMessage::RenderError { worker, error } => {
                workers.cancel.store(true, Ordering::SeqCst);
                for tx in &commands {
                    let _ = tx.send(WorkerCommand::Stop);
                }
                return Err(FramesmithError::render(format!(
                    "frame worker {worker}: {error}"
                )));
            }
        };

        let command = if next_frame_index < total {
            let job = FrameJob {
                frame_index: FrameIndex(next_frame_index),
                output_path: cfg.frame_path(FrameIndex(next_frame_index)),
            };
            next_frame_index += 1;
            WorkerCommand::Render(job)
        } else {
            WorkerCommand::Stop
        };
        // A worker that already went away surfaces as a disconnect on the next recv.
        let _ = commands[worker].send(command);
    }
}

fn worker_loop(
    worker: usize,
    factory: Arc<dyn FrameRendererFactory>,
    cancel: &AtomicBool,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerMessage>,
) {
    let created = catch_unwind(AssertUnwindSafe(|| factory.create()));
    let mut renderer = match created {
        Ok(Ok(renderer)) => renderer,
        Ok(Err(e)) => {
            let _ = events.send(WorkerMessage::RenderError {
                worker,
                error: e.to_string(),
            });
            return;
        }
        Err(payload) => {
            let _ = events.send(WorkerMessage::RenderError {
                worker,
                error: format!("renderer setup panicked: {}", panic_message(payload.as_ref())),
            });
            return;
        }
    };

    if events.send(WorkerMessage::Initialized { worker }).is_err() {
        return;
    }

    while let Ok(WorkerCommand::Render(job)) = commands.recv() {
        if cancel.load(Ordering::SeqCst) {
            tracing::debug!(worker, frame = %job.frame_index, "batch cancelled, skipping frame");
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| {
            renderer.render_to_file(job.frame_index, &job.output_path)
        }));
        let msg = match result {
            Ok(Ok(())) => WorkerMessage::RenderedFrame {
                worker,
                frame_index: job.frame_index,
            },
            Ok(Err(e)) => WorkerMessage::RenderError {
                worker,
                error: format!("frame {}: {e}", job.frame_index),
            },
            Err(payload) => WorkerMessage::RenderError {
                worker,
                error: format!(
                    "frame {} panicked: {}",
                    job.frame_index,
                    panic_message(payload.as_ref())
                ),
            },
        };
        let failed = matches!(msg, WorkerMessage::RenderError { .. });
        if events.send(msg).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        path::Path,
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::render::renderer::FrameRenderer;

    #[derive(Default)]
    struct Recorder {
        created: AtomicUsize,
        rendered: Mutex<Vec<u64>>,
    }

    struct TestFactory {
        recorder: Arc<Recorder>,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
        delay: Duration,
    }

    struct TestRenderer {
        recorder: Arc<Recorder>,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
        delay: Duration,
    }

    impl FrameRendererFactory for TestFactory {
        fn create(&self) -> FramesmithResult<Box<dyn FrameRenderer>> {
            self.recorder.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestRenderer {
                recorder: Arc::clone(&self.recorder),
                fail_at: self.fail_at,
                panic_at: self.panic_at,
                delay: self.delay,
            }))
        }
    }

    impl FrameRenderer for TestRenderer {
        fn render_to_file(&mut self, frame_index: FrameIndex, out: &Path) -> FramesmithResult<()> {
            if self.panic_at == Some(frame_index.0) {
                panic!("boom at {}", frame_index.0);
            }
            if self.fail_at == Some(frame_index.0) {
                return Err(FramesmithError::render("bad frame"));
            }
            std::thread::sleep(self.delay);
            std::fs::write(out, frame_index.0.to_string()).map_err(anyhow::Error::from)?;
            self.recorder.rendered.lock().push(frame_index.0);
            Ok(())
        }
    }

    fn factory(fail_at: Option<u64>, panic_at: Option<u64>) -> (Arc<Recorder>, Arc<TestFactory>) {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(TestFactory {
            recorder: Arc::clone(&recorder),
            fail_at,
            panic_at,
            delay: Duration::ZERO,
        });
        (recorder, factory)
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("unit-scratch")
            .join(format!("pool-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cfg(name: &str, frame_count: u64, worker_count: usize) -> FramePoolConfig {
        FramePoolConfig {
            frame_count,
            worker_count,
            output_dir: scratch_dir(name),
        }
    }

    #[test]
    fn seven_workers_render_ten_frames_exactly_once() {
        let (recorder, factory) = factory(None, None);
        let cfg = cfg("seven", 10, 7);
        let mut seen = Vec::new();
        let stats = render_frames(factory, &cfg, &mut FrameWorkers::default(), |done, total| {
            seen.push((done, total))
        })
        .unwrap();

        assert_eq!(stats.frames_rendered, 10);
        assert_eq!(stats.workers_spawned, 7);
        let rendered = recorder.rendered.lock().clone();
        assert_eq!(rendered.len(), 10);
        assert_eq!(rendered.iter().copied().collect::<BTreeSet<_>>(), (0..10).collect());
        for i in 0..10 {
            assert!(cfg.frame_path(FrameIndex(i)).is_file());
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.last(), Some(&(10, 10)));
    }

    #[test]
    fn zero_frames_succeed_without_spawning() {
        let (recorder, factory) = factory(None, None);
        let stats =
            render_frames(factory, &cfg("zero", 0, 4), &mut FrameWorkers::default(), |_, _| {})
                .unwrap();
        assert_eq!(stats.frames_rendered, 0);
        assert_eq!(stats.workers_spawned, 0);
        assert_eq!(recorder.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn surplus_workers_are_stopped() {
        let (recorder, factory) = factory(None, None);
        let stats =
            render_frames(factory, &cfg("surplus", 2, 6), &mut FrameWorkers::default(), |_, _| {})
                .unwrap();
        assert_eq!(stats.frames_rendered, 2);
        assert_eq!(recorder.rendered.lock().len(), 2);
    }

    #[test]
    fn single_worker_renders_in_order() {
        let (recorder, factory) = factory(None, None);
        render_frames(factory, &cfg("single", 5, 1), &mut FrameWorkers::default(), |_, _| {})
            .unwrap();
        assert_eq!(*recorder.rendered.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn first_error_fails_the_batch() {
        let (_recorder, factory) = factory(Some(3), None);
        let err =
            render_frames(factory, &cfg("error", 10, 2), &mut FrameWorkers::default(), |_, _| {})
                .unwrap_err();
        assert!(matches!(err, FramesmithError::Render(_)));
        assert!(err.to_string().contains("frame 3: render error: bad frame"), "{err}");
    }

    #[test]
    fn worker_panics_become_render_errors() {
        let (_recorder, factory) = factory(None, Some(2));
        let err =
            render_frames(factory, &cfg("panic", 4, 3), &mut FrameWorkers::default(), |_, _| {})
                .unwrap_err();
        assert!(err.to_string().contains("frame 2 panicked: boom at 2"), "{err}");
    }

    #[test]
    fn zero_workers_are_rejected() {
        let (_recorder, factory) = factory(None, None);
        let mut workers = FrameWorkers::default();
        assert!(render_frames(factory, &cfg("noworkers", 3, 0), &mut workers, |_, _| {})
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn failures_return_before_slow_frames_finish() {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(TestFactory {
            recorder: Arc::clone(&recorder),
            fail_at: Some(0),
            panic_at: None,
            delay: Duration::from_millis(300),
        });
        let cfg = cfg("cancel", 20, 4);
        let mut workers = FrameWorkers::default();

        let started = Instant::now();
        render_frames(factory, &cfg, &mut workers, |_, _| {}).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(250));

        workers.join();
        assert_eq!(workers.running(), 0);
        // Each surviving worker finishes at most the frame it had already started.
        let rendered = recorder.rendered.lock().len();
        assert!(rendered <= 3, "{rendered} frames rendered after the batch failed");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.rendered.lock().len(), rendered);
    }

    #[test]
    fn workers_are_reusable_across_batches() {
        let (recorder, factory) = factory(None, None);
        let mut workers = FrameWorkers::default();
        let shared: Arc<dyn FrameRendererFactory> = factory.clone();
        render_frames(shared, &cfg("reuse-a", 3, 2), &mut workers, |_, _| {}).unwrap();
        render_frames(factory, &cfg("reuse-b", 3, 2), &mut workers, |_, _| {}).unwrap();
        assert_eq!(recorder.rendered.lock().len(), 6);
        drop(workers);
        assert_eq!(recorder.created.load(Ordering::SeqCst), 4);
    }
}
