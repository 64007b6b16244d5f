//! The page loop and its state machine.

use std::{
    cell::RefCell,
    fmt::Debug,
    future::{Future, ready},
    time::{Duration, Instant},
};

use keen_retry::{ResolvedResult, RetryResult};
use tokio_util::sync::CancellationToken;

use crate::{
    config::WorkflowConfig,
    prelude::*,
    progress::{PageTimings, ProgressSample},
    retry::{
        RetryPolicy, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_transient,
    },
    state::{CheckpointStore, ProgressRecord, RunStatus, StateError},
};

use super::{
    collaborators::{
        OcrEngine, PageCapture, PageImage, PagePreprocessor, PageWriter, ProgressSink,
        RecognitionResult,
    },
    error::{Step, StepError, WorkflowError, WorkflowState},
    summary::RunSummary,
};

/// Everything the page loop calls out to.
pub struct Collaborators {
    pub capture: Box<dyn PageCapture>,
    pub preprocessor: Box<dyn PagePreprocessor>,
    pub engine: Box<dyn OcrEngine>,
    pub writer: Box<dyn PageWriter>,
    pub sink: Box<dyn ProgressSink>,
}

/// How a step ended after all its attempts.
enum StepOutcome<T, E> {
    Done(T),
    Exhausted { attempts: u32, error: E },
}

/// How a page ended.
enum PageOutcome {
    Processed,
    Failed {
        step: Step,
        attempts: u32,
        error: StepError,
    },
    Interrupted,
}

/// Drives one subject from its first page to a terminal state.
///
/// A controller is single-use: `initialize` or `resume`, then `run_loop`.
pub struct WorkflowController {
    config: WorkflowConfig,
    policy: RetryPolicy,
    store: CheckpointStore,
    collaborators: Collaborators,
    cancel: CancellationToken,
    state: WorkflowState,
    subject_id: Option<String>,
    record: Option<ProgressRecord>,
    timings: PageTimings,
    consecutive_failures: u32,
    pages_since_checkpoint: u32,
    run_started: Option<Instant>,
    run_elapsed: Option<Duration>,
}

impl WorkflowController {
    pub fn new(
        config: WorkflowConfig,
        store: CheckpointStore,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            policy: RetryPolicy::from(&config),
            config,
            store,
            collaborators,
            cancel: CancellationToken::new(),
            state: WorkflowState::Idle,
            subject_id: None,
            record: None,
            timings: PageTimings::default(),
            consecutive_failures: 0,
            pages_since_checkpoint: 0,
            run_started: None,
            run_elapsed: None,
        }
    }

    /// A token which stops the run when cancelled. The loop notices before
    /// each step and each retry, saves its progress and ends `Aborted`.
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn record(&self) -> Option<&ProgressRecord> {
        self.record.as_ref()
    }

    /// Set up a fresh run. On failure nothing is persisted and the
    /// controller ends up `Failed`.
    #[instrument(level = "debug", skip(self))]
    pub async fn initialize(
        &mut self,
        subject_id: &str,
        total_pages: u32,
        start_page: u32,
    ) -> Result<(), WorkflowError> {
        self.transition("initialize", &[WorkflowState::Idle], WorkflowState::Initializing)?;
        self.subject_id = Some(subject_id.to_owned());
        match self.create_record(subject_id, total_pages, start_page).await {
            Ok(record) => {
                info!(
                    subject = subject_id,
                    start_page,
                    total_pages,
                    output = %record.output_location,
                    "Starting new run"
                );
                self.record = Some(record);
                Ok(())
            }
            Err(err) => {
                error!("{err}");
                self.state = WorkflowState::Failed;
                Err(err)
            }
        }
    }

    async fn create_record(
        &self,
        subject_id: &str,
        total_pages: u32,
        start_page: u32,
    ) -> Result<ProgressRecord, WorkflowError> {
        let init_error = |reason: String| WorkflowError::Initialization {
            subject_id: subject_id.to_owned(),
            reason,
        };

        match self.store.load(subject_id) {
            Ok(existing) if existing.status == RunStatus::InProgress => {
                return Err(init_error(format!(
                    "an unfinished run exists (page {} of {}); resume or delete it first",
                    existing.last_completed_page, existing.total_pages
                )));
            }
            Ok(existing) => {
                info!(status = %existing.status, "Replacing previous run");
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(init_error(err.to_string())),
        }

        // Check the page range before creating anything.
        ProgressRecord::new(subject_id, total_pages, start_page, "", "")
            .map_err(|err| init_error(err.to_string()))?;

        let collaborators = &self.collaborators;
        collaborators
            .engine
            .check_available()
            .await
            .map_err(|err| init_error(format!("{err:#}")))?;
        let capture_location = collaborators
            .capture
            .prepare(subject_id)
            .await
            .map_err(|err| init_error(format!("{err:#}")))?;
        collaborators
            .capture
            .establish(&capture_location)
            .await
            .map_err(|err| init_error(format!("{err:#}")))?;
        let output_location = collaborators.writer.destination(subject_id);

        let mut record = ProgressRecord::new(
            subject_id,
            total_pages,
            start_page,
            output_location,
            capture_location,
        )
        .map_err(|err| init_error(err.to_string()))?;
        self.store
            .save(&mut record)
            .map_err(|err| init_error(err.to_string()))?;

        // The output is only touched once the record exists, and the record
        // is removed again if the output cannot be prepared.
        if let Err(err) = collaborators.writer.prepare(&record.output_location).await {
            if let Err(delete_err) = self.store.delete(subject_id) {
                warn!("Could not remove checkpoint after failed setup: {delete_err}");
            }
            return Err(init_error(format!("{err:#}")));
        }
        Ok(record)
    }

    /// Pick up a saved run where it left off.
    #[instrument(level = "debug", skip(self))]
    pub async fn resume(&mut self, subject_id: &str) -> Result<(), WorkflowError> {
        self.transition("resume", &[WorkflowState::Idle], WorkflowState::Resuming)?;
        self.subject_id = Some(subject_id.to_owned());
        match self.load_resumable(subject_id).await {
            Ok(record) => {
                info!(
                    subject = subject_id,
                    next_page = record.next_page(),
                    total_pages = record.total_pages,
                    failed = record.failed_pages.len(),
                    "Resuming run"
                );
                self.record = Some(record);
                Ok(())
            }
            Err(err) => {
                error!("{err}");
                self.state = WorkflowState::Failed;
                Err(err)
            }
        }
    }

    async fn load_resumable(&self, subject_id: &str) -> Result<ProgressRecord, WorkflowError> {
        let resume_error = |reason: String| WorkflowError::Resume {
            subject_id: subject_id.to_owned(),
            reason,
        };
        let record = self
            .store
            .load(subject_id)
            .map_err(|err| resume_error(err.to_string()))?;
        if record.status != RunStatus::InProgress {
            return Err(resume_error(format!("the run is already {}", record.status)));
        }
        self.collaborators
            .engine
            .check_available()
            .await
            .map_err(|err| resume_error(format!("{err:#}")))?;
        self.collaborators
            .capture
            .establish(&record.capture_location)
            .await
            .map_err(|err| resume_error(format!("{err:#}")))?;
        // Nothing was checkpointed yet, so any text in the output predates
        // this run.
        if record.pages_concluded() == 0 {
            self.collaborators
                .writer
                .prepare(&record.output_location)
                .await
                .map_err(|err| resume_error(format!("{err:#}")))?;
        }
        Ok(record)
    }

    /// Process every remaining page, then complete the run.
    ///
    /// Returns [`WorkflowError::Interrupted`] if the run was stopped, and
    /// other errors if it failed. Either way, [`Self::summary`] describes the
    /// outcome.
    pub async fn run_loop(&mut self) -> Result<(), WorkflowError> {
        self.transition(
            "run",
            &[WorkflowState::Initializing, WorkflowState::Resuming],
            WorkflowState::Running,
        )?;
        self.run_started = Some(Instant::now());
        self.publish();
        self.run_pages().await
    }

    async fn run_pages(&mut self) -> Result<(), WorkflowError> {
        loop {
            let (page, destination) = match &self.record {
                Some(record) if !record.cursor_at_end() => {
                    (record.next_page(), record.output_location.clone())
                }
                Some(_) => break,
                None => {
                    return Err(WorkflowError::InvalidTransition {
                        action: "run",
                        state: self.state,
                    });
                }
            };
            if self.cancel.is_cancelled() {
                return Err(self.handle_interrupt().await);
            }

            let page_started = Instant::now();
            let outcome = self.process_page(page, &destination).await;
            let failed = match outcome {
                PageOutcome::Interrupted => return Err(self.handle_interrupt().await),
                PageOutcome::Processed => {
                    let took = page_started.elapsed();
                    self.conclude_page(page, |record| record.mark_processed(page));
                    self.consecutive_failures = 0;
                    self.timings.record(took);
                    if took > self.config.slow_page() {
                        warn!(page, seconds = took.as_secs(), "Slow page");
                    }
                    debug!(page, millis = took.as_millis() as u64, "Page done");
                    false
                }
                PageOutcome::Failed {
                    step,
                    attempts,
                    error,
                } => {
                    warn!(
                        page,
                        %step,
                        attempts,
                        "Giving up on page, skipping it: {error}"
                    );
                    self.conclude_page(page, |record| record.mark_failed(page));
                    self.consecutive_failures += 1;
                    true
                }
            };
            self.pages_since_checkpoint += 1;

            if self.consecutive_failures >= self.config.max_consecutive_failures {
                let err = WorkflowError::TooManyFailures {
                    count: self.consecutive_failures,
                    last_page: page,
                };
                return Err(self.fail(err).await);
            }
            if failed || self.pages_since_checkpoint >= self.config.checkpoint_interval {
                if let Err(err) = self.checkpoint().await {
                    return Err(self.fail(err).await);
                }
            }
            self.publish();
        }
        self.complete().await
    }

    fn conclude_page(&mut self, page: u32, mark: impl FnOnce(&mut ProgressRecord)) {
        if let Some(record) = self.record.as_mut() {
            mark(record);
            trace!(page, last_completed_page = record.last_completed_page, "Cursor advanced");
        }
    }

    /// Run all four steps for one page.
    async fn process_page(&self, page: u32, destination: &str) -> PageOutcome {
        macro_rules! step {
            ($step:expr, $attempt:expr) => {
                match run_with_retries(self.policy, $step, page, $attempt).await {
                    StepOutcome::Done(value) => value,
                    StepOutcome::Exhausted {
                        error: StepError::Interrupted,
                        ..
                    } => return PageOutcome::Interrupted,
                    StepOutcome::Exhausted { attempts, error } => {
                        return PageOutcome::Failed {
                            step: $step,
                            attempts,
                            error,
                        };
                    }
                }
            };
        }

        let captured = step!(Step::Capture, move |()| self.attempt_capture(page));
        let captured = &captured;
        let normalized =
            step!(Step::Preprocess, move |()| self.attempt_preprocess(captured));
        let normalized = &normalized;
        let recognized =
            step!(Step::Recognize, move |()| self.attempt_recognize(normalized));
        let text = page_text(page, &recognized.text);
        let text = text.as_str();
        step!(Step::Write, move |()| self.attempt_write(page, text, destination));
        PageOutcome::Processed
    }

    async fn attempt_capture(&self, page: u32) -> RetryResult<(), (), PageImage, StepError> {
        if self.cancel.is_cancelled() {
            return retry_result_fatal(StepError::Interrupted);
        }
        let image = try_transient!(self.collaborators.capture.capture(page).await);
        retry_result_ok(image)
    }

    async fn attempt_preprocess(
        &self,
        image: &PageImage,
    ) -> RetryResult<(), (), PageImage, StepError> {
        if self.cancel.is_cancelled() {
            return retry_result_fatal(StepError::Interrupted);
        }
        let normalized = try_transient!(self.collaborators.preprocessor.normalize(image).await);
        retry_result_ok(normalized)
    }

    async fn attempt_recognize(
        &self,
        image: &PageImage,
    ) -> RetryResult<(), (), RecognitionResult, StepError> {
        if self.cancel.is_cancelled() {
            return retry_result_fatal(StepError::Interrupted);
        }
        let engine = &self.collaborators.engine;
        let result = engine.recognize(image).await;
        if !result.success {
            let message = result
                .error_message
                .unwrap_or_else(|| format!("{} reported no reason", engine.name()));
            debug!(page = image.page, "Recognition failed: {message}");
            return retry_result_transient(StepError::Recognition(message));
        }
        if result.confidence < self.config.low_confidence_threshold {
            warn!(
                page = image.page,
                confidence = result.confidence,
                "Low recognition confidence"
            );
        }
        retry_result_ok(result)
    }

    async fn attempt_write(
        &self,
        page: u32,
        text: &str,
        destination: &str,
    ) -> RetryResult<(), (), (), StepError> {
        if self.cancel.is_cancelled() {
            return retry_result_fatal(StepError::Interrupted);
        }
        try_transient!(self.collaborators.writer.append(page, text, destination).await);
        retry_result_ok(())
    }

    /// Save the current record, retrying like any other step.
    async fn checkpoint(&mut self) -> Result<(), WorkflowError> {
        let Some(record) = self.record.as_mut() else {
            return Ok(());
        };
        let page = record.last_completed_page;
        let store = &self.store;
        let record = RefCell::new(record);
        let outcome = run_with_retries(self.policy, Step::Checkpoint, page, |()| {
            ready(save_attempt(store, &record))
        })
        .await;
        match outcome {
            StepOutcome::Done(()) => {
                self.pages_since_checkpoint = 0;
                Ok(())
            }
            StepOutcome::Exhausted { error, .. } => Err(WorkflowError::Persistence(error)),
        }
    }

    /// Stop the run, saving progress so it can be resumed.
    ///
    /// The record keeps its `in_progress` status. Returns the error the
    /// caller should propagate, normally [`WorkflowError::Interrupted`].
    pub async fn handle_interrupt(&mut self) -> WorkflowError {
        if self.state.is_terminal() {
            return WorkflowError::InvalidTransition {
                action: "interrupt",
                state: self.state,
            };
        }
        self.cancel.cancel();
        warn!("Interrupted, saving progress");
        let saved = self.checkpoint().await;
        self.state = WorkflowState::Aborted;
        self.finish_run("Interrupted");
        match saved {
            Ok(()) => WorkflowError::Interrupted,
            Err(err) => {
                error!("Could not save progress after interruption: {err}");
                err
            }
        }
    }

    /// End the run as failed, saving the failed status if we can.
    async fn fail(&mut self, err: WorkflowError) -> WorkflowError {
        error!("Run failed: {err}");
        if let Some(record) = self.record.as_mut() {
            record.set_status(RunStatus::Failed);
            if let Err(save_err) = self.checkpoint().await {
                error!("Could not save failed run: {save_err}");
            }
        }
        self.state = WorkflowState::Failed;
        self.finish_run("Failed");
        err
    }

    async fn complete(&mut self) -> Result<(), WorkflowError> {
        if let Some(record) = self.record.as_mut() {
            record.set_status(RunStatus::Completed);
        }
        if let Err(err) = self.checkpoint().await {
            error!("Could not save completed run: {err}");
            self.state = WorkflowState::Failed;
            self.finish_run("Failed");
            return Err(err);
        }
        self.state = WorkflowState::Completed;
        self.publish();
        self.finish_run("Completed");
        info!("Run completed");
        Ok(())
    }

    fn finish_run(&mut self, message: &str) {
        self.run_elapsed = self.run_started.map(|started| started.elapsed());
        self.collaborators.sink.finish(message);
    }

    /// Send a progress sample to the sink. Failures are only logged.
    fn publish(&self) {
        let Some(record) = &self.record else {
            return;
        };
        let sample = ProgressSample {
            record: record.clone(),
            elapsed: self
                .run_started
                .map(|started| started.elapsed())
                .unwrap_or_default(),
            timings: self.timings.clone(),
        };
        if let Err(err) = self.collaborators.sink.publish(&sample) {
            warn!("Could not publish progress: {err:#}");
        }
    }

    /// Describe the run as it stands.
    pub fn summary(&self) -> RunSummary {
        let elapsed = self
            .run_elapsed
            .or_else(|| self.run_started.map(|started| started.elapsed()))
            .unwrap_or_default();
        let subject_id = self.subject_id.clone().unwrap_or_default();
        match &self.record {
            Some(record) => RunSummary {
                subject_id,
                state: self.state,
                processed_count: record.processed_pages.len(),
                failed_pages: record.failed_pages.iter().copied().collect(),
                last_completed_page: record.last_completed_page,
                total_pages: record.total_pages,
                elapsed,
                resumable: record.status == RunStatus::InProgress,
            },
            None => RunSummary {
                subject_id,
                state: self.state,
                processed_count: 0,
                failed_pages: vec![],
                last_completed_page: 0,
                total_pages: 0,
                elapsed,
                resumable: false,
            },
        }
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[WorkflowState],
        to: WorkflowState,
    ) -> Result<(), WorkflowError> {
        if !from.contains(&self.state) {
            return Err(WorkflowError::InvalidTransition {
                action,
                state: self.state,
            });
        }
        debug!(from = %self.state, %to, "Workflow transition");
        self.state = to;
        Ok(())
    }
}

/// What we write for a page. Pages with no text get a placeholder, so the
/// output still shows where they were.
fn page_text(page: u32, text: &str) -> String {
    if text.trim().is_empty() {
        warn!(page, "No text detected");
        format!("[Page {page} - No text detected]")
    } else {
        text.to_owned()
    }
}

fn save_attempt(
    store: &CheckpointStore,
    record: &RefCell<&mut ProgressRecord>,
) -> RetryResult<(), (), (), StateError> {
    let mut record = record.borrow_mut();
    try_transient!(store.save(&mut **record));
    retry_result_ok(())
}

/// Run `attempt`, retrying transient failures according to `policy`.
async fn run_with_retries<T, E, F, Fut>(
    policy: RetryPolicy,
    step: Step,
    page: u32,
    mut attempt: F,
) -> StepOutcome<T, E>
where
    T: Debug,
    E: Debug,
    F: FnMut(()) -> Fut,
    Fut: Future<Output = RetryResult<(), (), T, E>>,
{
    let first = attempt(()).await;
    if policy.max_attempts <= 1 {
        return match first {
            RetryResult::Ok { output, .. } => StepOutcome::Done(output),
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                StepOutcome::Exhausted { attempts: 1, error }
            }
        };
    }

    let resolved = first
        .retry_with_async(attempt)
        .with_delays(policy.delays())
        .await;
    match resolved {
        ResolvedResult::Ok { output, .. } => StepOutcome::Done(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            info!(
                page,
                %step,
                "Succeeded after {} failed attempt(s): [{}]",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            StepOutcome::Done(output)
        }
        ResolvedResult::Fatal { error, .. } => StepOutcome::Exhausted { attempts: 1, error },
        ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => StepOutcome::Exhausted {
            attempts: retry_errors.len() as u32 + 1,
            error: fatal_error,
        },
        ResolvedResult::GivenUp { fatal_error, .. } => StepOutcome::Exhausted {
            attempts: policy.max_attempts,
            error: fatal_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeSet, HashMap, HashSet},
        sync::{Arc, Mutex},
    };

    use image::DynamicImage;
    use tempfile::TempDir;

    use super::*;
    use crate::workflow::collaborators::{CaptureError, PreprocessError, WriteError};

    /// Shared script and log for the fake collaborators.
    #[derive(Default)]
    struct Script {
        /// Pages whose capture fails this many times before succeeding.
        /// `u32::MAX` means always.
        capture_failures: HashMap<u32, u32>,
        /// Pages the engine reports `success = false` for, always.
        unrecognizable: HashSet<u32>,
        /// Pages the engine finds no text on.
        blank: HashSet<u32>,
        /// Cancel this token right after writing this page.
        interrupt_after: Option<(u32, CancellationToken)>,
        /// Replace the state directory with a plain file right after writing
        /// this page, so every later save fails.
        break_store_after: Option<(u32, PathBuf)>,
        /// Same, but while establishing the capture session.
        break_store_on_establish: Option<PathBuf>,
        establish_fails: bool,
        output_prepare_fails: bool,
        capture_calls: Vec<u32>,
        prepared: Vec<String>,
        written: Vec<(u32, String)>,
    }

    type Shared = Arc<Mutex<Script>>;

    struct FakeCapture(Shared);

    #[async_trait]
    impl PageCapture for FakeCapture {
        async fn prepare(&self, subject_id: &str) -> Result<String> {
            Ok(format!("shots/{subject_id}"))
        }

        async fn establish(&self, _capture_location: &str) -> Result<()> {
            let script = self.0.lock().unwrap();
            if let Some(state_dir) = &script.break_store_on_establish {
                break_store(state_dir);
            }
            if script.establish_fails {
                Err(anyhow!("viewer window not found"))
            } else {
                Ok(())
            }
        }

        async fn capture(&self, page: u32) -> Result<PageImage, CaptureError> {
            let mut script = self.0.lock().unwrap();
            script.capture_calls.push(page);
            if let Some(remaining) = script.capture_failures.get_mut(&page) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(CaptureError::NotReady {
                        page,
                        reason: "scripted failure".to_owned(),
                    });
                }
            }
            Ok(PageImage::new(page, DynamicImage::new_luma8(4, 4)))
        }
    }

    struct FakePreprocessor;

    #[async_trait]
    impl PagePreprocessor for FakePreprocessor {
        async fn normalize(&self, image: &PageImage) -> Result<PageImage, PreprocessError> {
            Ok(image.clone())
        }
    }

    struct FakeEngine(Shared);

    #[async_trait]
    impl OcrEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        async fn check_available(&self) -> Result<()> {
            Ok(())
        }

        async fn recognize(&self, image: &PageImage) -> RecognitionResult {
            let script = self.0.lock().unwrap();
            if script.unrecognizable.contains(&image.page) {
                RecognitionResult::failure("scripted failure")
            } else if script.blank.contains(&image.page) {
                RecognitionResult::success("", 0.9, vec![])
            } else {
                RecognitionResult::success(format!("text of page {}", image.page), 0.9, vec![])
            }
        }
    }

    struct FakeWriter(Shared);

    #[async_trait]
    impl PageWriter for FakeWriter {
        fn destination(&self, subject_id: &str) -> String {
            format!("out/{subject_id}.txt")
        }

        async fn prepare(&self, destination: &str) -> Result<()> {
            let mut script = self.0.lock().unwrap();
            if script.output_prepare_fails {
                return Err(anyhow!("output disk is read-only"));
            }
            script.prepared.push(destination.to_owned());
            Ok(())
        }

        async fn append(&self, page: u32, text: &str, _destination: &str) -> Result<(), WriteError> {
            let mut script = self.0.lock().unwrap();
            script.written.push((page, text.to_owned()));
            if let Some((after, state_dir)) = &script.break_store_after {
                if *after == page {
                    break_store(state_dir);
                }
            }
            if let Some((after, token)) = &script.interrupt_after {
                if *after == page {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    /// Logs `(sample cursor, persisted cursor)` for every publish.
    struct FakeSink {
        store: CheckpointStore,
        fail: bool,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl ProgressSink for FakeSink {
        fn publish(&self, sample: &ProgressSample) -> Result<()> {
            let persisted = self
                .store
                .load(&sample.record.subject_id)
                .map(|r| r.last_completed_page)
                .unwrap_or_default();
            self.seen
                .lock()
                .unwrap()
                .push((sample.record.last_completed_page, persisted));
            if self.fail {
                Err(anyhow!("display went away"))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        _tmp: TempDir,
        store: CheckpointStore,
        script: Shared,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::with_prefix("workflow").unwrap();
            let store = CheckpointStore::open(tmp.path().join("state")).unwrap();
            Self {
                _tmp: tmp,
                store,
                script: Shared::default(),
                seen: Arc::default(),
            }
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap()
        }

        fn controller(&self, config: WorkflowConfig) -> WorkflowController {
            self.controller_with_sink(config, false)
        }

        fn controller_with_sink(&self, config: WorkflowConfig, sink_fails: bool) -> WorkflowController {
            let collaborators = Collaborators {
                capture: Box::new(FakeCapture(self.script.clone())),
                preprocessor: Box::new(FakePreprocessor),
                engine: Box::new(FakeEngine(self.script.clone())),
                writer: Box::new(FakeWriter(self.script.clone())),
                sink: Box::new(FakeSink {
                    store: self.store.clone(),
                    fail: sink_fails,
                    seen: self.seen.clone(),
                }),
            };
            WorkflowController::new(config, self.store.clone(), collaborators)
        }

        fn written_pages(&self) -> Vec<u32> {
            self.script().written.iter().map(|(page, _)| *page).collect()
        }

        fn attempts_for(&self, page: u32) -> usize {
            self.script().capture_calls.iter().filter(|p| **p == page).count()
        }
    }

    /// Move the state directory aside and put a plain file in its place.
    fn break_store(state_dir: &Path) {
        std::fs::rename(state_dir, state_dir.with_extension("aside")).unwrap();
        std::fs::write(state_dir, "not a directory").unwrap();
    }

    /// Undo [`break_store`].
    fn restore_store(state_dir: &Path) {
        std::fs::remove_file(state_dir).unwrap();
        std::fs::rename(state_dir.with_extension("aside"), state_dir).unwrap();
    }

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            retry_delay_ms: 0,
            retry_delay_max_ms: 0,
            ..WorkflowConfig::default()
        }
    }

    fn pages(range: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        range.into_iter().collect()
    }

    #[tokio::test]
    async fn permanently_bad_page_is_skipped_and_run_completes() {
        let h = Harness::new();
        h.script().capture_failures.insert(6, u32::MAX);
        let mut c = h.controller(config());
        c.initialize("book", 10, 1).await.unwrap();
        c.run_loop().await.unwrap();

        assert_eq!(c.state(), WorkflowState::Completed);
        let record = h.store.load("book").unwrap();
        assert_eq!(record.processed_pages, pages([1, 2, 3, 4, 5, 7, 8, 9, 10]));
        assert_eq!(record.failed_pages, pages([6]));
        assert_eq!(record.last_completed_page, 10);
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(h.attempts_for(6), 3);
        assert_eq!(h.attempts_for(7), 1);
        assert_eq!(h.written_pages(), vec![1, 2, 3, 4, 5, 7, 8, 9, 10]);

        let summary = c.summary();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.failed_pages, vec![6]);
        assert!(!summary.resumable);
    }

    #[tokio::test]
    async fn single_attempt_policy_tries_once() {
        let h = Harness::new();
        h.script().capture_failures.insert(2, u32::MAX);
        let mut c = h.controller(WorkflowConfig {
            max_attempts: 1,
            ..config()
        });
        c.initialize("book", 3, 1).await.unwrap();
        c.run_loop().await.unwrap();
        assert_eq!(h.attempts_for(2), 1);
        assert_eq!(c.record().unwrap().failed_pages, pages([2]));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let h = Harness::new();
        h.script().capture_failures.insert(2, 2);
        let mut c = h.controller(config());
        c.initialize("book", 3, 1).await.unwrap();
        c.run_loop().await.unwrap();
        assert_eq!(h.attempts_for(2), 3);
        let record = c.record().unwrap();
        assert_eq!(record.processed_pages, pages(1..=3));
        assert!(record.failed_pages.is_empty());
    }

    #[tokio::test]
    async fn unsuccessful_recognition_is_a_page_failure() {
        let h = Harness::new();
        h.script().unrecognizable.insert(2);
        let mut c = h.controller(config());
        c.initialize("book", 3, 1).await.unwrap();
        c.run_loop().await.unwrap();
        let record = c.record().unwrap();
        assert_eq!(record.failed_pages, pages([2]));
        assert_eq!(record.processed_pages, pages([1, 3]));
        // The image is captured once; only recognition is retried.
        assert_eq!(h.attempts_for(2), 1);
    }

    #[tokio::test]
    async fn blank_pages_get_a_placeholder() {
        let h = Harness::new();
        h.script().blank.insert(1);
        let mut c = h.controller(config());
        c.initialize("book", 2, 1).await.unwrap();
        c.run_loop().await.unwrap();
        let written = h.script().written.clone();
        assert_eq!(written[0], (1, "[Page 1 - No text detected]".to_owned()));
        assert_eq!(written[1], (2, "text of page 2".to_owned()));
    }

    #[tokio::test]
    async fn consecutive_failures_abort_the_run() {
        let h = Harness::new();
        for page in [3, 4, 5] {
            h.script().capture_failures.insert(page, u32::MAX);
        }
        let mut c = h.controller(WorkflowConfig {
            max_consecutive_failures: 3,
            ..config()
        });
        c.initialize("book", 10, 1).await.unwrap();
        let err = c.run_loop().await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::TooManyFailures {
                count: 3,
                last_page: 5
            }
        ));
        assert_eq!(c.state(), WorkflowState::Failed);
        assert!(h.script().capture_calls.iter().all(|page| *page <= 5));
        let record = h.store.load("book").unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.last_completed_page, 5);
        assert_eq!(record.failed_pages, pages([3, 4, 5]));
        assert!(!h.store.can_resume("book"));
        assert_eq!(c.summary().exit_code(), 1);
    }

    #[tokio::test]
    async fn a_success_resets_the_failure_count() {
        let h = Harness::new();
        for page in [2, 3, 5, 6] {
            h.script().capture_failures.insert(page, u32::MAX);
        }
        let mut c = h.controller(WorkflowConfig {
            max_consecutive_failures: 3,
            ..config()
        });
        c.initialize("book", 7, 1).await.unwrap();
        c.run_loop().await.unwrap();
        assert_eq!(c.record().unwrap().failed_pages, pages([2, 3, 5, 6]));
    }

    #[tokio::test]
    async fn interrupt_after_page_four_saves_and_resumes_at_five() {
        let h = Harness::new();
        let mut c = h.controller(config());
        h.script().interrupt_after = Some((4, c.interrupt_handle()));
        c.initialize("book", 10, 1).await.unwrap();
        let err = c.run_loop().await.unwrap_err();

        assert!(matches!(err, WorkflowError::Interrupted));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(c.state(), WorkflowState::Aborted);
        assert!(c.summary().resumable);
        let saved = h.store.load("book").unwrap();
        assert_eq!(saved.last_completed_page, 4);
        assert_eq!(saved.status, RunStatus::InProgress);
        assert!(h.store.can_resume("book"));
        assert!(h.script().capture_calls.iter().all(|page| *page <= 4));

        h.script().interrupt_after = None;
        let mut resumed = h.controller(config());
        resumed.resume("book").await.unwrap();
        assert_eq!(resumed.record().unwrap().next_page(), 5);
        resumed.run_loop().await.unwrap();

        assert_eq!(h.written_pages(), (1..=10).collect::<Vec<_>>());
        let done = h.store.load("book").unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.processed_pages, pages(1..=10));
    }

    #[tokio::test]
    async fn resuming_gives_the_same_result_as_running_straight_through() {
        let straight = Harness::new();
        straight.script().capture_failures.insert(6, u32::MAX);
        let mut c = straight.controller(config());
        c.initialize("book", 10, 2).await.unwrap();
        c.run_loop().await.unwrap();
        let expected = straight.store.load("book").unwrap();

        let split = Harness::new();
        split.script().capture_failures.insert(6, u32::MAX);
        let mut first = split.controller(config());
        split.script().interrupt_after = Some((7, first.interrupt_handle()));
        first.initialize("book", 10, 2).await.unwrap();
        first.run_loop().await.unwrap_err();
        split.script().interrupt_after = None;
        let mut second = split.controller(config());
        second.resume("book").await.unwrap();
        second.run_loop().await.unwrap();
        let actual = split.store.load("book").unwrap();

        assert_eq!(actual.processed_pages, expected.processed_pages);
        assert_eq!(actual.failed_pages, expected.failed_pages);
        assert_eq!(actual.last_completed_page, 10);
        assert_eq!(split.written_pages(), straight.written_pages());
    }

    #[tokio::test]
    async fn interrupt_before_the_first_page_processes_nothing() {
        let h = Harness::new();
        let mut c = h.controller(config());
        c.initialize("book", 5, 1).await.unwrap();
        c.interrupt_handle().cancel();
        assert!(matches!(
            c.run_loop().await,
            Err(WorkflowError::Interrupted)
        ));
        assert!(h.script().capture_calls.is_empty());
        let saved = h.store.load("book").unwrap();
        assert_eq!(saved.last_completed_page, 0);
        assert_eq!(saved.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn checkpoints_follow_the_interval_and_every_failure() {
        let h = Harness::new();
        h.script().capture_failures.insert(6, u32::MAX);
        let mut c = h.controller(WorkflowConfig {
            checkpoint_interval: 4,
            ..config()
        });
        c.initialize("book", 10, 1).await.unwrap();
        c.run_loop().await.unwrap();

        let seen = h.seen.lock().unwrap().clone();
        assert_eq!(seen[0], (0, 0));
        for expected in [(3, 0), (4, 4), (5, 4), (6, 6), (9, 6), (10, 10)] {
            assert!(seen.contains(&expected), "missing {expected:?} in {seen:?}");
        }
        assert_eq!(seen.last(), Some(&(10, 10)));
    }

    #[tokio::test]
    async fn checkpoint_save_failure_fails_the_run() {
        let h = Harness::new();
        let state_dir = h.store.dir().to_owned();
        h.script().break_store_after = Some((3, state_dir.clone()));
        let mut c = h.controller(WorkflowConfig {
            checkpoint_interval: 1,
            ..config()
        });
        c.initialize("book", 10, 1).await.unwrap();
        let err = c.run_loop().await.unwrap_err();

        assert!(matches!(err, WorkflowError::Persistence(_)));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(c.state(), WorkflowState::Failed);
        assert!(h.script().capture_calls.iter().all(|page| *page <= 3));

        // The last good checkpoint is still there and can be resumed.
        restore_store(&state_dir);
        let saved = h.store.load("book").unwrap();
        assert_eq!(saved.last_completed_page, 2);
        assert_eq!(saved.status, RunStatus::InProgress);
        assert!(h.store.can_resume("book"));
    }

    #[tokio::test]
    async fn interrupt_reports_a_failed_save() {
        let h = Harness::new();
        let state_dir = h.store.dir().to_owned();
        let mut c = h.controller(WorkflowConfig {
            checkpoint_interval: 100,
            ..config()
        });
        {
            let mut script = h.script();
            script.interrupt_after = Some((4, c.interrupt_handle()));
            script.break_store_after = Some((4, state_dir.clone()));
        }
        c.initialize("book", 10, 1).await.unwrap();
        let err = c.run_loop().await.unwrap_err();

        assert!(matches!(err, WorkflowError::Persistence(_)));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(c.state(), WorkflowState::Aborted);

        restore_store(&state_dir);
        let saved = h.store.load("book").unwrap();
        assert_eq!(saved.last_completed_page, 0);
        assert_eq!(saved.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn sink_failures_do_not_fail_the_run() {
        let h = Harness::new();
        let mut c = h.controller_with_sink(config(), true);
        c.initialize("book", 3, 1).await.unwrap();
        c.run_loop().await.unwrap();
        assert_eq!(c.state(), WorkflowState::Completed);
    }

    #[tokio::test]
    async fn initialize_rejects_an_unfinished_run() {
        let h = Harness::new();
        let mut first = h.controller(config());
        first.initialize("book", 10, 1).await.unwrap();
        let before = h.store.load("book").unwrap();

        let mut second = h.controller(config());
        let err = second.initialize("book", 10, 1).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Initialization { .. }));
        assert_eq!(second.state(), WorkflowState::Failed);
        assert_eq!(h.store.load("book").unwrap(), before);
    }

    #[tokio::test]
    async fn initialize_replaces_a_finished_run() {
        let h = Harness::new();
        let mut first = h.controller(config());
        first.initialize("book", 2, 1).await.unwrap();
        first.run_loop().await.unwrap();

        let mut second = h.controller(config());
        second.initialize("book", 5, 3).await.unwrap();
        let record = h.store.load("book").unwrap();
        assert_eq!(record.status, RunStatus::InProgress);
        assert_eq!(record.start_page, 3);
        assert_eq!(record.last_completed_page, 2);
        assert!(record.processed_pages.is_empty());
    }

    #[tokio::test]
    async fn failed_initialization_persists_nothing() {
        let h = Harness::new();
        h.script().establish_fails = true;
        let mut c = h.controller(config());
        let err = c.initialize("book", 10, 1).await.unwrap_err();
        assert!(err.to_string().contains("viewer window not found"));
        assert_eq!(err.exit_code(), 1);
        assert!(h.store.load("book").unwrap_err().is_not_found());

        h.script().establish_fails = false;
        let mut c = h.controller(config());
        let err = c.initialize("book", 10, 11).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Initialization { .. }));
        assert!(h.store.load("book").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn output_is_prepared_only_after_the_record_is_saved() {
        let h = Harness::new();
        let state_dir = h.store.dir().to_owned();
        h.script().break_store_on_establish = Some(state_dir.clone());
        let mut c = h.controller(config());
        let err = c.initialize("book", 10, 1).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Initialization { .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(c.state(), WorkflowState::Failed);
        assert!(h.script().prepared.is_empty());
        restore_store(&state_dir);
        h.script().break_store_on_establish = None;
        assert!(h.store.load("book").unwrap_err().is_not_found());

        let mut c = h.controller(config());
        c.initialize("book", 10, 1).await.unwrap();
        assert_eq!(h.script().prepared, vec!["out/book.txt".to_owned()]);
    }

    #[tokio::test]
    async fn failing_to_prepare_output_removes_the_new_record() {
        let h = Harness::new();
        h.script().output_prepare_fails = true;
        let mut c = h.controller(config());
        let err = c.initialize("book", 10, 1).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Initialization { .. }));
        assert!(err.to_string().contains("read-only"));
        assert!(h.store.load("book").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resume_before_any_checkpointed_page_starts_a_fresh_output() {
        let h = Harness::new();
        let mut c = h.controller(config());
        c.initialize("book", 5, 1).await.unwrap();
        c.interrupt_handle().cancel();
        c.run_loop().await.unwrap_err();
        assert_eq!(h.script().prepared.len(), 1);

        let mut resumed = h.controller(config());
        resumed.resume("book").await.unwrap();
        assert_eq!(h.script().prepared.len(), 2);
        resumed.run_loop().await.unwrap();

        // Once pages are checkpointed, resuming appends instead.
        let mut record = ProgressRecord::new("other", 5, 1, "out/other.txt", "shots").unwrap();
        record.mark_processed(1);
        h.store.save(&mut record).unwrap();
        let mut again = h.controller(config());
        again.resume("other").await.unwrap();
        assert_eq!(h.script().prepared.len(), 2);
    }

    #[tokio::test]
    async fn resume_requires_an_unfinished_run() {
        let h = Harness::new();
        let mut c = h.controller(config());
        let err = c.resume("missing").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Resume { .. }));
        assert_eq!(c.state(), WorkflowState::Failed);
        assert_eq!(c.summary().exit_code(), 1);

        let mut done = h.controller(config());
        done.initialize("book", 1, 1).await.unwrap();
        done.run_loop().await.unwrap();
        let mut again = h.controller(config());
        assert!(matches!(
            again.resume("book").await,
            Err(WorkflowError::Resume { .. })
        ));
    }

    #[tokio::test]
    async fn resume_with_nothing_left_just_completes() {
        let h = Harness::new();
        let mut record = ProgressRecord::new("book", 2, 1, "out", "shots").unwrap();
        record.mark_processed(1);
        record.mark_processed(2);
        h.store.save(&mut record).unwrap();

        let mut c = h.controller(config());
        c.resume("book").await.unwrap();
        c.run_loop().await.unwrap();
        assert!(h.script().capture_calls.is_empty());
        assert_eq!(h.store.load("book").unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn controller_enforces_its_lifecycle() {
        let h = Harness::new();
        let mut c = h.controller(config());
        assert!(matches!(
            c.run_loop().await,
            Err(WorkflowError::InvalidTransition { action: "run", .. })
        ));
        c.initialize("book", 1, 1).await.unwrap();
        assert!(matches!(
            c.resume("book").await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        c.run_loop().await.unwrap();
        assert!(matches!(
            c.handle_interrupt().await,
            WorkflowError::InvalidTransition { .. }
        ));
        assert_eq!(c.state(), WorkflowState::Completed);
    }
}
