//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactError, ArtifactFuture};
use crate::bootcommand::{BackendFuture, KeyboardError, ScancodeSink};
use crate::communicator::{
    CommFuture, CommandCompletion, Communicator, CommunicatorError, FileMode, LocalCommunicator,
    RemoteCmd, SharedCommunicator,
};
use crate::process::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::readiness::{ConnectError, ConnectFuture, Connector};
use crate::state::{StateBag, StateKey};
use crate::step::{Action, Step, StepFuture};
use crate::ui::{SharedUi, Ui};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with stdout text.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            lock(&self.invocations).push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            lock(&self.responses)
                .pop_front()
                .ok_or_else(|| CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Kind of line captured by [`RecordingUi`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UiChannel {
    /// [`Ui::say`].
    Say,
    /// [`Ui::message`].
    Message,
    /// [`Ui::error`].
    Error,
}

/// UI double that keeps every line it is given.
#[derive(Clone, Debug, Default)]
pub struct RecordingUi {
    lines: Arc<Mutex<Vec<(UiChannel, String)>>>,
}

impl RecordingUi {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle suitable for the state bag; lines still land here.
    #[must_use]
    pub fn shared(&self) -> SharedUi {
        Arc::new(self.clone())
    }

    /// Every line in arrival order.
    #[must_use]
    pub fn lines(&self) -> Vec<(UiChannel, String)> {
        lock(&self.lines).clone()
    }

    fn channel(&self, wanted: UiChannel) -> Vec<String> {
        lock(&self.lines)
            .iter()
            .filter(|(channel, _)| *channel == wanted)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Lines passed to [`Ui::say`].
    #[must_use]
    pub fn said(&self) -> Vec<String> {
        self.channel(UiChannel::Say)
    }

    /// Lines passed to [`Ui::message`].
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.channel(UiChannel::Message)
    }

    /// Lines passed to [`Ui::error`].
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.channel(UiChannel::Error)
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        lock(&self.lines).push((UiChannel::Say, message.to_owned()));
    }

    fn message(&self, message: &str) {
        lock(&self.lines).push((UiChannel::Message, message.to_owned()));
    }

    fn error(&self, message: &str) {
        lock(&self.lines).push((UiChannel::Error, message.to_owned()));
    }
}

#[derive(Debug, Default)]
struct JournalEntries {
    runs: Vec<String>,
    cleanups: Vec<String>,
    observations: Vec<(String, Option<String>)>,
}

/// Shared log of what [`RecordingStep`]s did.
#[derive(Clone, Debug, Default)]
pub struct StepJournal {
    entries: Arc<Mutex<JournalEntries>>,
}

impl StepJournal {
    /// Names of steps whose `run` started, in order.
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        lock(&self.entries).runs.clone()
    }

    /// Names of steps whose `cleanup` ran, in order.
    #[must_use]
    pub fn cleanups(&self) -> Vec<String> {
        lock(&self.entries).cleanups.clone()
    }

    /// Values steps read from their observed key, with the reader's name.
    #[must_use]
    pub fn observations(&self) -> Vec<(String, Option<String>)> {
        lock(&self.entries).observations.clone()
    }
}

/// Step double that records its lifecycle in a [`StepJournal`].
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    journal: StepJournal,
    action: Action,
    cancel: Option<CancellationToken>,
    publish: Vec<(StateKey<String>, String)>,
    observe: Option<StateKey<String>>,
}

impl RecordingStep {
    /// Creates a step that returns [`Action::Continue`].
    #[must_use]
    pub fn new(name: impl Into<String>, journal: &StepJournal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            action: Action::Continue,
            cancel: None,
            publish: Vec::new(),
            observe: None,
        }
    }

    /// Makes `run` return `action`.
    #[must_use]
    pub const fn returning(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Makes `run` cancel `token` before returning.
    #[must_use]
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Makes `run` put `value` under `key`.
    #[must_use]
    pub fn publishing(mut self, key: StateKey<String>, value: &str) -> Self {
        self.publish.push((key, value.to_owned()));
        self
    }

    /// Makes `run` record the current value under `key` before publishing.
    #[must_use]
    pub const fn observing(mut self, key: StateKey<String>) -> Self {
        self.observe = Some(key);
        self
    }
}

impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            {
                let mut entries = lock(&self.journal.entries);
                entries.runs.push(self.name.clone());
                if let Some(key) = self.observe {
                    entries
                        .observations
                        .push((self.name.clone(), state.get_cloned(key)));
                }
            }
            for (key, value) in &self.publish {
                state.put(*key, value.clone());
            }
            if let Some(token) = &self.cancel {
                token.cancel();
            }
            self.action
        })
    }

    fn cleanup<'a>(&'a mut self, _state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.journal.entries).cleanups.push(self.name.clone());
        })
    }
}

/// File written through [`ScriptedCommunicator::upload`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadRecord {
    /// Destination path.
    pub path: String,
    /// Uploaded bytes as text.
    pub contents: String,
    /// Requested permissions.
    pub mode: FileMode,
}

#[derive(Debug)]
enum ScriptedStart {
    Complete(CommandCompletion),
    Fail(CommunicatorError),
}

#[derive(Debug, Default)]
struct CommunicatorLog {
    script: VecDeque<ScriptedStart>,
    commands: Vec<String>,
    uploads: Vec<UploadRecord>,
    files: BTreeMap<String, Vec<u8>>,
    dir_transfers: Vec<(String, String)>,
}

/// Communicator double: records every call and answers commands from a
/// FIFO script, defaulting to exit status 0 once the script runs out.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCommunicator {
    log: Arc<Mutex<CommunicatorLog>>,
}

impl ScriptedCommunicator {
    /// Creates a communicator with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a shared handle; calls are still recorded here.
    #[must_use]
    pub fn shared(&self) -> SharedCommunicator {
        Arc::new(self.clone())
    }

    /// Queues an exit code for the next started command.
    pub fn push_exit(&self, code: i32) {
        self.push_completion(CommandCompletion::exited(code));
    }

    /// Queues a dropped transport for the next started command.
    pub fn push_disconnect(&self) {
        self.push_completion(CommandCompletion::disconnected());
    }

    /// Queues a full completion for the next started command.
    pub fn push_completion(&self, completion: CommandCompletion) {
        lock(&self.log)
            .script
            .push_back(ScriptedStart::Complete(completion));
    }

    /// Makes the next `start` fail with `error`.
    pub fn push_start_error(&self, error: CommunicatorError) {
        lock(&self.log).script.push_back(ScriptedStart::Fail(error));
    }

    /// Seeds a file served by `download`.
    pub fn put_file(&self, path: &str, contents: &[u8]) {
        lock(&self.log)
            .files
            .insert(path.to_owned(), contents.to_vec());
    }

    /// Command lines passed to `start`, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.log).commands.clone()
    }

    /// Uploads in order.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadRecord> {
        lock(&self.log).uploads.clone()
    }

    /// Directory transfers as `(from, to)` pairs.
    #[must_use]
    pub fn dir_transfers(&self) -> Vec<(String, String)> {
        lock(&self.log).dir_transfers.clone()
    }
}

impl Communicator for ScriptedCommunicator {
    fn start<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        cmd: &'a mut RemoteCmd,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let next = {
                let mut log = lock(&self.log);
                log.commands.push(cmd.command().to_owned());
                log.script.pop_front()
            };
            match next {
                Some(ScriptedStart::Fail(err)) => Err(err),
                Some(ScriptedStart::Complete(completion)) => {
                    cmd.begin().complete(completion);
                    Ok(())
                }
                None => {
                    cmd.begin().complete(CommandCompletion::exited(0));
                    Ok(())
                }
            }
        })
    }

    fn upload<'a>(
        &'a self,
        path: &'a str,
        source: &'a mut (dyn AsyncRead + Send + Unpin),
        mode: FileMode,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let mut bytes = Vec::new();
            source
                .read_to_end(&mut bytes)
                .await
                .map_err(|err| CommunicatorError::Io {
                    path: path.to_owned(),
                    message: err.to_string(),
                })?;
            let mut log = lock(&self.log);
            log.uploads.push(UploadRecord {
                path: path.to_owned(),
                contents: String::from_utf8_lossy(&bytes).into_owned(),
                mode,
            });
            log.files.insert(path.to_owned(), bytes);
            Ok(())
        })
    }

    fn upload_dir<'a>(
        &'a self,
        destination: &'a str,
        source: &'a Utf8Path,
        _exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.log)
                .dir_transfers
                .push((source.to_string(), destination.to_owned()));
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        path: &'a str,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let bytes = lock(&self.log).files.get(path).cloned().ok_or_else(|| {
                CommunicatorError::Transfer {
                    path: path.to_owned(),
                    status: String::from("exit status 1"),
                    stderr: String::from("no such file"),
                }
            })?;
            sink.write_all(&bytes)
                .await
                .map_err(|err| CommunicatorError::Io {
                    path: path.to_owned(),
                    message: err.to_string(),
                })
        })
    }

    fn download_dir<'a>(
        &'a self,
        source: &'a str,
        destination: &'a Utf8Path,
        _exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.log)
                .dir_transfers
                .push((source.to_owned(), destination.to_string()));
            Ok(())
        })
    }
}

/// Connector double replaying scripted outcomes; once the script is
/// exhausted every attempt is a network failure.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Result<(), ConnectError>>>,
    attempts: AtomicU32,
    delay: Option<Duration>,
    communicator: Option<SharedCommunicatorSlot>,
}

#[derive(Clone)]
struct SharedCommunicatorSlot(SharedCommunicator);

impl std::fmt::Debug for SharedCommunicatorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedCommunicator")
    }
}

impl ScriptedConnector {
    /// Creates a connector replaying `script` in order.
    #[must_use]
    pub fn new(script: Vec<Result<(), ConnectError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Makes every attempt sleep `delay` before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hands out `comm` on success instead of a local communicator.
    #[must_use]
    pub fn yielding(mut self, comm: SharedCommunicator) -> Self {
        self.communicator = Some(SharedCommunicatorSlot(comm));
        self
    }

    /// Attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = lock(&self.script)
                .pop_front()
                .unwrap_or_else(|| Err(ConnectError::Network(String::from("script exhausted"))));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            outcome.map(|()| {
                self.communicator.as_ref().map_or_else(
                    || Arc::new(LocalCommunicator::new()) as SharedCommunicator,
                    |slot| slot.0.clone(),
                )
            })
        })
    }
}

#[derive(Debug, Default)]
struct SinkLog {
    batches: Vec<Vec<u8>>,
    calls: usize,
    fail_on: Option<usize>,
}

/// Scancode sink that records each batch; can be told to fail one call.
#[derive(Clone, Debug, Default)]
pub struct RecordingScancodeSink {
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingScancodeSink {
    /// Creates a sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the call with zero-based index `call` fail.
    #[must_use]
    pub fn failing_on(self, call: usize) -> Self {
        lock(&self.log).fail_on = Some(call);
        self
    }

    /// Accepted batches in order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<u8>> {
        lock(&self.log).batches.clone()
    }

    /// Accepted scancodes, flattened.
    #[must_use]
    pub fn codes(&self) -> Vec<u8> {
        lock(&self.log).batches.concat()
    }
}

impl ScancodeSink for RecordingScancodeSink {
    fn send_scancodes<'a>(&'a mut self, codes: &'a [u8]) -> BackendFuture<'a> {
        let result = {
            let mut log = lock(&self.log);
            let call = log.calls;
            log.calls += 1;
            if log.fail_on == Some(call) {
                Err(KeyboardError(String::from("keyboard unplugged")))
            } else {
                log.batches.push(codes.to_vec());
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

/// Artifact double that counts how often it was destroyed.
#[derive(Clone, Debug)]
pub struct RecordingArtifact {
    builder: String,
    id: String,
    files: Vec<Utf8PathBuf>,
    destroyed: Arc<AtomicU32>,
    fail_destroy: bool,
}

impl RecordingArtifact {
    /// Creates an artifact produced by `builder` with identifier `id`.
    #[must_use]
    pub fn new(builder: &str, id: &str) -> Self {
        Self {
            builder: builder.to_owned(),
            id: id.to_owned(),
            files: Vec::new(),
            destroyed: Arc::new(AtomicU32::new(0)),
            fail_destroy: false,
        }
    }

    /// Adds owned files.
    #[must_use]
    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().copied().map(Utf8PathBuf::from).collect();
        self
    }

    /// Makes [`Artifact::destroy`] fail.
    #[must_use]
    pub const fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// Number of destroy calls seen by this artifact and its clones.
    #[must_use]
    pub fn destroyed(&self) -> u32 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Artifact for RecordingArtifact {
    fn builder_id(&self) -> &str {
        &self.builder
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    fn destroy(&self) -> ArtifactFuture<'_, ()> {
        Box::pin(async move {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy {
                return Err(ArtifactError::Destroy {
                    id: self.id.clone(),
                    message: String::from("still in use"),
                });
            }
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
