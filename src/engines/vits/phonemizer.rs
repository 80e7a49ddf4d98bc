use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::channel::ChannelFactory;
use super::espeak::{EspeakLibrary, PhonemeTrace, DEFAULT_VOICE};
use super::model::VitsError;
use super::vocab::PAD;

/// Upper bound on a single native phonemization call.
pub const DEFAULT_PHONEMIZE_TIMEOUT: Duration = Duration::from_secs(10);

// Held around tracer construction, every trace and teardown, across all
// extractors in the process.
static NATIVE_LOCK: Mutex<()> = Mutex::new(());

fn native_lock() -> MutexGuard<'static, ()> {
    NATIVE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Phonetic transcriptions for one input text, one entry per sentence.
///
/// Extraction never fails outright: native errors become `warnings` and the
/// sentence list is left empty or short.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub sentences: Vec<String>,
    pub warnings: Vec<String>,
}

impl Extraction {
    fn failed(warning: String) -> Self {
        Self {
            sentences: Vec::new(),
            warnings: vec![warning],
        }
    }

    /// True when something went wrong and fewer sentences than expected may
    /// have been produced.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }
}

/// Text to per-sentence phonetic transcriptions.
pub trait Phonemize {
    fn extract(&self, text: &str) -> Extraction;
}

struct Job {
    text: String,
    reply: mpsc::Sender<Extraction>,
}

/// espeak-ng backed [`Phonemize`] implementation.
///
/// Each extractor owns an `espeak-worker` thread; calls from any thread are
/// queued to it and answered one at a time, and each call waits at most
/// `timeout` for its answer. Native calls from all workers in the process are
/// serialized, so several extractors never enter the library at once.
pub struct PhonemeExtractor {
    jobs: mpsc::Sender<Job>,
    channels: ChannelFactory,
    timeout: Duration,
}

impl PhonemeExtractor {
    /// Load libespeak-ng and select `voice` (default `en-us`).
    ///
    /// Fails if the library cannot be loaded, initialized, or the voice set.
    pub fn new(
        library_dir: Option<&Path>,
        data_dir: Option<&Path>,
        voice: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, VitsError> {
        let library_dir: Option<PathBuf> = library_dir.map(Path::to_path_buf);
        let data_dir: Option<PathBuf> = data_dir.map(Path::to_path_buf);
        let voice = voice.unwrap_or(DEFAULT_VOICE).to_string();

        Self::spawn(
            move || EspeakLibrary::load(library_dir.as_deref(), data_dir.as_deref(), &voice),
            ChannelFactory::default(),
            timeout,
        )
    }

    /// Start the worker with any tracer. `init` runs on the worker thread and
    /// its error, if any, is returned here.
    pub fn spawn<T, F>(
        init: F,
        channels: ChannelFactory,
        timeout: Duration,
    ) -> Result<Self, VitsError>
    where
        T: PhonemeTrace + 'static,
        F: FnOnce() -> Result<T, VitsError> + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), VitsError>>();
        let worker_channels = channels.clone();

        thread::Builder::new()
            .name("espeak-worker".to_string())
            .spawn(move || {
                let initialized = {
                    let _native = native_lock();
                    init()
                };
                let tracer = match initialized {
                    Ok(tracer) => {
                        let _ = ready_tx.send(Ok(()));
                        tracer
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for job in job_rx {
                    let extraction = panic::catch_unwind(AssertUnwindSafe(|| {
                        extract_with(&tracer, &worker_channels, &job.text)
                    }))
                    .unwrap_or_else(|_| {
                        log::error!("Phonemizer panicked on {:?}", job.text);
                        Extraction::failed("phonemizer panicked".to_string())
                    });
                    // The caller may have timed out already.
                    let _ = job.reply.send(extraction);
                }

                let _native = native_lock();
                drop(tracer);
                log::debug!("espeak worker exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                jobs: job_tx,
                channels,
                timeout,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VitsError::WorkerUnavailable),
        }
    }

    /// Output channels currently open on the worker.
    pub fn open_channels(&self) -> usize {
        self.channels.open_channels()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Phonemize for PhonemeExtractor {
    fn extract(&self, text: &str) -> Extraction {
        if text.trim().is_empty() {
            return Extraction::default();
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        let job = Job {
            text: text.to_string(),
            reply: reply_tx,
        };
        if self.jobs.send(job).is_err() {
            log::error!("Phonemizer worker is gone, dropping {text:?}");
            return Extraction::failed(VitsError::WorkerUnavailable.to_string());
        }

        match reply_rx.recv_timeout(self.timeout) {
            Ok(extraction) => extraction,
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "Phonemization timed out after {:?} for {text:?}",
                    self.timeout
                );
                Extraction::failed(format!(
                    "phonemization timed out after {:?}",
                    self.timeout
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("Phonemizer worker stopped while handling {text:?}");
                Extraction::failed(VitsError::WorkerUnavailable.to_string())
            }
        }
    }
}

fn extract_with<T: PhonemeTrace>(tracer: &T, channels: &ChannelFactory, text: &str) -> Extraction {
    let mut warnings = Vec::new();

    let input = if text.contains('\0') {
        log::warn!("Stripping NUL bytes from phonemizer input");
        warnings.push("input contained NUL bytes".to_string());
        text.replace('\0', "")
    } else {
        text.to_string()
    };
    let input = match CString::new(input) {
        Ok(input) => input,
        Err(e) => return Extraction::failed(format!("invalid phonemizer input: {e}")),
    };

    let bytes = match trace_to_bytes(tracer, channels, &input) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Error in phonemization: {e}");
            warnings.push(e.to_string());
            return Extraction {
                sentences: Vec::new(),
                warnings,
            };
        }
    };

    let raw = String::from_utf8(bytes).unwrap_or_else(|e| {
        log::warn!("Phonemizer produced invalid UTF-8: {e}");
        warnings.push("phonemizer output was not valid UTF-8".to_string());
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    });
    log::debug!("Phonemes: {raw:?}");

    Extraction {
        sentences: split_sentences(&clean_phonemes(&raw)),
        warnings,
    }
}

fn trace_to_bytes<T: PhonemeTrace>(
    tracer: &T,
    channels: &ChannelFactory,
    input: &CString,
) -> Result<Vec<u8>, VitsError> {
    // Dropped, and the stream closed, on every return path.
    let mut channel = channels.acquire()?;
    {
        let _native = native_lock();
        tracer.trace_phonemes(input, channel.stream())?;
    }
    Ok(channel.read_all()?)
}

/// Normalize raw espeak-ng trace output.
///
/// Applied in order: trim; terminate each line with `.`; collapse double
/// spaces; collapse runs of `_`; drop `_` before a space. Works around
/// espeak-ng issue #694 (duplicated boundary markers across lines).
pub fn clean_phonemes(raw: &str) -> String {
    let terminated = raw.trim().replace('\n', ".\n").replace("  ", " ");
    collapse_runs(&terminated, PAD).replace("_ ", " ")
}

/// Split cleaned phonemes into sentences, one per line, skipping lines with
/// nothing to pronounce.
pub fn split_sentences(cleaned: &str) -> Vec<String> {
    cleaned
        .lines()
        .map(str::trim)
        .filter(|line| !is_blank_sentence(line))
        .map(str::to_string)
        .collect()
}

fn collapse_runs(text: &str, symbol: char) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_was_symbol = false;
    for ch in text.chars() {
        let is_symbol = ch == symbol;
        if !(is_symbol && previous_was_symbol) {
            out.push(ch);
        }
        previous_was_symbol = is_symbol;
    }
    out
}

fn is_blank_sentence(line: &str) -> bool {
    line.chars().all(|c| c == '.' || c == PAD || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::{
        clean_phonemes, split_sentences, Extraction, PhonemeExtractor, Phonemize,
        DEFAULT_PHONEMIZE_TIMEOUT,
    };
    use crate::engines::vits::channel::{CFile, ChannelFactory, ChannelKind};
    use crate::engines::vits::espeak::PhonemeTrace;
    use crate::engines::vits::model::VitsError;
    use std::ffi::{CStr, CString};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Writes a fixed transcription, optionally failing afterwards.
    struct ScriptedTrace {
        output: CString,
        fail: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedTrace {
        fn new(output: &str) -> Self {
            Self {
                output: CString::new(output).unwrap(),
                fail: false,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PhonemeTrace for ScriptedTrace {
        fn trace_phonemes(&self, _text: &CStr, stream: *mut CFile) -> Result<(), VitsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            unsafe { libc::fputs(self.output.as_ptr(), stream) };
            if self.fail {
                return Err(VitsError::PhonemizerFailed("espeak_Synth returned 1".into()));
            }
            Ok(())
        }
    }

    fn extractor<T>(trace: T, timeout: Duration) -> PhonemeExtractor
    where
        T: PhonemeTrace + Send + 'static,
    {
        PhonemeExtractor::spawn(move || Ok(trace), ChannelFactory::default(), timeout).unwrap()
    }

    /// Records how many tracers are inside a native call at the same time.
    struct ExclusiveTrace {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl PhonemeTrace for ExclusiveTrace {
        fn trace_phonemes(&self, _text: &CStr, stream: *mut CFile) -> Result<(), VitsError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            unsafe { libc::fputs(c"ə".as_ptr(), stream) };
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn cleanup_steps_apply_in_order() {
        assert_eq!(clean_phonemes("  a__b  c_ d\n"), "a_b c d");
        assert_eq!(clean_phonemes("a___ b"), "a b");
        assert_eq!(clean_phonemes("həlˈoʊ\nwˈɜːld"), "həlˈoʊ.\nwˈɜːld");
    }

    #[test]
    fn splits_on_remaining_line_breaks() {
        let cleaned = clean_phonemes("həlˈoʊ wˈɜːld\nhˈaʊ ɑːɹ juː\n");
        assert_eq!(
            split_sentences(&cleaned),
            vec!["həlˈoʊ wˈɜːld.".to_string(), "hˈaʊ ɑːɹ juː".to_string()]
        );
    }

    #[test]
    fn blank_lines_do_not_become_sentences() {
        let cleaned = clean_phonemes("a\n\n_\nb");
        assert_eq!(split_sentences(&cleaned), vec!["a.", "b"]);
        assert!(split_sentences(&clean_phonemes("")).is_empty());
        assert!(split_sentences(&clean_phonemes("\n\n")).is_empty());
    }

    #[test]
    fn two_sentence_text_yields_two_transcriptions() {
        let extractor = extractor(
            ScriptedTrace::new("həlˈoʊ wˈɜːld\nhˈaʊ ɑːɹ juː\n"),
            DEFAULT_PHONEMIZE_TIMEOUT,
        );
        let extraction = extractor.extract("Hello world. How are you?");
        assert!(!extraction.is_degraded());
        assert_eq!(extraction.sentences.len(), 2);
    }

    #[test]
    fn empty_text_skips_the_native_call() {
        let trace = ScriptedTrace::new("x");
        let calls = Arc::clone(&trace.calls);
        let extractor = extractor(trace, DEFAULT_PHONEMIZE_TIMEOUT);
        assert_eq!(extractor.extract("   "), Extraction::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn native_failure_degrades_to_empty_with_warning() {
        let mut trace = ScriptedTrace::new("partial");
        trace.fail = true;
        let extractor = extractor(trace, DEFAULT_PHONEMIZE_TIMEOUT);
        let extraction = extractor.extract("Hello");
        assert!(extraction.is_empty());
        assert!(extraction.is_degraded());
        assert!(extraction.warnings[0].contains("espeak_Synth"));
    }

    #[test]
    fn channels_are_released_after_every_call() {
        for kind in [ChannelKind::native(), ChannelKind::TempFile] {
            let trace = ScriptedTrace::new("tˈɛst\n");
            let calls = Arc::clone(&trace.calls);
            let failing = {
                let mut t = ScriptedTrace::new("tˈɛst");
                t.fail = true;
                t
            };

            let ok = PhonemeExtractor::spawn(
                move || Ok(trace),
                ChannelFactory::new(kind),
                DEFAULT_PHONEMIZE_TIMEOUT,
            )
            .unwrap();
            let bad = PhonemeExtractor::spawn(
                move || Ok(failing),
                ChannelFactory::new(kind),
                DEFAULT_PHONEMIZE_TIMEOUT,
            )
            .unwrap();

            for _ in 0..32 {
                assert_eq!(ok.extract("test").sentences, vec!["tˈɛst"]);
                assert!(bad.extract("test").is_degraded());
            }
            assert_eq!(calls.load(Ordering::SeqCst), 32);
            assert_eq!(ok.open_channels(), 0);
            assert_eq!(bad.open_channels(), 0);
        }
    }

    #[test]
    fn slow_native_call_times_out() {
        let mut trace = ScriptedTrace::new("slow");
        trace.delay = Duration::from_millis(300);
        let extractor = extractor(trace, Duration::from_millis(20));
        let extraction = extractor.extract("Hello");
        assert!(extraction.is_empty());
        assert!(extraction.warnings[0].contains("timed out"));
    }

    #[test]
    fn nul_bytes_are_stripped_with_warning() {
        let extractor = extractor(ScriptedTrace::new("ə"), DEFAULT_PHONEMIZE_TIMEOUT);
        let extraction = extractor.extract("a\0b");
        assert_eq!(extraction.sentences, vec!["ə"]);
        assert!(extraction.is_degraded());
    }

    #[test]
    fn construction_error_surfaces_from_worker() {
        let result = PhonemeExtractor::spawn(
            || Err::<ScriptedTrace, _>(VitsError::EspeakNotFound),
            ChannelFactory::default(),
            DEFAULT_PHONEMIZE_TIMEOUT,
        );
        assert!(matches!(result, Err(VitsError::EspeakNotFound)));
    }

    #[test]
    fn extractor_can_be_shared_between_threads() {
        let extractor = Arc::new(extractor(
            ScriptedTrace::new("ʃˈɛɹd\n"),
            DEFAULT_PHONEMIZE_TIMEOUT,
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let extractor = Arc::clone(&extractor);
                std::thread::spawn(move || extractor.extract("shared").sentences)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec!["ʃˈɛɹd"]);
        }
        assert_eq!(extractor.open_channels(), 0);
    }

    #[test]
    fn separate_extractors_never_trace_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let extractors: Vec<Arc<PhonemeExtractor>> = (0..2)
            .map(|_| {
                let trace = ExclusiveTrace {
                    active: Arc::clone(&active),
                    peak: Arc::clone(&peak),
                };
                Arc::new(extractor(trace, DEFAULT_PHONEMIZE_TIMEOUT))
            })
            .collect();

        let handles: Vec<_> = extractors
            .iter()
            .cycle()
            .take(4)
            .map(|extractor| {
                let extractor = Arc::clone(extractor);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        assert_eq!(extractor.extract("a").sentences, vec!["ə"]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_one_extractor_leaves_the_other_working() {
        let first = extractor(ScriptedTrace::new("wˈʌn\n"), DEFAULT_PHONEMIZE_TIMEOUT);
        let second = extractor(ScriptedTrace::new("tˈuː\n"), DEFAULT_PHONEMIZE_TIMEOUT);
        assert_eq!(first.extract("one").sentences, vec!["wˈʌn"]);
        drop(first);
        assert_eq!(second.extract("two").sentences, vec!["tˈuː"]);
    }

    #[test]
    fn real_espeak_splits_sentences() {
        // Skip when libespeak-ng is unavailable in the execution environment.
        let Ok(extractor) = PhonemeExtractor::new(None, None, None, DEFAULT_PHONEMIZE_TIMEOUT)
        else {
            return;
        };
        let extraction = extractor.extract("Hello world. How are you?");
        assert!(!extraction.is_degraded(), "{extraction:?}");
        assert_eq!(extraction.sentences.len(), 2, "{extraction:?}");
        assert!(extraction.sentences.iter().all(|s| !s.trim().is_empty()));
        assert_eq!(extractor.open_channels(), 0);
    }

    #[test]
    fn real_espeak_survives_a_replaced_extractor() {
        let Ok(old) = PhonemeExtractor::new(None, None, None, DEFAULT_PHONEMIZE_TIMEOUT) else {
            return;
        };
        let Ok(new) = PhonemeExtractor::new(None, None, None, DEFAULT_PHONEMIZE_TIMEOUT) else {
            return;
        };
        drop(old);
        let extraction = new.extract("Hello world.");
        assert!(!extraction.is_degraded(), "{extraction:?}");
        assert!(!extraction.is_empty());
    }
}
