//! Runtime binding to `libespeak-ng`.
//!
//! The shared library is opened with `libloading` so the crate builds without
//! espeak-ng headers; only the handful of entry points needed to trace IPA
//! phonemes are resolved.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libloading::Library;

use super::channel::CFile;
use super::model::VitsError;

/// Voice selected when none is configured.
pub const DEFAULT_VOICE: &str = "en-us";

// espeak-ng constants (speak_lib.h)
const AUDIO_OUTPUT_SYNCHRONOUS: c_int = 0x02;
const PHONEMES_IPA: c_int = 0x02;
const CHARS_AUTO: c_uint = 0;
const PHONEMES: c_uint = 0x100;
const EE_OK: c_int = 0;

/// Candidate shared-library file names, tried in order.
#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["libespeak-ng.dll", "espeak-ng.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["libespeak-ng.dylib", "libespeak-ng.1.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_NAMES: &[&str] = &["libespeak-ng.so", "libespeak-ng.so.1"];

type InitializeFn = unsafe extern "C" fn(c_int, c_int, *const c_char, c_int) -> c_int;
type SetVoiceByNameFn = unsafe extern "C" fn(*const c_char) -> c_int;
type SetPhonemeTraceFn = unsafe extern "C" fn(c_int, *mut CFile);
type SynthFn = unsafe extern "C" fn(
    *const c_void,
    usize,
    c_uint,
    c_int,
    c_uint,
    c_uint,
    *mut c_uint,
    *mut c_void,
) -> c_int;
type TerminateFn = unsafe extern "C" fn() -> c_int;

/// Writes the phonetic transcription of `text` into a C stream.
///
/// Implemented by [`EspeakLibrary`]; tests substitute their own tracer.
pub trait PhonemeTrace {
    fn trace_phonemes(&self, text: &CStr, stream: *mut CFile) -> Result<(), VitsError>;
}

/// Process-wide espeak-ng state, shared by every [`EspeakLibrary`] handle.
///
/// The library is opened and initialized by the first handle and terminated
/// when the last one is dropped. `voice` is the voice currently selected in
/// the native state.
struct Runtime<A> {
    api: Option<A>,
    users: usize,
    voice: Option<String>,
}

impl<A> Runtime<A> {
    const fn new() -> Self {
        Self {
            api: None,
            users: 0,
            voice: None,
        }
    }

    /// Register a user, opening the library first if nobody holds it.
    fn attach(&mut self, open: impl FnOnce() -> Result<A, VitsError>) -> Result<(), VitsError> {
        if self.api.is_none() {
            self.api = Some(open()?);
            self.voice = None;
        }
        self.users += 1;
        Ok(())
    }

    /// Unregister a user. Returns true when this tore the library down.
    fn detach(&mut self) -> bool {
        self.users = self.users.saturating_sub(1);
        if self.users > 0 {
            return false;
        }
        self.voice = None;
        self.api.take().is_some()
    }
}

impl Runtime<NativeApi> {
    /// The loaded library with `voice` selected.
    fn select_voice(&mut self, voice: &str) -> Result<&NativeApi, VitsError> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| VitsError::PhonemizerFailed("espeak-ng is not loaded".to_string()))?;
        if self.voice.as_deref() != Some(voice) {
            api.set_voice(voice)?;
            self.voice = Some(voice.to_string());
        }
        Ok(api)
    }
}

// Every native call goes through this lock.
static RUNTIME: Mutex<Runtime<NativeApi>> = Mutex::new(Runtime::new());

fn runtime() -> MutexGuard<'static, Runtime<NativeApi>> {
    RUNTIME.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry points of an opened and initialized libespeak-ng.
struct NativeApi {
    set_voice_by_name: SetVoiceByNameFn,
    set_phoneme_trace: SetPhonemeTraceFn,
    synth: SynthFn,
    terminate: TerminateFn,
    path: PathBuf,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl NativeApi {
    fn open(library_dir: Option<&Path>, data_dir: Option<&Path>) -> Result<Self, VitsError> {
        let (library, path) = open_library(library_dir)?;
        log::info!("Loaded espeak-ng from {}", path.display());

        let symbol_err = |source| VitsError::LibraryLoad {
            path: path.clone(),
            source,
        };
        // SAFETY: the signatures match speak_lib.h; the pointers are only used
        // while `library` is alive, which this struct guarantees.
        let (initialize, set_voice_by_name, set_phoneme_trace, synth, terminate) = unsafe {
            (
                *library
                    .get::<InitializeFn>(b"espeak_Initialize\0")
                    .map_err(symbol_err)?,
                *library
                    .get::<SetVoiceByNameFn>(b"espeak_SetVoiceByName\0")
                    .map_err(symbol_err)?,
                *library
                    .get::<SetPhonemeTraceFn>(b"espeak_SetPhonemeTrace\0")
                    .map_err(symbol_err)?,
                *library
                    .get::<SynthFn>(b"espeak_Synth\0")
                    .map_err(symbol_err)?,
                *library
                    .get::<TerminateFn>(b"espeak_Terminate\0")
                    .map_err(symbol_err)?,
            )
        };

        let data_path = data_dir.map(path_to_cstring).transpose()?;
        let data_ptr = data_path
            .as_ref()
            .map_or(std::ptr::null(), |p| p.as_ptr());

        // SAFETY: data_ptr is null or a valid NUL-terminated path.
        let rate = unsafe { initialize(AUDIO_OUTPUT_SYNCHRONOUS, 0, data_ptr, 0) };
        if rate < 0 {
            return Err(VitsError::EspeakInit(rate));
        }
        log::debug!("espeak-ng initialized (internal rate {rate} Hz)");

        Ok(Self {
            set_voice_by_name,
            set_phoneme_trace,
            synth,
            terminate,
            path,
            _library: library,
        })
    }

    fn set_voice(&self, voice: &str) -> Result<(), VitsError> {
        let name = CString::new(voice)
            .map_err(|_| VitsError::Config(format!("voice name {voice:?} contains NUL")))?;
        // SAFETY: name is NUL-terminated and outlives the call.
        let code = unsafe { (self.set_voice_by_name)(name.as_ptr()) };
        if code != EE_OK {
            return Err(VitsError::VoiceNotSet {
                voice: voice.to_string(),
                code,
            });
        }
        log::debug!("espeak-ng voice set to {voice}");
        Ok(())
    }

    fn trace(&self, text: &CStr, stream: *mut CFile) -> Result<(), VitsError> {
        let bytes = text.to_bytes_with_nul();
        // SAFETY: stream is an open FILE* owned by the caller for the whole
        // call, and is detached again before returning.
        let code = unsafe {
            (self.set_phoneme_trace)(PHONEMES_IPA, stream);
            let code = (self.synth)(
                bytes.as_ptr().cast(),
                bytes.len(),
                0,
                0,
                0,
                CHARS_AUTO | PHONEMES,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            (self.set_phoneme_trace)(0, std::ptr::null_mut());
            code
        };

        if code != EE_OK {
            return Err(VitsError::PhonemizerFailed(format!(
                "espeak_Synth returned {code}"
            )));
        }
        Ok(())
    }
}

impl Drop for NativeApi {
    fn drop(&mut self) {
        // SAFETY: only reached with the runtime lock held and no user left.
        unsafe {
            (self.terminate)();
        }
        log::debug!("espeak-ng terminated");
    }
}

/// A handle on the process-wide espeak-ng instance with one voice.
///
/// espeak-ng keeps global state and is not reentrant. Handles share a single
/// loaded library: the first one initializes it, the last one to drop
/// terminates it, and every call is serialized on a process-wide lock. A
/// handle whose voice differs from the current one switches it before tracing.
pub struct EspeakLibrary {
    voice: String,
    path: PathBuf,
}

impl EspeakLibrary {
    /// Load libespeak-ng from `library_dir` (or the loader search path) and
    /// select `voice`.
    ///
    /// If the library is already loaded in this process it is reused, and
    /// `library_dir`/`data_dir` are ignored.
    pub fn load(
        library_dir: Option<&Path>,
        data_dir: Option<&Path>,
        voice: &str,
    ) -> Result<Self, VitsError> {
        let mut runtime = runtime();
        if runtime.users > 0 {
            log::debug!("Reusing loaded espeak-ng ({} handles)", runtime.users);
        }
        runtime.attach(|| NativeApi::open(library_dir, data_dir))?;

        let selected = runtime.select_voice(voice).map(|api| api.path.clone());
        match selected {
            Ok(path) => Ok(Self {
                voice: voice.to_string(),
                path,
            }),
            Err(e) => {
                runtime.detach();
                Err(e)
            }
        }
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PhonemeTrace for EspeakLibrary {
    fn trace_phonemes(&self, text: &CStr, stream: *mut CFile) -> Result<(), VitsError> {
        let mut runtime = runtime();
        let api = runtime.select_voice(&self.voice)?;
        api.trace(text, stream)
    }
}

impl Drop for EspeakLibrary {
    fn drop(&mut self) {
        runtime().detach();
    }
}

fn open_library(library_dir: Option<&Path>) -> Result<(Library, PathBuf), VitsError> {
    let mut last_err = None;
    for name in LIBRARY_NAMES {
        let candidate = match library_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        // SAFETY: loading espeak-ng runs no initialisers with preconditions.
        match unsafe { Library::new(&candidate) } {
            Ok(library) => return Ok((library, candidate)),
            Err(e) => {
                log::debug!("Could not load {}: {e}", candidate.display());
                last_err = Some((candidate, e));
            }
        }
    }

    // LIBRARY_NAMES is never empty.
    let (path, source) = last_err.ok_or(VitsError::EspeakNotFound)?;
    Err(VitsError::LibraryLoad { path, source })
}

fn path_to_cstring(path: &Path) -> Result<CString, VitsError> {
    CString::new(path.to_string_lossy().into_owned())
        .map_err(|_| VitsError::Config(format!("path {} contains NUL", path.display())))
}

#[cfg(test)]
mod tests {
    use super::{open_library, Runtime, LIBRARY_NAMES};
    use crate::engines::vits::model::VitsError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts teardowns the way `NativeApi` calls `espeak_Terminate`.
    struct FakeApi {
        teardowns: Arc<AtomicUsize>,
    }

    impl Drop for FakeApi {
        fn drop(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn platform_library_names_are_listed() {
        assert!(!LIBRARY_NAMES.is_empty());
        assert!(LIBRARY_NAMES.iter().all(|n| n.contains("espeak-ng")));
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        let result = open_library(Some(Path::new("/definitely/not/a/real/espeak/dir")));
        assert!(matches!(result, Err(VitsError::LibraryLoad { .. })));
    }

    #[test]
    fn library_is_shared_and_torn_down_by_the_last_handle() {
        let opens = AtomicUsize::new(0);
        let teardowns = Arc::new(AtomicUsize::new(0));
        let open = || {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok(FakeApi {
                teardowns: Arc::clone(&teardowns),
            })
        };

        let mut runtime = Runtime::new();
        runtime.attach(open).unwrap();
        runtime.voice = Some("en-us".to_string());

        // Reload: the replacement attaches, then the old handle goes away.
        runtime.attach(open).unwrap();
        assert!(!runtime.detach());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.voice.as_deref(), Some("en-us"));

        assert!(runtime.detach());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(runtime.api.is_none());
        assert!(runtime.voice.is_none());

        // A later handle initializes from scratch.
        runtime.attach(open).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(runtime.detach());
        assert_eq!(teardowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_open_registers_no_handle() {
        let mut runtime = Runtime::<FakeApi>::new();
        let result = runtime.attach(|| Err(VitsError::EspeakNotFound));
        assert!(matches!(result, Err(VitsError::EspeakNotFound)));
        assert_eq!(runtime.users, 0);
        assert!(!runtime.detach());
    }
}
