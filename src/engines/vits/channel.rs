//! Call-scoped capture buffers for text written by native code to a C `FILE*`.
//!
//! espeak-ng only reports phonemes by writing to a stdio stream. Each
//! extraction acquires a fresh [`ScopedChannel`], hands its stream to the
//! library, reads the accumulated bytes back and drops the channel, which
//! closes the stream on every exit path.
//!
//! Two backends exist:
//! - [`ChannelKind::Memory`]: `open_memstream(3)`, POSIX only, no disk I/O.
//! - [`ChannelKind::TempFile`]: an anonymous temporary file opened with
//!   `fdopen`, used on Windows where no in-memory `FILE*` exists.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The C stdio stream type handed to native code.
pub type CFile = libc::FILE;

const READ_CHUNK: usize = 4096;

/// Which backend a [`ChannelFactory`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Memory,
    TempFile,
}

impl ChannelKind {
    /// The preferred backend for the target platform.
    pub fn native() -> Self {
        if cfg!(unix) {
            ChannelKind::Memory
        } else {
            ChannelKind::TempFile
        }
    }
}

/// Opens [`ScopedChannel`]s of one kind and tracks how many are still open.
#[derive(Debug, Clone)]
pub struct ChannelFactory {
    kind: ChannelKind,
    live: Arc<AtomicUsize>,
}

impl ChannelFactory {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn acquire(&self) -> io::Result<ScopedChannel> {
        let backend = match self.kind {
            #[cfg(unix)]
            ChannelKind::Memory => Backend::Memory(MemoryStream::open()?),
            #[cfg(not(unix))]
            ChannelKind::Memory => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "memory-backed streams require open_memstream",
                ))
            }
            ChannelKind::TempFile => Backend::TempFile(TempFileStream::open()?),
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(ScopedChannel {
            backend,
            live: Arc::clone(&self.live),
        })
    }

    /// Number of channels acquired from this factory and not yet dropped.
    pub fn open_channels(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self::new(ChannelKind::native())
    }
}

/// A writable C stream whose contents can be read back; closed on drop.
pub struct ScopedChannel {
    backend: Backend,
    live: Arc<AtomicUsize>,
}

impl ScopedChannel {
    /// Raw stream pointer. Valid until the channel is dropped.
    pub fn stream(&self) -> *mut CFile {
        match &self.backend {
            #[cfg(unix)]
            Backend::Memory(m) => m.stream,
            Backend::TempFile(t) => t.stream,
        }
    }

    /// Flush and return everything written to the stream so far.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.backend {
            #[cfg(unix)]
            Backend::Memory(m) => m.read_all(),
            Backend::TempFile(t) => t.read_all(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self.backend {
            #[cfg(unix)]
            Backend::Memory(_) => ChannelKind::Memory,
            Backend::TempFile(_) => ChannelKind::TempFile,
        }
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Backend {
    #[cfg(unix)]
    Memory(MemoryStream),
    TempFile(TempFileStream),
}

#[cfg(unix)]
struct MemBuffer {
    ptr: *mut libc::c_char,
    len: libc::size_t,
}

#[cfg(unix)]
struct MemoryStream {
    stream: *mut CFile,
    // open_memstream writes through pointers into this box until fclose.
    buffer: Box<MemBuffer>,
}

#[cfg(unix)]
impl MemoryStream {
    fn open() -> io::Result<Self> {
        let mut buffer = Box::new(MemBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
        });
        let buf = &mut *buffer;
        // SAFETY: both out-pointers live in a heap allocation owned by the
        // returned value, which closes the stream before freeing it.
        let stream = unsafe { libc::open_memstream(&mut buf.ptr, &mut buf.len) };
        if stream.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { stream, buffer })
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        // SAFETY: stream is open until drop.
        if unsafe { libc::fflush(self.stream) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if self.buffer.ptr.is_null() || self.buffer.len == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: after fflush, ptr/len describe the written bytes.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.buffer.ptr as *const u8, self.buffer.len) };
        Ok(bytes.to_vec())
    }
}

#[cfg(unix)]
impl Drop for MemoryStream {
    fn drop(&mut self) {
        // SAFETY: the stream was opened by open_memstream and is closed once;
        // the buffer it allocated must be released with free() afterwards.
        unsafe {
            libc::fclose(self.stream);
            libc::free(self.buffer.ptr.cast());
        }
    }
}

struct TempFileStream {
    stream: *mut CFile,
}

impl TempFileStream {
    fn open() -> io::Result<Self> {
        // Unlinked on creation (POSIX) or delete-on-close (Windows).
        let file = tempfile::tempfile()?;
        let stream = fdopen_file(file)?;
        Ok(Self { stream })
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        // SAFETY: stream is open until drop.
        unsafe {
            if libc::fflush(self.stream) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fseek(self.stream, 0, libc::SEEK_SET) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            // SAFETY: chunk is a valid writable buffer of READ_CHUNK bytes.
            let n = unsafe { libc::fread(chunk.as_mut_ptr().cast(), 1, chunk.len(), self.stream) };
            if n == 0 {
                if unsafe { libc::ferror(self.stream) } != 0 {
                    return Err(io::Error::other("reading back temporary phoneme stream failed"));
                }
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

impl Drop for TempFileStream {
    fn drop(&mut self) {
        // SAFETY: closes the FILE* and the descriptor/handle it owns.
        unsafe {
            libc::fclose(self.stream);
        }
    }
}

#[cfg(unix)]
fn fdopen_file(file: File) -> io::Result<*mut CFile> {
    use std::os::unix::io::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: fd is an owned, open descriptor; ownership moves to the FILE*.
    let stream = unsafe { libc::fdopen(fd, c"w+".as_ptr()) };
    if stream.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(stream)
}

#[cfg(windows)]
fn fdopen_file(file: File) -> io::Result<*mut CFile> {
    use std::os::windows::io::{FromRawHandle, IntoRawHandle};

    let handle = file.into_raw_handle();
    // SAFETY: handle is owned; on success the CRT descriptor takes ownership.
    let fd = unsafe { libc::open_osfhandle(handle as libc::intptr_t, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        drop(unsafe { File::from_raw_handle(handle) });
        return Err(err);
    }
    let stream = unsafe { libc::fdopen(fd, c"w+b".as_ptr()) };
    if stream.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(stream)
}
