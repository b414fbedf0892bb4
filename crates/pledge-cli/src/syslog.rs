//! Minimal syslog writer for mirroring logs.
//!
//! Wired as an extra `tracing_subscriber` fmt layer when `--syslog` is
//! given; each formatted log line becomes one `LOG_INFO` record.

use std::ffi::CString;
use std::io;

use tracing_subscriber::fmt::MakeWriter;

/// Identity handed to openlog; must outlive every syslog call.
static IDENT: &[u8] = b"pledge\0";

/// Open the syslog connection. Call once before installing the layer.
pub fn open() {
    // SAFETY: IDENT is a static NUL-terminated buffer, so the pointer
    // stays valid for the lifetime of the process as openlog requires.
    unsafe {
        libc::openlog(
            IDENT.as_ptr().cast(),
            libc::LOG_PID,
            libc::LOG_DAEMON,
        );
    }
}

/// One `Write` handle; lines are forwarded as individual records.
pub struct SyslogWriter;

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(message) = CString::new(line) else {
                continue;
            };
            // SAFETY: both format and message are valid NUL-terminated C
            // strings for the duration of the call.
            unsafe {
                libc::syslog(libc::LOG_INFO, c"%s".as_ptr(), message.as_ptr());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Factory for the fmt layer.
pub struct MakeSyslogWriter;

impl<'a> MakeWriter<'a> for MakeSyslogWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter
    }
}
