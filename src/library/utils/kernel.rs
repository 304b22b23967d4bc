use libc::{LOG_EMERG, LOG_USER, closelog, openlog, syslog};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use tracing::error;

/// Last words of a reactor whose ring went bad. There is no supervisor to
/// restart it and the connections it owned are unreachable, so the whole
/// process goes down loudly.
pub fn abort_on_fault(message: &str) -> ! {
    error!("{}", message);
    error!("Reactor lost its ring. Closing portal...");

    // syslog wants a C string; interior NULs would only truncate the message.
    let line = CString::new(message.replace('\0', " ")).unwrap_or_default();
    unsafe {
        openlog(std::ptr::null(), 0, LOG_USER);
        syslog(LOG_EMERG, c"%s".as_ptr(), line.as_ptr());
        closelog();
    }
    if let Ok(mut file) = OpenOptions::new().write(true).open("/dev/kmsg") {
        let _ = writeln!(file, "<3>Tachyon: {}", message); // <3> = error priority
    }
    std::process::abort()
}
