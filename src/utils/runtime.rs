use std::process;

/// Worker sockets and signal hooks assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: hera-master runs on POSIX systems only");
        process::exit(2);
    }
}
