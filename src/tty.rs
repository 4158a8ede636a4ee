//! Opening the expander's serial device.
//!
//! The expander enumerates as a USB CDC device. The line settings do not
//! matter for the USB link itself, but the TTY layer has to be switched
//! to raw mode so it passes every byte through untouched.

use std::{
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
};

use tracing::debug;

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Open a serial device in raw, non-blocking mode at 115200 baud.
///
/// Reads from the returned file fail with `WouldBlock` when no data is
/// pending.
pub fn open(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;
    let fd = file.as_raw_fd();

    // SAFETY: termios is a plain C struct for which all zeroes is a
    // valid value. tcgetattr overwrites it below.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` stays open for as long as `file` lives and `termios`
    // is a valid, exclusively borrowed struct.
    check(unsafe { libc::tcgetattr(fd, &mut termios) })?;

    // SAFETY: These only modify the struct we own.
    unsafe {
        libc::cfmakeraw(&mut termios);
        check(libc::cfsetispeed(&mut termios, libc::B115200))?;
        check(libc::cfsetospeed(&mut termios, libc::B115200))?;
    }

    termios.c_cc[libc::VMIN] = 0;
    termios.c_cc[libc::VTIME] = 0;

    // SAFETY: See above.
    check(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) })?;

    debug!("opened {} in raw mode", path.display());
    Ok(file)
}
