//! Unix file-descriptor endpoint
//!
//! Reads and writes wait in `poll(2)` on the descriptor together with a
//! wake socket. Closing the endpoint writes to the wake socket first, so a
//! thread parked in `poll` returns immediately and sees the endpoint
//! closed instead of waiting on a descriptor that no longer exists.

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, trace};

use super::serial::{DataBits, FlowControl, Parity, SerialSettings, StopBits};
use crate::core::endpoint::{closed_error, Endpoint, EndpointKind, IoMode};

const CLOSED: RawFd = -1;

/// Level-triggered cancellation signal: once written, always readable
struct WakeSocket {
    rx: UnixStream,
    tx: UnixStream,
}

impl WakeSocket {
    fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        Ok(Self { rx, tx })
    }

    fn signal(&self) {
        let _ = (&self.tx).write(&[1]);
    }
}

pub struct FdEndpoint {
    name: String,
    fd: AtomicI32,
    kind: EndpointKind,
    mode: IoMode,
    wake: WakeSocket,
}

impl FdEndpoint {
    /// Take ownership of `fd` and classify it
    pub fn adopt(name: &str, fd: OwnedFd, local: bool) -> io::Result<Self> {
        let file = File::from(fd);
        let file_type = file.metadata()?.file_type();

        let (kind, mode) = if file_type.is_socket() {
            (EndpointKind::Socket, IoMode::Polled)
        } else if file_type.is_fifo() {
            (EndpointKind::Pipe, IoMode::Polled)
        } else if file_type.is_char_device() && file.is_terminal() {
            let kind = if local {
                EndpointKind::Console
            } else {
                EndpointKind::Serial
            };
            (kind, IoMode::Polled)
        } else if file_type.is_file() {
            // Always readable; poll would spin
            (EndpointKind::File, IoMode::Blocking)
        } else {
            (EndpointKind::Other, IoMode::Polled)
        };

        let wake = WakeSocket::new()?;
        debug!("{}: {} ({:?})", name, kind, mode);

        Ok(Self {
            name: name.to_string(),
            fd: AtomicI32::new(file.into_raw_fd()),
            kind,
            mode,
            wake,
        })
    }

    fn raw(&self) -> io::Result<RawFd> {
        match self.fd.load(Ordering::SeqCst) {
            CLOSED => Err(closed_error()),
            fd => Ok(fd),
        }
    }

    /// Block until `fd` is ready for `events` or the endpoint is closed
    fn wait(&self, fd: RawFd, events: libc::c_short) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 || fds[0].revents & libc::POLLNVAL != 0 {
                return Err(closed_error());
            }
            // POLLHUP and POLLERR fall through; the call itself reports them
            return Ok(());
        }
    }

    /// Put a tty into raw mode with the given line settings
    pub fn configure_serial(&self, settings: &SerialSettings) -> io::Result<()> {
        let fd = self.raw()?;
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        cvt(unsafe { libc::tcgetattr(fd, &mut tio) })?;
        unsafe { libc::cfmakeraw(&mut tio) };

        tio.c_cflag |= libc::CLOCAL | libc::CREAD;

        tio.c_cflag &= !libc::CSIZE;
        tio.c_cflag |= match settings.data_bits {
            DataBits::Five => libc::CS5,
            DataBits::Six => libc::CS6,
            DataBits::Seven => libc::CS7,
            DataBits::Eight => libc::CS8,
        };

        tio.c_cflag &= !(libc::PARENB | libc::PARODD);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            tio.c_cflag &= !libc::CMSPAR;
        }
        match settings.parity {
            Parity::None => {}
            Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => tio.c_cflag |= libc::PARENB,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Parity::Mark => tio.c_cflag |= libc::PARENB | libc::PARODD | libc::CMSPAR,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Parity::Space => tio.c_cflag |= libc::PARENB | libc::CMSPAR,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Parity::Mark | Parity::Space => {
                return Err(unsupported("mark/space parity is not supported on this platform"))
            }
        }

        match settings.stop_bits {
            StopBits::One => tio.c_cflag &= !libc::CSTOPB,
            StopBits::Two => tio.c_cflag |= libc::CSTOPB,
            StopBits::OnePointFive => {
                return Err(unsupported("1.5 stop bits are not supported on this platform"))
            }
        }

        tio.c_cflag &= !libc::CRTSCTS;
        tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
        match settings.flow_control {
            FlowControl::None => {}
            FlowControl::Software => tio.c_iflag |= libc::IXON | libc::IXOFF,
            FlowControl::Hardware => tio.c_cflag |= libc::CRTSCTS,
        }

        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;

        let speed = baud_constant(settings.baud_rate)?;
        cvt(unsafe { libc::cfsetispeed(&mut tio, speed) })?;
        cvt(unsafe { libc::cfsetospeed(&mut tio, speed) })?;
        cvt(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) })?;
        cvt(unsafe { libc::tcflush(fd, libc::TCIOFLUSH) })?;

        debug!("{}: serial line set to {}", self.name, settings);
        Ok(())
    }
}

impl Endpoint for FdEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn mode(&self) -> IoMode {
        self.mode
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        if self.mode == IoMode::Polled {
            self.wait(fd, libc::POLLIN)?;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return pending_or(io::Error::last_os_error());
        }
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        trace!("{}: read {} bytes", self.name, n);
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        if self.mode == IoMode::Polled {
            self.wait(fd, libc::POLLOUT)?;
        }

        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return pending_or(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self) {
        let fd = self.fd.swap(CLOSED, Ordering::SeqCst);
        if fd == CLOSED {
            return;
        }
        self.wake.signal();
        unsafe { libc::close(fd) };
        debug!("{}: closed", self.name);
    }

    fn is_closed(&self) -> bool {
        self.fd.load(Ordering::SeqCst) == CLOSED
    }
}

impl Drop for FdEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a remote channel by path: Unix sockets are connected, anything
/// else (FIFO, tty, file) is opened read/write without blocking.
pub fn open(path: &str) -> io::Result<FdEndpoint> {
    let meta = std::fs::metadata(path)?;
    if meta.file_type().is_socket() {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        return FdEndpoint::adopt(path, stream.into(), false);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)?;
    FdEndpoint::adopt(path, file.into(), false)
}

/// Private copies of descriptors 0 and 1.
///
/// The copies share the open file description with the originals, so they
/// are left in blocking mode; the poll in front of every call keeps a
/// read from parking where `close` cannot reach it.
pub fn stdio() -> io::Result<(FdEndpoint, FdEndpoint)> {
    let input = io::stdin().as_fd().try_clone_to_owned()?;
    let output = io::stdout().as_fd().try_clone_to_owned()?;
    Ok((
        FdEndpoint::adopt("stdin", input, true)?,
        FdEndpoint::adopt("stdout", output, true)?,
    ))
}

fn pending_or(err: io::Error) -> io::Result<usize> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
        _ => Err(err),
    }
}

fn cvt(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn unsupported(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, msg.to_string())
}

fn baud_constant(rate: u32) -> io::Result<libc::speed_t> {
    let speed = match rate {
        50 => libc::B50,
        75 => libc::B75,
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460800 => libc::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        500000 => libc::B500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        576000 => libc::B576000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921600 => libc::B921600,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1000000 => libc::B1000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1500000 => libc::B1500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2000000 => libc::B2000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3000000 => libc::B3000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        4000000 => libc::B4000000,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", rate),
            ))
        }
    };
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn socket_pair() -> (FdEndpoint, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (FdEndpoint::adopt("pair", ours.into(), false).unwrap(), theirs)
    }

    #[test]
    fn test_socket_pair_roundtrip() {
        let (endpoint, mut peer) = socket_pair();
        assert_eq!(endpoint.kind(), EndpointKind::Socket);
        assert_eq!(endpoint.mode(), IoMode::Polled);

        assert_eq!(endpoint.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        let mut buf = [0u8; 16];
        let n = endpoint.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_peer_close_is_end_of_stream() {
        let (endpoint, peer) = socket_pair();
        drop(peer);
        let mut buf = [0u8; 16];
        let err = endpoint.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_close_releases_blocked_read() {
        let (endpoint, _peer) = socket_pair();
        let endpoint = Arc::new(endpoint);

        let reader = {
            let endpoint = endpoint.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                endpoint.read(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        endpoint.close();
        endpoint.close();

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(endpoint.is_closed());
        assert_eq!(endpoint.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_open_unix_socket_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let endpoint = open(path.to_str().unwrap()).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Socket);

        let (mut accepted, _) = listener.accept().unwrap();
        endpoint.write(b"hi").unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_open_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.fifo");
        let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let endpoint = open(path.to_str().unwrap()).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::Pipe);

        // Opened read/write, so our own writes come back
        endpoint.write(b"loop").unwrap();
        let mut buf = [0u8; 8];
        let n = endpoint.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"loop");
    }

    #[test]
    fn test_open_regular_file_is_blocking() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let endpoint = open(file.path().to_str().unwrap()).unwrap();
        assert_eq!(endpoint.kind(), EndpointKind::File);
        assert_eq!(endpoint.mode(), IoMode::Blocking);

        let mut buf = [0u8; 8];
        assert_eq!(
            endpoint.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let err = open(path.to_str().unwrap()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_unsupported_baud_rate() {
        assert!(baud_constant(9600).is_ok());
        assert_eq!(
            baud_constant(12345).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_serial_settings_rejected_on_non_tty() {
        let (endpoint, _peer) = socket_pair();
        assert!(endpoint.configure_serial(&SerialSettings::default()).is_err());
    }
}
