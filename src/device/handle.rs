//! Windows handle endpoint
//!
//! The remote channel is opened with `FILE_FLAG_OVERLAPPED`. Every
//! operation is submitted asynchronously and then waited on together with
//! the endpoint's cancel event, so `close` can release a worker parked in
//! the wait. The standard handles are synchronous: pipes are peeked and
//! consoles are waited on before reading.

use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use tracing::{debug, trace};
use windows::core::PCWSTR;
use windows::Win32::Devices::Communication::{
    GetCommState, PurgeComm, SetCommState, SetCommTimeouts, COMMTIMEOUTS, DCB, EVENPARITY,
    MARKPARITY, NOPARITY, ODDPARITY, ONE5STOPBITS, ONESTOPBIT, PURGE_RXCLEAR, PURGE_TXCLEAR,
    SPACEPARITY, TWOSTOPBITS,
};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING, ERROR_NO_DATA,
    ERROR_OPERATION_ABORTED, ERROR_PIPE_BUSY, ERROR_PIPE_NOT_CONNECTED, GENERIC_READ,
    GENERIC_WRITE, HANDLE, WAIT_OBJECT_0, WIN32_ERROR,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetFileType, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_SHARE_MODE,
    FILE_TYPE_CHAR, FILE_TYPE_DISK, FILE_TYPE_PIPE, OPEN_EXISTING,
};
use windows::Win32::System::Console::{
    GetStdHandle, PeekConsoleInputW, ReadConsoleInputW, INPUT_RECORD, KEY_EVENT,
    STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Pipes::PeekNamedPipe;
use windows::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use super::serial::{FlowControl, Parity, SerialSettings, StopBits};
use crate::core::endpoint::{closed_error, Endpoint, EndpointKind, IoMode};

/// Manual-reset event
struct Event(HANDLE);

// Safety: event handles may be signalled and waited on from any thread
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn new() -> io::Result<Self> {
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(to_io)?;
        Ok(Self(handle))
    }

    fn set(&self) {
        unsafe {
            let _ = SetEvent(self.0);
        }
    }

    fn reset(&self) {
        unsafe {
            let _ = ResetEvent(self.0);
        }
    }

    fn is_set(&self) -> bool {
        unsafe { WaitForSingleObject(self.0, 0) == WAIT_OBJECT_0 }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Where a handle came from, which decides how it is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Remote,
    Input,
    Output,
}

pub struct HandleEndpoint {
    name: String,
    handle: AtomicPtr<c_void>,
    kind: EndpointKind,
    mode: IoMode,
    cancel: Event,
    read_done: Event,
    write_done: Event,
    /// File positions, only used for disk files opened overlapped
    read_offset: AtomicU64,
    write_offset: AtomicU64,
}

impl HandleEndpoint {
    fn adopt(name: &str, handle: HANDLE, origin: Origin) -> io::Result<Self> {
        if handle.is_invalid() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{}: no handle", name)));
        }

        let file_type = unsafe { GetFileType(handle) };
        let kind = match file_type {
            FILE_TYPE_CHAR if origin == Origin::Remote => EndpointKind::Serial,
            FILE_TYPE_CHAR => EndpointKind::Console,
            FILE_TYPE_PIPE => EndpointKind::Pipe,
            FILE_TYPE_DISK => EndpointKind::File,
            _ => EndpointKind::Other,
        };
        let mode = match (origin, kind) {
            (Origin::Remote, _) => IoMode::Overlapped,
            (Origin::Input, EndpointKind::Console | EndpointKind::Pipe) => IoMode::Polled,
            _ => IoMode::Blocking,
        };
        debug!("{}: {} ({:?})", name, kind, mode);

        Ok(Self {
            name: name.to_string(),
            handle: AtomicPtr::new(handle.0),
            kind,
            mode,
            cancel: Event::new()?,
            read_done: Event::new()?,
            write_done: Event::new()?,
            read_offset: AtomicU64::new(0),
            write_offset: AtomicU64::new(0),
        })
    }

    fn raw(&self) -> io::Result<HANDLE> {
        let handle = self.handle.load(Ordering::SeqCst);
        if handle.is_null() {
            return Err(closed_error());
        }
        Ok(HANDLE(handle))
    }

    /// Submit one overlapped operation and wait for it or for `close`
    fn overlapped<F>(&self, handle: HANDLE, done: &Event, offset: &AtomicU64, submit: F) -> io::Result<usize>
    where
        F: FnOnce(*mut OVERLAPPED) -> windows::core::Result<()>,
    {
        done.reset();
        let mut ov = OVERLAPPED {
            hEvent: done.0,
            ..Default::default()
        };
        if self.kind == EndpointKind::File {
            let position = offset.load(Ordering::SeqCst);
            unsafe {
                ov.Anonymous.Anonymous.Offset = position as u32;
                ov.Anonymous.Anonymous.OffsetHigh = (position >> 32) as u32;
            }
        }

        match submit(ptr::addr_of_mut!(ov)) {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                let waited = unsafe { WaitForMultipleObjects(&[done.0, self.cancel.0], false, INFINITE) };
                if waited != WAIT_OBJECT_0 {
                    // The kernel still owns `ov` and the buffer until the
                    // aborted operation signals its event
                    unsafe {
                        let _ = CancelIoEx(handle, Some(ptr::addr_of!(ov)));
                        WaitForSingleObject(done.0, INFINITE);
                    }
                    return Err(closed_error());
                }
            }
            Err(e) => return Err(to_io(e)),
        }

        let mut transferred = 0u32;
        unsafe { GetOverlappedResult(handle, &ov, &mut transferred, false) }.map_err(to_io)?;
        if self.kind == EndpointKind::File {
            offset.fetch_add(u64::from(transferred), Ordering::SeqCst);
        }
        Ok(transferred as usize)
    }

    /// Wait until the console has a typed character or the endpoint closes.
    /// Non-key input records (focus, mouse, key-up) are discarded.
    fn console_ready(&self, handle: HANDLE) -> io::Result<bool> {
        let waited = unsafe { WaitForMultipleObjects(&[handle, self.cancel.0], false, INFINITE) };
        if waited != WAIT_OBJECT_0 {
            return Err(closed_error());
        }

        let mut records = [INPUT_RECORD::default(); 64];
        let mut count = 0u32;
        unsafe { PeekConsoleInputW(handle, &mut records, &mut count) }.map_err(to_io)?;
        let pending = &records[..count as usize];

        let has_text = pending.iter().any(|record| {
            record.EventType == KEY_EVENT as u16
                && unsafe {
                    record.Event.KeyEvent.bKeyDown.as_bool()
                        && record.Event.KeyEvent.uChar.UnicodeChar != 0
                }
        });
        if !has_text && count > 0 {
            let mut discarded = 0u32;
            unsafe { ReadConsoleInputW(handle, &mut records[..count as usize], &mut discarded) }
                .map_err(to_io)?;
        }
        Ok(has_text)
    }

    /// Bytes waiting in a pipe; a closed writer is end of stream
    fn pipe_available(&self, handle: HANDLE) -> io::Result<u32> {
        if self.cancel.is_set() {
            return Err(closed_error());
        }
        let mut available = 0u32;
        unsafe { PeekNamedPipe(handle, None, 0, None, Some(&mut available), None) }.map_err(to_io)?;
        Ok(available)
    }

    pub fn configure_serial(&self, settings: &SerialSettings) -> io::Result<()> {
        let handle = self.raw()?;

        let mut dcb = DCB {
            DCBlength: std::mem::size_of::<DCB>() as u32,
            ..Default::default()
        };
        unsafe { GetCommState(handle, &mut dcb) }.map_err(to_io)?;

        dcb.BaudRate = settings.baud_rate;
        dcb.ByteSize = settings.data_bits.bits();
        dcb.Parity = match settings.parity {
            Parity::None => NOPARITY,
            Parity::Odd => ODDPARITY,
            Parity::Even => EVENPARITY,
            Parity::Mark => MARKPARITY,
            Parity::Space => SPACEPARITY,
        };
        dcb.StopBits = match settings.stop_bits {
            StopBits::One => ONESTOPBIT,
            StopBits::OnePointFive => ONE5STOPBITS,
            StopBits::Two => TWOSTOPBITS,
        };
        dcb._bitfield = dcb_flags(settings);

        unsafe { SetCommState(handle, &dcb) }.map_err(to_io)?;

        // Return as soon as anything arrives, or empty after 100 ms
        let timeouts = COMMTIMEOUTS {
            ReadIntervalTimeout: u32::MAX,
            ReadTotalTimeoutMultiplier: u32::MAX,
            ReadTotalTimeoutConstant: 100,
            WriteTotalTimeoutMultiplier: 0,
            WriteTotalTimeoutConstant: 0,
        };
        unsafe { SetCommTimeouts(handle, &timeouts) }.map_err(to_io)?;
        unsafe {
            let _ = PurgeComm(handle, PURGE_RXCLEAR | PURGE_TXCLEAR);
        }

        debug!("{}: serial line set to {}", self.name, settings);
        Ok(())
    }
}

/// DCB bitfield: fBinary, fParity, fOutxCtsFlow, fDtrControl, fOutX, fInX,
/// fRtsControl
fn dcb_flags(settings: &SerialSettings) -> u32 {
    const BINARY: u32 = 1 << 0;
    const PARITY: u32 = 1 << 1;
    const OUTX_CTS_FLOW: u32 = 1 << 2;
    const DTR_ENABLE: u32 = 1 << 4;
    const OUTX: u32 = 1 << 8;
    const INX: u32 = 1 << 9;
    const RTS_ENABLE: u32 = 1 << 12;
    const RTS_HANDSHAKE: u32 = 2 << 12;

    let mut flags = BINARY | DTR_ENABLE;
    if settings.parity != Parity::None {
        flags |= PARITY;
    }
    flags |= match settings.flow_control {
        FlowControl::None => RTS_ENABLE,
        FlowControl::Software => RTS_ENABLE | OUTX | INX,
        FlowControl::Hardware => RTS_HANDSHAKE | OUTX_CTS_FLOW,
    };
    flags
}

impl Endpoint for HandleEndpoint {
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
        let handle = self.raw()?;
        let n = match (self.mode, self.kind) {
            (IoMode::Overlapped, _) => {
                let len = buf.len();
                let ptr = buf.as_mut_ptr();
                self.overlapped(handle, &self.read_done, &self.read_offset, |ov| unsafe {
                    ReadFile(
                        handle,
                        Some(std::slice::from_raw_parts_mut(ptr, len)),
                        None,
                        Some(ov),
                    )
                })?
            }
            (IoMode::Polled, EndpointKind::Pipe) => {
                let available = self.pipe_available(handle)?;
                if available == 0 {
                    return Ok(0);
                }
                let len = buf.len().min(available as usize);
                sync_read(handle, &mut buf[..len])?
            }
            (IoMode::Polled, _) => {
                if !self.console_ready(handle)? {
                    return Ok(0);
                }
                sync_read(handle, buf)?
            }
            (_, _) => sync_read(handle, buf)?,
        };

        if n == 0 && !buf.is_empty() && self.kind != EndpointKind::Serial {
            // Serial reads time out empty; anything else reading nothing is at its end
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        trace!("{}: read {} bytes", self.name, n);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.raw()?;
        if self.mode == IoMode::Overlapped {
            let len = buf.len();
            let ptr = buf.as_ptr();
            return self.overlapped(handle, &self.write_done, &self.write_offset, |ov| unsafe {
                WriteFile(handle, Some(std::slice::from_raw_parts(ptr, len)), None, Some(ov))
            });
        }

        let mut written = 0u32;
        unsafe { WriteFile(handle, Some(buf), Some(&mut written), None) }.map_err(to_io)?;
        Ok(written as usize)
    }

    fn close(&self) {
        let handle = self.handle.swap(ptr::null_mut(), Ordering::SeqCst);
        if handle.is_null() {
            return;
        }
        self.cancel.set();
        unsafe {
            let _ = CloseHandle(HANDLE(handle));
        }
        debug!("{}: closed", self.name);
    }

    fn is_closed(&self) -> bool {
        self.handle.load(Ordering::SeqCst).is_null()
    }
}

impl Drop for HandleEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn sync_read(handle: HANDLE, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0u32;
    unsafe { ReadFile(handle, Some(buf), Some(&mut read), None) }.map_err(to_io)?;
    Ok(read as usize)
}

/// Open the remote channel (named pipe, COM port) for overlapped I/O
pub fn open(path: &str) -> io::Result<HandleEndpoint> {
    let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            GENERIC_READ.0 | GENERIC_WRITE.0,
            FILE_SHARE_MODE(0),
            None,
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            HANDLE::default(),
        )
    }
    .map_err(to_io)?;
    HandleEndpoint::adopt(path, handle, Origin::Remote)
}

/// The process standard input and output handles
pub fn stdio() -> io::Result<(HandleEndpoint, HandleEndpoint)> {
    let input = unsafe { GetStdHandle(STD_INPUT_HANDLE) }.map_err(to_io)?;
    let output = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }.map_err(to_io)?;
    Ok((
        HandleEndpoint::adopt("stdin", input, Origin::Input)?,
        HandleEndpoint::adopt("stdout", output, Origin::Output)?,
    ))
}

/// Translate a Win32 failure into the error kinds the engine classifies
fn to_io(err: windows::core::Error) -> io::Error {
    let code = err.code().0 as u32;
    if code & 0xFFFF_0000 != 0x8007_0000 {
        return io::Error::other(err);
    }
    let win32 = WIN32_ERROR(code & 0xFFFF);
    match win32 {
        ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED | ERROR_NO_DATA => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        ERROR_HANDLE_EOF => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        ERROR_PIPE_BUSY => io::Error::new(io::ErrorKind::WouldBlock, err),
        ERROR_OPERATION_ABORTED => closed_error(),
        _ => io::Error::from_raw_os_error(win32.0 as i32),
    }
}
