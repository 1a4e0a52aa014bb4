//! Completion-Waiter
//!
//! Issues one read or write against an endpoint and reduces whatever the
//! OS reported into three outcomes: bytes transferred, end of stream, or
//! some other failure. Submitting and waiting on the completion signal is
//! the endpoint's job (see `crate::device`); this module decides what the
//! result means for the worker that asked.

use std::io;

use thiserror::Error;

use super::endpoint::Endpoint;

/// A single operation to perform
pub enum Operation<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Why an operation did not complete
#[derive(Debug, Error)]
pub enum Failure {
    /// The other side closed the connection
    #[error("connection closed by peer")]
    EndOfStream,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of one operation: bytes transferred (possibly zero) or a failure
pub type Completion = Result<usize, Failure>;

/// Run `op` against `endpoint` and wait for its definite outcome.
///
/// Never retries; a failure is final for the caller.
pub fn perform(endpoint: &dyn Endpoint, op: Operation<'_>) -> Completion {
    let result = match op {
        Operation::Read(buf) => endpoint.read(buf),
        Operation::Write(buf) => endpoint.write(buf),
    };
    classify(result)
}

/// Map a raw OS result onto the three outcomes
pub fn classify(result: io::Result<usize>) -> Completion {
    match result {
        Ok(n) => Ok(n),
        Err(err) => match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Err(Failure::EndOfStream),
            // Nothing ready yet is an empty read, not a failure
            io::ErrorKind::WouldBlock => Ok(0),
            _ => Err(Failure::Io(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryEndpoint;

    #[test]
    fn test_classify_outcomes() {
        assert!(matches!(classify(Ok(12)), Ok(12)));
        assert!(matches!(classify(Ok(0)), Ok(0)));

        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(
                matches!(classify(Err(kind.into())), Err(Failure::EndOfStream)),
                "{:?} should be end of stream",
                kind
            );
        }

        assert!(matches!(
            classify(Err(io::ErrorKind::WouldBlock.into())),
            Ok(0)
        ));
        assert!(matches!(
            classify(Err(io::ErrorKind::PermissionDenied.into())),
            Err(Failure::Io(_))
        ));
    }

    #[test]
    fn test_perform_read_and_write() {
        let endpoint = MemoryEndpoint::new("mem");
        endpoint.push(b"abc");

        let mut buf = [0u8; 8];
        let n = perform(&endpoint, Operation::Read(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"abc");

        let n = perform(&endpoint, Operation::Write(b"xyz")).unwrap();
        assert_eq!(n, 3);
        assert_eq!(endpoint.written(), b"xyz");
    }

    #[test]
    fn test_perform_after_close_fails() {
        let endpoint = MemoryEndpoint::new("mem");
        endpoint.close();

        let mut buf = [0u8; 8];
        let result = perform(&endpoint, Operation::Read(&mut buf));
        assert!(matches!(result, Err(Failure::Io(_))));
    }

    #[test]
    fn test_perform_reports_peer_close() {
        let endpoint = MemoryEndpoint::new("mem");
        endpoint.push_eof();

        let mut buf = [0u8; 8];
        let result = perform(&endpoint, Operation::Read(&mut buf));
        assert!(matches!(result, Err(Failure::EndOfStream)));
    }
}
