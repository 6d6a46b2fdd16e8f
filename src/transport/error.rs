use std::io;

use crate::transport::frame::MAX_PACKET_LEN;

/// Failures of the connection pool and its framing. Callers branch on the kind: a broken
///  connection retires one TCP leg and is recoverable, a closed pool is terminal.
#[derive(Debug, thiserror::Error)]
pub enum MctcpError {
    #[error("broken connection: {0}")]
    BrokenConnection(#[source] io::Error),
    #[error("pool closed")]
    Closed,
    #[error("packet too long: {0} bytes, maximum is {max}", max = MAX_PACKET_LEN)]
    PacketTooLong(usize),
}

impl MctcpError {
    pub fn is_broken_connection(&self) -> bool {
        matches!(self, MctcpError::BrokenConnection(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, MctcpError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, MctcpError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::broken(MctcpError::BrokenConnection(io::ErrorKind::UnexpectedEof.into()), true, false)]
    #[case::closed(MctcpError::Closed, false, true)]
    #[case::too_long(MctcpError::PacketTooLong(70000), false, false)]
    fn test_classification(#[case] error: MctcpError, #[case] broken: bool, #[case] closed: bool) {
        assert_eq!(error.is_broken_connection(), broken);
        assert_eq!(error.is_closed(), closed);
    }

    #[test]
    fn test_anyhow_downcast() {
        let e: anyhow::Error = MctcpError::Closed.into();
        assert!(e.downcast_ref::<MctcpError>().unwrap().is_closed());
    }
}
