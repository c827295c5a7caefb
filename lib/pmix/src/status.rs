use std::fmt;
use std::result;

/// Status codes shared by both sides of the wire. The numeric values are
/// stable protocol constants: zero is success, everything else is a
/// negative integer that survives pack/unpack unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    Success,
    Error,
    OutOfResource,
    ResourceBusy,
    BadParam,
    NotImplemented,
    NotSupported,
    Interrupted,
    WouldBlock,
    Unreach,
    NotFound,
    Exists,
    Timeout,
    PackMismatch,
    PackFailure,
    UnpackFailure,
    UnpackInadequateSpace,
    UnpackReadPastEnd,
    TypeMismatch,
    UnknownDataType,
    NotInitialized,
    CommFailure,
    ReadyForHandshake,
}

impl Status {
    /// Wire representation of the status.
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Error => -1,
            Status::OutOfResource => -2,
            Status::ResourceBusy => -4,
            Status::BadParam => -5,
            Status::NotImplemented => -7,
            Status::NotSupported => -8,
            Status::Interrupted => -9,
            Status::WouldBlock => -10,
            Status::Unreach => -12,
            Status::NotFound => -13,
            Status::Exists => -14,
            Status::Timeout => -15,
            Status::PackMismatch => -22,
            Status::PackFailure => -23,
            Status::UnpackFailure => -24,
            Status::UnpackInadequateSpace => -25,
            Status::UnpackReadPastEnd => -26,
            Status::TypeMismatch => -27,
            Status::UnknownDataType => -29,
            Status::NotInitialized => -44,
            Status::CommFailure => -49,
            Status::ReadyForHandshake => -50,
        }
    }

    /// Decode a status received off the wire. Unknown codes collapse into
    /// the generic error so a newer peer cannot wedge an older one.
    pub fn from_i32(code: i32) -> Status {
        match code {
            0 => Status::Success,
            -2 => Status::OutOfResource,
            -4 => Status::ResourceBusy,
            -5 => Status::BadParam,
            -7 => Status::NotImplemented,
            -8 => Status::NotSupported,
            -9 => Status::Interrupted,
            -10 => Status::WouldBlock,
            -12 => Status::Unreach,
            -13 => Status::NotFound,
            -14 => Status::Exists,
            -15 => Status::Timeout,
            -22 => Status::PackMismatch,
            -23 => Status::PackFailure,
            -24 => Status::UnpackFailure,
            -25 => Status::UnpackInadequateSpace,
            -26 => Status::UnpackReadPastEnd,
            -27 => Status::TypeMismatch,
            -29 => Status::UnknownDataType,
            -44 => Status::NotInitialized,
            -49 => Status::CommFailure,
            -50 => Status::ReadyForHandshake,
            _ => Status::Error,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Folds a status into a result, mapping success to `Ok`.
    #[inline]
    pub fn as_result(self) -> PmixResult<()> {
        match self {
            Status::Success => Ok(()),
            err => Err(err),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Status {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock => Status::WouldBlock,
            ErrorKind::Interrupted => Status::Interrupted,
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::TimedOut => Status::Timeout,
            _ => Status::CommFailure,
        }
    }
}

/// Results whose error arm is a wire status. `Err(Status::Success)` is
/// never constructed.
pub type PmixResult<T> = result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let all = [
            Status::Success,
            Status::Error,
            Status::OutOfResource,
            Status::ResourceBusy,
            Status::BadParam,
            Status::NotImplemented,
            Status::NotSupported,
            Status::Interrupted,
            Status::WouldBlock,
            Status::Unreach,
            Status::NotFound,
            Status::Exists,
            Status::Timeout,
            Status::PackMismatch,
            Status::PackFailure,
            Status::UnpackFailure,
            Status::UnpackInadequateSpace,
            Status::UnpackReadPastEnd,
            Status::TypeMismatch,
            Status::UnknownDataType,
            Status::NotInitialized,
            Status::CommFailure,
            Status::ReadyForHandshake,
        ];

        for status in &all {
            assert_eq!(Status::from_i32(status.as_i32()), *status);
            if *status != Status::Success {
                assert!(status.as_i32() < 0);
            }
        }
    }

    #[test]
    fn test_unknown_code_collapses() {
        assert_eq!(Status::from_i32(-9999), Status::Error);
        assert_eq!(Status::from_i32(17), Status::Error);
    }

    #[test]
    fn test_as_result() {
        assert!(Status::Success.as_result().is_ok());
        assert_eq!(Status::NotFound.as_result(), Err(Status::NotFound));
    }
}
