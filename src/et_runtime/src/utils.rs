//! Basic utils

use crate::error::{Error, Result};

/// Queue element accepted.
pub const VQ_OK: i32 = 0;
/// Queue has no free slot.
pub const VQ_FULL: i32 = -1;
/// Element larger than a queue slot.
pub const VQ_OVERSIZED: i32 = -2;
/// Destination buffer smaller than the element.
pub const VQ_TRUNCATED: i32 = -3;
/// The peer end of the queue is gone.
pub const VQ_DISCONNECTED: i32 = -4;

/// Raw transport status codes into `Result`.
pub(crate) trait ToResult {
    type Output;
    fn to_result(self) -> Result<Self::Output>;
}

/// `push_command` status: 0 on success.
impl ToResult for i8 {
    type Output = ();
    fn to_result(self) -> Result<()> {
        match self as i32 {
            VQ_OK => Ok(()),
            code => Err(transport_error(code)),
        }
    }
}

/// `pop_command` status: element length, 0 when empty, negative on failure.
impl ToResult for i32 {
    type Output = usize;
    fn to_result(self) -> Result<usize> {
        if self >= 0 {
            Ok(self as usize)
        } else {
            Err(transport_error(self))
        }
    }
}

fn transport_error(code: i32) -> Error {
    let reason = match code {
        VQ_FULL => "queue full",
        VQ_OVERSIZED => "element larger than a queue slot",
        VQ_TRUNCATED => "receive buffer too small",
        VQ_DISCONNECTED => "queue disconnected",
        _ => "unknown status",
    };
    log::warn!("Transport Error {} ({})", code, reason);
    Error::TransportFailure(format!("{} ({})", reason, code))
}

/// Round `value` up to a multiple of `align`; `align == 0` leaves it unchanged.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(0i8.to_result(), Ok(()));
        assert!(matches!((-1i8).to_result(), Err(Error::TransportFailure(_))));
        assert_eq!(12i32.to_result(), Ok(12));
        assert_eq!(0i32.to_result(), Ok(0));
        assert!(matches!((-3i32).to_result(), Err(Error::TransportFailure(_))));
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(4, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(5, 0), 5);
        assert_eq!(align_up(100, 64), 128);
    }
}
