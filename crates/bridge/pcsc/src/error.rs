//! Mapping of PC/SC status codes

use xfs_bridge_core::ScardError;

/// Map a PC/SC error onto the resource manager error of the bridge
pub const fn scard_error(error: pcsc::Error) -> ScardError {
    match error {
        pcsc::Error::Cancelled => ScardError::Cancelled,
        pcsc::Error::Timeout => ScardError::Timeout,
        pcsc::Error::InvalidHandle => ScardError::InvalidHandle,
        pcsc::Error::NoService | pcsc::Error::ServiceStopped => ScardError::NoService,
        pcsc::Error::ReaderUnavailable => ScardError::ReaderUnavailable,
        pcsc::Error::SharingViolation => ScardError::SharingViolation,
        pcsc::Error::CommError => ScardError::CommError,
        pcsc::Error::NoSmartcard => ScardError::NoSmartcard,
        pcsc::Error::RemovedCard => ScardError::RemovedCard,
        pcsc::Error::ResetCard => ScardError::ResetCard,
        pcsc::Error::UnknownReader => ScardError::UnknownReader,
        pcsc::Error::NoReadersAvailable => ScardError::NoReadersAvailable,
        other => ScardError::Other(other as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfs_bridge_core::xfs::ResultCode;

    #[test]
    fn test_scard_error() {
        assert_eq!(scard_error(pcsc::Error::Timeout), ScardError::Timeout);
        assert_eq!(scard_error(pcsc::Error::ServiceStopped), ScardError::NoService);
        assert_eq!(
            scard_error(pcsc::Error::SharingViolation).translate(),
            ResultCode::Locked
        );
        assert!(matches!(
            scard_error(pcsc::Error::InsufficientBuffer),
            ScardError::Other(_)
        ));
    }
}
