//! Conversions between bridge and PC/SC connection options

use pcsc::{Disposition as PcscDisposition, ShareMode as PcscShareMode};
use xfs_bridge_core::{Disposition, ShareMode};

/// PC/SC sharing mode for a bridge share mode
pub const fn share_mode(mode: ShareMode) -> PcscShareMode {
    match mode {
        ShareMode::Exclusive => PcscShareMode::Exclusive,
        ShareMode::Shared => PcscShareMode::Shared,
    }
}

/// PC/SC card disposition for a bridge disposition
pub const fn disposition(disposition: Disposition) -> PcscDisposition {
    match disposition {
        Disposition::Leave => PcscDisposition::LeaveCard,
        Disposition::Reset => PcscDisposition::ResetCard,
        Disposition::Unpower => PcscDisposition::UnpowerCard,
        Disposition::Eject => PcscDisposition::EjectCard,
    }
}
